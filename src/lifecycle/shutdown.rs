use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::participant::{same_participant, ParticipantOutcome, ShutdownParticipant};
use crate::concurrent::panic_message;
use crate::config::Limits;
use crate::types::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Dispatching,
    Draining,
    Complete,
}

/// Runs the stop action of every registered participant when the process
/// terminates (or when asked to), newest registration first.
///
/// Each stop action runs on its own short-lived thread so that a slow or
/// failing participant cannot hold back its siblings. The whole sequence is
/// bounded by the termination timeout; stragglers are reported and left
/// behind.
pub struct ShutdownCoordinator {
    participants: Mutex<Vec<Arc<dyn ShutdownParticipant>>>,
    termination_timeout: Duration,
    phase_tx: watch::Sender<ShutdownPhase>,
    phase_rx: watch::Receiver<ShutdownPhase>,
    hook: Mutex<Option<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    pub fn new(termination_timeout_ms: u64) -> Self {
        let (phase_tx, phase_rx) = watch::channel(ShutdownPhase::Running);
        Self {
            participants: Mutex::new(Vec::new()),
            termination_timeout: Limits::termination_timeout(termination_timeout_ms),
            phase_tx,
            phase_rx,
            hook: Mutex::new(None),
        }
    }

    pub fn termination_timeout(&self) -> Duration {
        self.termination_timeout
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase_rx.borrow()
    }

    pub fn phase_receiver(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase_rx.clone()
    }

    /// Resolves once a shutdown sequence has run to completion.
    pub async fn wait_complete(&self) {
        let mut rx = self.phase_rx.clone();
        let _ = rx.wait_for(|phase| *phase == ShutdownPhase::Complete).await;
    }

    pub fn register(&self, participant: Arc<dyn ShutdownParticipant>) {
        let mut participants = self.participants.lock();
        if participants
            .iter()
            .any(|p| same_participant(p, &participant))
        {
            tracing::debug!(name = participant.name(), "Participant already registered");
            return;
        }
        tracing::debug!(name = participant.name(), "Registering shutdown participant");
        participants.push(participant);
    }

    pub fn deregister(&self, participant: &Arc<dyn ShutdownParticipant>) -> bool {
        let mut participants = self.participants.lock();
        let before = participants.len();
        participants.retain(|p| !same_participant(p, participant));
        let removed = participants.len() != before;
        if removed {
            tracing::debug!(name = participant.name(), "Deregistered shutdown participant");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.participants.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.lock().is_empty()
    }

    /// Stops every registered participant, last registered first.
    ///
    /// Participants are taken out of the coordinator before they are
    /// dispatched, so a second invocation finds nothing to do. Such a call
    /// returns at once and leaves the phase of a sequence still in flight
    /// untouched.
    pub fn run_shutdown_sequence(&self) -> Vec<(String, ParticipantOutcome)> {
        let participants = {
            let mut registered = self.participants.lock();
            let participants = std::mem::take(&mut *registered);
            if participants.is_empty() {
                self.phase_tx.send_if_modified(|phase| match phase {
                    ShutdownPhase::Running => {
                        *phase = ShutdownPhase::Complete;
                        true
                    }
                    _ => false,
                });
                return Vec::new();
            }
            // Published under the lock so a concurrent empty call observes it.
            let _ = self.phase_tx.send(ShutdownPhase::Dispatching);
            participants
        };

        let count = participants.len();
        tracing::info!(count, "Shutdown sequence: dispatching stop actions");

        let (tx, rx) = mpsc::channel::<(usize, ParticipantOutcome)>();
        let mut names = Vec::with_capacity(count);
        let mut outcomes: Vec<Option<ParticipantOutcome>> = vec![None; count];
        let mut dispatched = 0usize;

        for (slot, participant) in participants.into_iter().rev().enumerate() {
            let name = participant.name().to_string();
            names.push(name.clone());
            let tx = tx.clone();

            let spawned = thread::Builder::new()
                .name(format!("coreutils-shutdown-{}", slot))
                .spawn(move || {
                    let outcome = stop_isolated(participant.as_ref());
                    let _ = tx.send((slot, outcome));
                });

            match spawned {
                Ok(_) => dispatched += 1,
                Err(e) => {
                    tracing::error!(name = %name, error = %e, "Failed to dispatch stop action");
                    outcomes[slot] = Some(ParticipantOutcome::Failed(e.to_string()));
                }
            }
        }
        drop(tx);

        let _ = self.phase_tx.send(ShutdownPhase::Draining);
        let deadline = Instant::now() + self.termination_timeout;
        while dispatched > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(left) {
                Ok((slot, outcome)) => {
                    outcomes[slot] = Some(outcome);
                    dispatched -= 1;
                }
                Err(_) => break,
            }
        }

        let report: Vec<(String, ParticipantOutcome)> = names
            .into_iter()
            .zip(outcomes)
            .map(|(name, outcome)| (name, outcome.unwrap_or(ParticipantOutcome::TimedOut)))
            .collect();

        let timed_out = report
            .iter()
            .filter(|(_, o)| *o == ParticipantOutcome::TimedOut)
            .count();
        if timed_out > 0 {
            tracing::warn!(
                timed_out,
                timeout_ms = self.termination_timeout.as_millis() as u64,
                "Shutdown deadline expired, abandoning remaining stop actions"
            );
        }

        let _ = self.phase_tx.send(ShutdownPhase::Complete);
        tracing::info!(count, "Shutdown sequence complete");
        report
    }

    /// Spawns a task that runs the shutdown sequence when the process receives
    /// SIGINT or SIGTERM. Installing twice is a no-op.
    pub fn install_signal_hook(self: &Arc<Self>) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            CoreError::invalid("a tokio runtime is required to install the shutdown hook")
        })?;

        let mut hook = self.hook.lock();
        if hook.is_some() {
            return Ok(());
        }

        let coordinator: Weak<Self> = Arc::downgrade(self);
        *hook = Some(runtime.spawn(async move {
            let signal = wait_for_termination_signal().await;
            let Some(coordinator) = coordinator.upgrade() else {
                return;
            };
            tracing::info!(signal, "Termination signal received, shutting down");
            if let Err(e) =
                tokio::task::spawn_blocking(move || coordinator.run_shutdown_sequence()).await
            {
                tracing::error!("Shutdown sequence panicked: {}", e);
            }
        }));
        tracing::debug!("Shutdown hook installed");
        Ok(())
    }

    /// Withdraws the signal hook and forgets every participant without
    /// stopping any of them.
    pub fn cancel(&self) {
        if let Some(hook) = self.hook.lock().take() {
            hook.abort();
        }
        let dropped = {
            let mut participants = self.participants.lock();
            let n = participants.len();
            participants.clear();
            n
        };
        tracing::debug!(dropped, "Shutdown coordinator cancelled");
    }
}

fn stop_isolated(participant: &dyn ShutdownParticipant) -> ParticipantOutcome {
    let name = participant.name();
    match catch_unwind(AssertUnwindSafe(|| participant.stop())) {
        Ok(Ok(())) => {
            tracing::debug!(name, "Participant stopped");
            ParticipantOutcome::Stopped
        }
        Ok(Err(e)) => {
            tracing::warn!(name, error = %e, "Participant failed to stop");
            ParticipantOutcome::Failed(e.to_string())
        }
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            tracing::error!(name, reason = %reason, "Participant panicked while stopping");
            ParticipantOutcome::Failed(reason)
        }
    }
}

async fn wait_for_termination_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = terminate.recv() => "SIGTERM",
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::oneshot;

use super::handle::TaskHandle;
use super::metrics::PoolMetrics;
use super::panic_message;
use crate::config::{CoreConfig, Limits};
use crate::lifecycle::{SharedResource, ShutdownParticipant};
use crate::types::{CoreError, Result};

const THREAD_NAME_PREFIX: &str = "coreutils-runner";

/// Elastic pool of worker threads: no idle minimum, grows on demand up to
/// `max_size`, and lets threads that stayed idle for `keep_alive` exit.
///
/// Backed by the blocking thread pool of a private tokio runtime.
pub struct TaskPool {
    runtime: Mutex<Option<Workers>>,
    running: AtomicBool,
    max_size: usize,
    keep_alive: Duration,
    termination_timeout: Duration,
    metrics: Arc<PoolMetrics>,
    outstanding: Arc<Outstanding>,
    thread_seq: Arc<AtomicUsize>,
}

impl TaskPool {
    pub fn new(max_size: usize, keep_alive_ms: u64, termination_timeout_ms: u64) -> Result<Self> {
        let max_size = Limits::pool_size(max_size);
        let keep_alive = Limits::keep_alive(keep_alive_ms);
        let thread_seq = Arc::new(AtomicUsize::new(0));
        let workers = Workers::build(max_size, keep_alive, &thread_seq)?;

        tracing::debug!(
            max_size,
            keep_alive_ms = keep_alive.as_millis() as u64,
            "Task pool started"
        );

        Ok(Self {
            runtime: Mutex::new(Some(workers)),
            running: AtomicBool::new(true),
            max_size,
            keep_alive,
            termination_timeout: Limits::termination_timeout(termination_timeout_ms),
            metrics: Arc::new(PoolMetrics::new()),
            outstanding: Arc::new(Outstanding::default()),
            thread_seq,
        })
    }

    pub fn from_config(config: &CoreConfig) -> Result<Self> {
        Self::new(
            config.max_pool_size,
            config.keep_alive_ms,
            config.termination_timeout_ms,
        )
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    /// Number of submitted tasks that have neither finished nor been dropped.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.count.lock()
    }

    /// Submits `work` for execution. Once the pool is stopped the returned
    /// handle is already resolved with [`CoreError::NotAccepting`].
    pub fn submit<F, T>(&self, work: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.runtime.lock();
        let workers = match guard.as_ref() {
            Some(workers) if self.running.load(Ordering::Acquire) => workers,
            _ => {
                self.metrics.inc_rejected();
                tracing::debug!("Task rejected, pool is not accepting work");
                return TaskHandle::rejected();
            }
        };

        let (tx, rx) = oneshot::channel();
        let metrics = Arc::clone(&self.metrics);
        let ticket = OutstandingTicket::issue(Arc::clone(&self.outstanding));
        let abandoned = Arc::clone(&workers.abandoned);
        metrics.inc_submitted();

        workers.runtime.spawn_blocking(move || {
            let _ticket = ticket;
            // Dropping `tx` unsent resolves the handle as cancelled.
            if abandoned.load(Ordering::Acquire) {
                metrics.inc_cancelled();
                return;
            }
            metrics.task_started();
            let result = catch_unwind(AssertUnwindSafe(work));
            metrics.task_finished(result.is_err());

            let result = result.map_err(|payload| {
                let reason = panic_message(payload.as_ref());
                let current = thread::current();
                tracing::error!(
                    thread = current.name().unwrap_or("unnamed"),
                    reason = %reason,
                    "Task terminated abnormally"
                );
                CoreError::TaskPanicked(reason)
            });
            let _ = tx.send(result);
        });

        TaskHandle::new(rx)
    }

    fn drain(&self) {
        let workers = self.runtime.lock().take();
        let deadline = Instant::now() + self.termination_timeout;

        let finished = self.outstanding.wait_idle(deadline);
        let Some(Workers { runtime, abandoned }) = workers else {
            return;
        };
        if !finished {
            // Tasks already running are left to finish on their own threads;
            // queued ones are dropped as soon as a worker picks them up.
            abandoned.store(true, Ordering::Release);
            tracing::warn!(
                outstanding = self.outstanding(),
                "Task pool did not drain in time, cancelling remaining tasks"
            );
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        // Dropping a runtime is not allowed from within an async context, so the
        // final shutdown happens on a helper thread.
        let shutdown = thread::Builder::new()
            .name(format!("{}-shutdown", THREAD_NAME_PREFIX))
            .spawn(move || runtime.shutdown_timeout(remaining));
        match shutdown {
            Ok(helper) => {
                if helper.join().is_err() {
                    tracing::error!("Task pool shutdown helper panicked");
                }
            }
            Err(e) => {
                tracing::error!("Cannot spawn task pool shutdown helper: {}", e);
            }
        }
    }
}

impl ShutdownParticipant for TaskPool {
    fn name(&self) -> &str {
        "task_pool"
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn init(&self) {
        let mut guard = self.runtime.lock();
        if guard.is_some() {
            self.running.store(true, Ordering::Release);
            return;
        }
        match Workers::build(self.max_size, self.keep_alive, &self.thread_seq) {
            Ok(workers) => {
                *guard = Some(workers);
                self.running.store(true, Ordering::Release);
                tracing::debug!("Task pool restarted");
            }
            Err(e) => tracing::error!("Failed to restart task pool: {}", e),
        }
    }

    /// Stops accepting work, waits for queued and running tasks up to the
    /// termination timeout, then drops whatever is left.
    fn stop(&self) -> Result<()> {
        if self.running.swap(false, Ordering::AcqRel) {
            self.drain();
            tracing::debug!("Task pool shutdown successfully");
        }
        Ok(())
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        if let Some(workers) = self.runtime.get_mut().take() {
            workers.abandoned.store(true, Ordering::Release);
            workers.runtime.shutdown_background();
        }
    }
}

impl SharedResource for TaskPool {
    fn as_participant(self: Arc<Self>) -> Option<Arc<dyn ShutdownParticipant>> {
        Some(self)
    }
}

/// One generation of worker threads. A restart builds a fresh one, so a
/// forced shutdown of the previous generation never affects new work.
struct Workers {
    runtime: Runtime,
    abandoned: Arc<AtomicBool>,
}

impl Workers {
    fn build(max_size: usize, keep_alive: Duration, seq: &Arc<AtomicUsize>) -> Result<Self> {
        let seq = Arc::clone(seq);
        let runtime = Builder::new_current_thread()
            .max_blocking_threads(max_size)
            .thread_keep_alive(keep_alive)
            .thread_name_fn(move || {
                format!("{}-{}", THREAD_NAME_PREFIX, seq.fetch_add(1, Ordering::Relaxed))
            })
            .build()?;
        Ok(Self {
            runtime,
            abandoned: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[derive(Default)]
struct Outstanding {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Outstanding {
    /// Returns `false` when the deadline passed with tasks still outstanding.
    fn wait_idle(&self, deadline: Instant) -> bool {
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Counts a task as outstanding from submission until it finishes or is
/// dropped unexecuted.
struct OutstandingTicket(Arc<Outstanding>);

impl OutstandingTicket {
    fn issue(outstanding: Arc<Outstanding>) -> Self {
        *outstanding.count.lock() += 1;
        Self(outstanding)
    }
}

impl Drop for OutstandingTicket {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn pool() -> TaskPool {
        TaskPool::new(4, 60_000, 1_000).unwrap()
    }

    #[test]
    fn test_submit_returns_value() {
        let pool = pool();
        let handle = pool.submit(|| 21 * 2);
        assert_eq!(handle.blocking_wait().unwrap(), 42);
        pool.stop().unwrap();
    }

    #[test]
    fn test_workers_are_named() {
        let pool = pool();
        let name = pool
            .submit(|| thread::current().name().map(str::to_string))
            .blocking_wait()
            .unwrap()
            .unwrap();
        assert!(name.starts_with("coreutils-runner-"));
        pool.stop().unwrap();
    }

    #[test]
    fn test_stopped_pool_rejects_work() {
        let pool = pool();
        pool.stop().unwrap();
        assert!(!pool.is_running());

        let result = pool.submit(|| 1).blocking_wait();
        assert!(matches!(result, Err(CoreError::NotAccepting)));
        assert_eq!(pool.metrics().get_rejected(), 1);
    }

    #[test]
    fn test_stop_lets_running_work_finish() {
        let pool = pool();
        let (started_tx, started_rx) = mpsc::channel();
        let handle = pool.submit(move || {
            started_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(200));
            "done"
        });
        started_rx.recv().unwrap();

        pool.stop().unwrap();
        assert_eq!(handle.blocking_wait().unwrap(), "done");
        assert!(matches!(
            pool.submit(|| "late").blocking_wait(),
            Err(CoreError::NotAccepting)
        ));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let pool = pool();
        pool.stop().unwrap();
        pool.stop().unwrap();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_panic_is_captured() {
        let pool = pool();
        let result = pool.submit(|| -> u32 { panic!("worker exploded") }).blocking_wait();
        assert!(matches!(result, Err(CoreError::TaskPanicked(ref m)) if m.contains("worker exploded")));

        // The pool keeps serving work afterwards.
        assert_eq!(pool.submit(|| 5).blocking_wait().unwrap(), 5);
        assert_eq!(pool.metrics().get_panicked(), 1);
        pool.stop().unwrap();
    }

    #[test]
    fn test_runs_in_parallel_up_to_max() {
        let pool = TaskPool::new(4, 60_000, 1_000).unwrap();
        let barrier = Arc::new(std::sync::Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = barrier.clone();
                pool.submit(move || {
                    barrier.wait();
                    true
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.blocking_wait().unwrap());
        }
        pool.stop().unwrap();
    }

    #[test]
    fn test_init_restarts_stopped_pool() {
        let pool = pool();
        pool.stop().unwrap();
        pool.init();
        assert!(pool.is_running());
        assert_eq!(pool.submit(|| 3).blocking_wait().unwrap(), 3);
        pool.stop().unwrap();
    }

    #[test]
    fn test_stop_cancels_queued_work_after_deadline() {
        let pool = TaskPool::new(2, 60_000, 1_000).unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let handles: Vec<_> = (0..6)
            .map(|i| {
                let started_tx = started_tx.clone();
                pool.submit(move || {
                    let _ = started_tx.send(i);
                    thread::sleep(Duration::from_millis(1_500));
                    i
                })
            })
            .collect();
        started_rx.recv().unwrap();
        started_rx.recv().unwrap();

        let stopping = Instant::now();
        pool.stop().unwrap();
        let elapsed = stopping.elapsed();
        assert!(elapsed < Duration::from_millis(1_400), "stop took {:?}", elapsed);

        let results: Vec<_> = handles.into_iter().map(TaskHandle::blocking_wait).collect();
        let completed = results.iter().filter(|r| r.is_ok()).count();
        let cancelled = results
            .iter()
            .filter(|r| matches!(r, Err(CoreError::TaskCancelled)))
            .count();
        assert_eq!(completed, 2);
        assert_eq!(cancelled, 4);
        assert!(started_rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_from_async_context() {
        let pool = Arc::new(pool());
        let value = pool.submit(|| 9).await.unwrap();
        assert_eq!(value, 9);
        let stopper = pool.clone();
        tokio::task::spawn_blocking(move || stopper.stop())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(pool.submit(|| 1).await, Err(CoreError::NotAccepting)));
    }
}

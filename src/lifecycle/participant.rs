use std::any::Any;
use std::sync::Arc;

use crate::Result;

/// A unit enrolled in coordinated shutdown.
///
/// `stop` must be idempotent: the second and later calls have no effect.
/// Errors and panics raised from `stop` are captured and logged by the
/// [`ShutdownCoordinator`](super::ShutdownCoordinator); they never affect
/// other participants.
pub trait ShutdownParticipant: Send + Sync {
    fn name(&self) -> &str;

    fn is_running(&self) -> bool;

    fn init(&self);

    fn stop(&self) -> Result<()>;
}

/// Anything that can live in the [`SharedResourceRegistry`](super::SharedResourceRegistry).
///
/// Types that also take part in coordinated shutdown override
/// `as_participant` so the registry can enrol them when it creates them.
pub trait SharedResource: Any + Send + Sync {
    fn as_participant(self: Arc<Self>) -> Option<Arc<dyn ShutdownParticipant>> {
        None
    }
}

impl SharedResource for reqwest::Client {}

/// Identity comparison that ignores vtable metadata.
pub(crate) fn same_participant(a: &Arc<dyn ShutdownParticipant>, b: &Arc<dyn ShutdownParticipant>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const u8,
        Arc::as_ptr(b) as *const u8,
    )
}

/// Outcome of one participant's stop action during a shutdown sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantOutcome {
    Stopped,
    Failed(String),
    TimedOut,
}

impl ParticipantOutcome {
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

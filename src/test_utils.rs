use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use crate::config::CoreConfig;
use crate::lifecycle::{CoreContext, SharedResource, ShutdownParticipant};
use crate::Result;

pub struct TestContext {
    pub context: Arc<CoreContext>,
    pub temp_dir: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = CoreConfig {
            max_pool_size: 4,
            termination_timeout_ms: 2_000,
            ..CoreConfig::default()
        };
        let context = CoreContext::init(config).expect("Failed to init context");

        Self { context, temp_dir }
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.context.teardown();
    }
}

/// Participant that only counts how often it was stopped.
pub struct FakeParticipant {
    name: String,
    running: AtomicBool,
    stops: AtomicUsize,
}

impl FakeParticipant {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            running: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl ShutdownParticipant for FakeParticipant {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn init(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    fn stop(&self) -> Result<()> {
        if self.running.swap(false, Ordering::SeqCst) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl SharedResource for FakeParticipant {
    fn as_participant(self: Arc<Self>) -> Option<Arc<dyn ShutdownParticipant>> {
        Some(self)
    }
}

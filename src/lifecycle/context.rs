use std::sync::Arc;

use parking_lot::RwLock;

use super::participant::ParticipantOutcome;
use super::{SharedResourceRegistry, ShutdownCoordinator};
use crate::concurrent::TaskPool;
use crate::config::CoreConfig;
use crate::types::Result;

/// Owns the substrate of one process: the shutdown coordinator, the shared
/// resource registry and the task pool.
///
/// Built once by the application entry point and handed around as
/// `Arc<CoreContext>`.
pub struct CoreContext {
    config: RwLock<CoreConfig>,
    coordinator: Arc<ShutdownCoordinator>,
    registry: SharedResourceRegistry,
    pool: Arc<TaskPool>,
}

impl CoreContext {
    pub fn init(config: CoreConfig) -> Result<Arc<Self>> {
        let coordinator = Arc::new(ShutdownCoordinator::new(config.termination_timeout_ms));
        let registry = SharedResourceRegistry::new(Arc::clone(&coordinator), config.lock_timeout_ms);
        let pool = Arc::new(TaskPool::from_config(&config)?);
        registry.register_participant(Arc::clone(&pool), None)?;

        tracing::info!(
            max_pool_size = pool.max_size(),
            lock_timeout_ms = registry.lock_timeout().as_millis() as u64,
            termination_timeout_ms = coordinator.termination_timeout().as_millis() as u64,
            "Core context initialized"
        );

        Ok(Arc::new(Self {
            config: RwLock::new(config),
            coordinator,
            registry,
            pool,
        }))
    }

    pub fn config(&self) -> CoreConfig {
        self.config.read().clone()
    }

    pub fn registry(&self) -> &SharedResourceRegistry {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }

    pub fn pool(&self) -> &Arc<TaskPool> {
        &self.pool
    }

    /// Runs the shutdown sequence when the process receives SIGINT or SIGTERM.
    pub fn install_signal_hook(&self) -> Result<()> {
        self.coordinator.install_signal_hook()
    }

    pub fn reconfigure(&self, config: CoreConfig) -> Result<()> {
        self.registry.reconfigure(&config)?;
        *self.config.write() = config;
        Ok(())
    }

    /// Stops every enrolled participant. Later calls return an empty report.
    pub fn teardown(&self) -> Vec<(String, ParticipantOutcome)> {
        self.coordinator.run_shutdown_sequence()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ShutdownParticipant;
    use crate::test_utils::{FakeParticipant, TestContext};
    use crate::CoreError;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_init_enrols_pool() {
        let ctx = TestContext::new();
        assert_eq!(ctx.context.coordinator().len(), 1);
        assert!(ctx.context.pool().is_running());
        assert_eq!(ctx.context.pool().max_size(), 4);
    }

    #[test]
    fn test_teardown_stops_pool_once() {
        let ctx = TestContext::new();
        let extra = ctx
            .context
            .registry()
            .get_or_create(Some("extra"), || Some(FakeParticipant::new("extra")))
            .unwrap()
            .unwrap();

        let report = ctx.context.teardown();
        let names: Vec<&str> = report.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["extra", "task_pool"]);
        assert_eq!(extra.stop_count(), 1);
        assert!(matches!(
            ctx.context.pool().submit(|| 1).blocking_wait(),
            Err(CoreError::NotAccepting)
        ));

        assert!(ctx.context.teardown().is_empty());
    }

    #[test]
    fn test_pool_registration_conflicts_with_second_pool() {
        let ctx = TestContext::new();
        let other = Arc::new(TaskPool::new(2, 60_000, 1_000).unwrap());
        let err = ctx
            .context
            .registry()
            .register_participant(other.clone(), None)
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        other.stop().unwrap();
    }

    #[test]
    fn test_reconfigure_updates_config_and_subscribers() {
        let ctx = TestContext::new();
        let seen = Arc::new(AtomicU64::new(0));
        {
            let seen = seen.clone();
            ctx.context
                .registry()
                .subscribe(move |config| seen.store(config.lock_timeout_ms, Ordering::SeqCst));
        }

        let config = CoreConfig {
            lock_timeout_ms: 500,
            ..ctx.context.config()
        };
        ctx.context.reconfigure(config).unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 500);
        assert_eq!(ctx.context.config().lock_timeout_ms, 500);
        assert_eq!(ctx.context.registry().lock_timeout().as_millis(), 500);
    }
}

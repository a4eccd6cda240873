use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard-coded limits for every tunable value. Out-of-range settings are
/// clamped into these ranges, never rejected.
pub struct Limits;

impl Limits {
    pub const LOCK_TIMEOUT_MS: RangeInclusive<u64> = 1..=2_000;
    pub const KEEP_ALIVE_MS: RangeInclusive<u64> = 60_000..=3_600_000;
    pub const TERMINATION_TIMEOUT_MS: RangeInclusive<u64> = 1_000..=60_000;
    pub const FETCH_CONCURRENCY: RangeInclusive<usize> = 1..=32;

    pub fn available_processors() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// `[min(2, cores), max(128, cores)]`
    pub fn max_pool_size() -> RangeInclusive<usize> {
        let cores = Self::available_processors();
        cores.min(2)..=cores.max(128)
    }

    pub fn lock_timeout(ms: u64) -> Duration {
        Duration::from_millis(clamp("lock_timeout_ms", ms, Self::LOCK_TIMEOUT_MS))
    }

    pub fn keep_alive(ms: u64) -> Duration {
        Duration::from_millis(clamp("keep_alive_ms", ms, Self::KEEP_ALIVE_MS))
    }

    pub fn termination_timeout(ms: u64) -> Duration {
        Duration::from_millis(clamp(
            "termination_timeout_ms",
            ms,
            Self::TERMINATION_TIMEOUT_MS,
        ))
    }

    pub fn pool_size(size: usize) -> usize {
        clamp("max_pool_size", size, Self::max_pool_size())
    }

    pub fn fetch_concurrency(level: usize) -> usize {
        clamp("fetch_concurrency", level, Self::FETCH_CONCURRENCY)
    }
}

fn clamp<T>(name: &'static str, value: T, range: RangeInclusive<T>) -> T
where
    T: PartialOrd + Copy + std::fmt::Debug,
{
    let (lo, hi) = (*range.start(), *range.end());
    let clamped = if value < lo {
        lo
    } else if value > hi {
        hi
    } else {
        value
    };
    if clamped != value {
        tracing::debug!(
            setting = name,
            requested = ?value,
            applied = ?clamped,
            "Configuration value out of range, clamped"
        );
    }
    clamped
}

/// Tunables recognized by the runtime substrate. All values are raw and get
/// clamped through [`Limits`] at the point of use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub lock_timeout_ms: u64,
    pub max_pool_size: usize,
    pub keep_alive_ms: u64,
    pub termination_timeout_ms: u64,
    pub fetch_concurrency: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: *Limits::LOCK_TIMEOUT_MS.end(),
            max_pool_size: Limits::available_processors(),
            keep_alive_ms: 60_000,
            termination_timeout_ms: 5_000,
            fetch_concurrency: 8,
        }
    }
}

impl CoreConfig {
    pub fn lock_timeout(&self) -> Duration {
        Limits::lock_timeout(self.lock_timeout_ms)
    }

    pub fn max_pool_size(&self) -> usize {
        Limits::pool_size(self.max_pool_size)
    }

    pub fn keep_alive(&self) -> Duration {
        Limits::keep_alive(self.keep_alive_ms)
    }

    pub fn termination_timeout(&self) -> Duration {
        Limits::termination_timeout(self.termination_timeout_ms)
    }

    pub fn fetch_concurrency(&self) -> usize {
        Limits::fetch_concurrency(self.fetch_concurrency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert_eq!(config.lock_timeout(), Duration::from_millis(2_000));
        assert_eq!(config.keep_alive(), Duration::from_millis(60_000));
        assert_eq!(config.fetch_concurrency(), 8);
        assert!(Limits::max_pool_size().contains(&config.max_pool_size()));
    }

    #[test]
    fn test_lock_timeout_clamped() {
        assert_eq!(Limits::lock_timeout(0), Duration::from_millis(1));
        assert_eq!(Limits::lock_timeout(10_000), Duration::from_millis(2_000));
        assert_eq!(Limits::lock_timeout(500), Duration::from_millis(500));
    }

    #[test]
    fn test_termination_and_keep_alive_clamped() {
        assert_eq!(Limits::termination_timeout(10), Duration::from_millis(1_000));
        assert_eq!(
            Limits::termination_timeout(120_000),
            Duration::from_millis(60_000)
        );
        assert_eq!(Limits::keep_alive(1), Duration::from_millis(60_000));
        assert_eq!(
            Limits::keep_alive(u64::MAX),
            Duration::from_millis(3_600_000)
        );
    }

    #[test]
    fn test_fetch_concurrency_clamped() {
        assert_eq!(Limits::fetch_concurrency(0), 1);
        assert_eq!(Limits::fetch_concurrency(64), 32);
        assert_eq!(Limits::fetch_concurrency(4), 4);
    }

    #[test]
    fn test_pool_size_range_covers_cores() {
        let range = Limits::max_pool_size();
        let cores = Limits::available_processors();
        assert!(*range.start() <= 2);
        assert!(*range.end() >= 128);
        assert!(range.contains(&cores));
        assert_eq!(Limits::pool_size(0), *range.start());
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let config: CoreConfig = serde_json::from_str(r#"{"fetch_concurrency": 99}"#).unwrap();
        assert_eq!(config.fetch_concurrency(), 32);
        assert_eq!(config.lock_timeout_ms, 2_000);
    }
}

use tracing_subscriber::EnvFilter;

/// Installs a stderr `fmt` subscriber filtered by `filter` (an `EnvFilter`
/// directive such as `info` or `coreutils_rt=debug`). `RUST_LOG` wins when set.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init(filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let _ = init("debug");
        assert!(!init("info"));
    }
}

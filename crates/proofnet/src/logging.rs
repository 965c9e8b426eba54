//! Logging bootstrap.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "proofnet=info";

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// [`DEFAULT_FILTER`]. Returns false if a global subscriber was already
/// installed; calling it again is harmless.
pub fn init() -> bool {
    init_with(DEFAULT_FILTER)
}

/// Like [`init`] with a different fallback filter.
pub fn init_with(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let _ = init_with("proofnet=debug");
        assert!(!init());
        assert!(!init_with("warn"));
    }
}

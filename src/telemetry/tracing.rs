//! Tracing subscriber init. This crate is a library embedded in a larger
//! process, so it does not install a global subscriber on its own —
//! callers (binaries, tests) opt in by calling [`init_tracing`].

use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (falling back to
/// `default_level` when unset). Safe to call more than once; later calls
/// are no-ops if a global subscriber is already installed.
pub fn init_tracing(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}

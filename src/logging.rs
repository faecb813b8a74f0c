//! Tracing subscriber initialization helpers.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize a global tracing subscriber using `RUST_LOG` (or `filter` if provided).
///
/// Safe to call multiple times; subsequent calls will no-op.
pub fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Test-friendly variant writing through the test harness' captured output.
pub fn init_test_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

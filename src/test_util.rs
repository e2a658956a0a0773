//! Shared test helpers.

use std::sync::Once;

/// Installs a `tracing` subscriber writing to the test output, once per
/// process. Controlled by `RUST_LOG`.
pub(crate) fn trace_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

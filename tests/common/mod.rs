use refbridge::{BridgeConfig, BridgeRuntime};
use std::sync::{Arc, Once};

static TRACING: Once = Once::new();

/// Installs a test subscriber once per test binary.
/// Set `RUST_LOG=refbridge=trace` to see drain activity.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Runtime with refcount validation on, regardless of build profile.
pub fn runtime(config: BridgeConfig) -> Arc<BridgeRuntime> {
    init_tracing();
    BridgeRuntime::initialize(config.with_refcount_validation(true))
}

/// Runtime with default settings (plus validation).
#[allow(dead_code)]
pub fn default_runtime() -> Arc<BridgeRuntime> {
    runtime(BridgeConfig::default())
}

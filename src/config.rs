/// Bridge runtime configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Pending releases that trigger a drain on the next registration (default: 200)
    pub collect_threshold: usize,
    /// Queue releases of dropped wrappers (default: true)
    /// When disabled, dropped wrappers keep their reference until shutdown.
    pub finalizer_enabled: bool,
    /// Check refcounts against registered wrappers while draining
    /// (default: on in debug builds)
    pub validate_refcounts: bool,
    /// Background drain interval in milliseconds (default: 0 = disabled)
    pub collect_interval_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            collect_threshold: 200,
            finalizer_enabled: true,
            validate_refcounts: cfg!(debug_assertions),
            collect_interval_ms: 0,
        }
    }
}

impl BridgeConfig {
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.collect_threshold = threshold;
        self
    }

    pub fn with_refcount_validation(mut self, enabled: bool) -> Self {
        self.validate_refcounts = enabled;
        self
    }

    pub fn with_finalizer_enabled(mut self, enabled: bool) -> Self {
        self.finalizer_enabled = enabled;
        self
    }

    pub fn with_collect_interval_ms(mut self, interval_ms: u64) -> Self {
        self.collect_interval_ms = interval_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.collect_threshold, 200);
        assert!(config.finalizer_enabled);
        assert_eq!(config.collect_interval_ms, 0);
    }

    #[test]
    fn test_builder() {
        let config = BridgeConfig::default()
            .with_threshold(1)
            .with_refcount_validation(true)
            .with_collect_interval_ms(50);

        assert_eq!(config.collect_threshold, 1);
        assert!(config.validate_refcounts);
        assert_eq!(config.collect_interval_ms, 50);
    }
}

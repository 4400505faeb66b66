//! Engine configuration.

/// Tunables for the replication engine and its maintenance loop.
///
/// All intervals are wall-clock milliseconds.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum interval between gap scans in `heartbeat()`.
    pub heartbeat_interval_ms: i64,
    /// Patch rows older than this are garbage-collected. The default of
    /// 25 h leaves a daily sync window able to catch a peer that was
    /// offline for one day.
    pub max_patch_retention_ms: i64,
    /// Cap on the sequence span of a single missing-patch request.
    pub max_patch_per_retransmission: i64,
    /// Log gap-detection events.
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            max_patch_retention_ms: 90_000_000,
            max_patch_per_retransmission: 2_000,
            debug: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.heartbeat_interval_ms, 5_000);
        assert_eq!(config.max_patch_retention_ms, 90_000_000);
        assert_eq!(config.max_patch_per_retransmission, 2_000);
        assert!(!config.debug);
    }
}

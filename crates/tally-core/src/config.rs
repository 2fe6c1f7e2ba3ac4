//! Core configuration
//!
//! A single `Config` value is threaded through the dispatcher and workers
//! at construction time; nothing reads configuration globally.

/// Configuration for the command queue core
#[derive(Debug, Clone)]
pub struct Config {
    /// Monitor polling period in milliseconds
    pub poll_interval_ms: u64,
    /// Scheduler retry cap before a queue item dead-letters
    pub max_retries: u32,
    /// Backoff base in seconds
    pub base_retry_delay_secs: u64,
    /// Backoff ceiling in seconds
    pub max_retry_delay_secs: u64,
    /// In-command OCC retry cap
    pub occ_max_retries: u32,
    /// OCC inter-retry sleep unit in milliseconds
    pub occ_base_interval_ms: u64,
    /// Prefix for processor identities recorded on claimed queue items
    pub processor_name: String,
    /// Storage namespace. SQLite has no in-database schemas, so a non-empty
    /// prefix namespaces the on-disk database file instead.
    pub schema_prefix: String,
    /// Age in seconds beyond which a `processing` queue item is considered
    /// stalled and reverted to `pending` by the monitor sweep
    pub stall_threshold_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            max_retries: 5,
            base_retry_delay_secs: 30,
            max_retry_delay_secs: 3600,
            occ_max_retries: 5,
            occ_base_interval_ms: 200,
            processor_name: "event_queue".to_string(),
            schema_prefix: String::new(),
            stall_threshold_secs: 300,
        }
    }
}

impl Config {
    /// Processor identity recorded on queue items claimed for an instance
    pub fn processor_id(&self, instance_id: i64) -> String {
        format!("{}:{}", self.processor_name, instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.poll_interval_ms, 5000);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_retry_delay_secs, 30);
        assert_eq!(config.max_retry_delay_secs, 3600);
        assert_eq!(config.occ_max_retries, 5);
        assert_eq!(config.occ_base_interval_ms, 200);
        assert_eq!(config.processor_name, "event_queue");
        assert_eq!(config.stall_threshold_secs, 300);
    }

    #[test]
    fn processor_id_includes_prefix_and_instance() {
        let config = Config::default();
        assert_eq!(config.processor_id(42), "event_queue:42");
    }
}

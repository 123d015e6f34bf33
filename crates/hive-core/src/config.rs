//! System configuration.
//!
//! All runtime knobs live in one serde-derived value owned by the
//! system. Programmatic construction covers most uses; `from_json_str`
//! loads the same fields from a JSON document.

use serde::{Deserialize, Serialize};

use crate::error::{Error, SecCode};

/// Scheduler selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerPolicy {
    /// Work-stealing worker pool.
    #[default]
    Stealing,
    /// Deterministic single-threaded coordinator plus virtual clock.
    Testing,
}

/// Runtime configuration, owned by the [`crate::system::ActorSystem`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub scheduler_policy: SchedulerPolicy,
    /// Worker thread count; 0 selects the available parallelism.
    pub scheduler_workers: usize,
    /// Mailbox elements consumed per resume step.
    pub scheduler_max_throughput: usize,
    /// Upgrade indirect routes by opening direct connections.
    pub middleman_enable_automatic_connections: bool,
    /// Emit heartbeat frames on idle connections.
    pub middleman_enable_heartbeat: bool,
    /// Heartbeat period in milliseconds.
    pub middleman_heartbeat_interval_ms: u64,
    /// Reorder window for datagram sequence numbers.
    pub middleman_reorder_window: u16,
    /// Pending-delivery timeout for buffered out-of-order datagrams,
    /// in milliseconds.
    pub middleman_pending_delivery_ms: u64,
    /// Deliver out-of-window datagrams on arrival instead of dropping
    /// them.
    pub middleman_deliver_unordered: bool,
}

impl Default for SystemConfig {
    fn default() -> SystemConfig {
        SystemConfig {
            scheduler_policy: SchedulerPolicy::Stealing,
            scheduler_workers: 0,
            scheduler_max_throughput: 300,
            middleman_enable_automatic_connections: false,
            middleman_enable_heartbeat: false,
            middleman_heartbeat_interval_ms: 10_000,
            middleman_reorder_window: 64,
            middleman_pending_delivery_ms: 100,
            middleman_deliver_unordered: false,
        }
    }
}

impl SystemConfig {
    /// The default testing setup: deterministic scheduler and clock.
    pub fn testing() -> SystemConfig {
        SystemConfig {
            scheduler_policy: SchedulerPolicy::Testing,
            ..SystemConfig::default()
        }
    }

    /// Parse a JSON configuration document.
    pub fn from_json_str(input: &str) -> Result<SystemConfig, Error> {
        serde_json::from_str(input).map_err(|_| Error::sec(SecCode::InvalidArgument))
    }

    /// Load a JSON configuration file.
    pub fn from_json_file(path: &std::path::Path) -> Result<SystemConfig, Error> {
        let text =
            std::fs::read_to_string(path).map_err(|_| Error::sec(SecCode::InvalidArgument))?;
        SystemConfig::from_json_str(&text)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SystemConfig::default();
        assert_eq!(cfg.scheduler_policy, SchedulerPolicy::Stealing);
        assert_eq!(cfg.scheduler_max_throughput, 300);
        assert_eq!(cfg.middleman_reorder_window, 64);
        assert!(!cfg.middleman_enable_automatic_connections);
    }

    #[test]
    fn test_from_json() {
        let cfg = SystemConfig::from_json_str(
            r#"{
                "scheduler_policy": "testing",
                "scheduler_max_throughput": 10,
                "middleman_enable_automatic_connections": true
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.scheduler_policy, SchedulerPolicy::Testing);
        assert_eq!(cfg.scheduler_max_throughput, 10);
        assert!(cfg.middleman_enable_automatic_connections);
        // Unset fields keep their defaults.
        assert_eq!(cfg.middleman_reorder_window, 64);
    }

    #[test]
    fn test_bad_json_rejected() {
        assert!(SystemConfig::from_json_str("{nope").is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.json");
        std::fs::write(&path, r#"{ "scheduler_workers": 2 }"#).unwrap();
        let cfg = SystemConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.scheduler_workers, 2);
        assert!(SystemConfig::from_json_file(&dir.path().join("missing.json")).is_err());
    }
}

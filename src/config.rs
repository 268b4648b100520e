use std::path::PathBuf;
use std::time::Duration;

use crate::limits::DEFAULT_LOCK_TIMEOUT_MS;

/// Daemon settings, read from `FLEETBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub lock_timeout: Duration,
    pub reconcile_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            reconcile_interval: Duration::from_secs(300),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());
        Self {
            data_dir: lookup("FLEETBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: lookup("FLEETBOOK_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            compact_threshold: parsed("FLEETBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            lock_timeout: parsed("FLEETBOOK_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            reconcile_interval: parsed("FLEETBOOK_RECONCILE_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconcile_interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(Config::from_lookup(lookup(&[])), Config::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = Config::from_lookup(lookup(&[
            ("FLEETBOOK_DATA_DIR", "/var/lib/fleetbook"),
            ("FLEETBOOK_METRICS_PORT", "9090"),
            ("FLEETBOOK_COMPACT_THRESHOLD", "50"),
            ("FLEETBOOK_LOCK_TIMEOUT_MS", "250"),
            ("FLEETBOOK_RECONCILE_INTERVAL_SECS", "60"),
        ]));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/fleetbook"));
        assert_eq!(config.metrics_port, Some(9090));
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.reconcile_interval, Duration::from_secs(60));
    }

    #[test]
    fn garbage_falls_back() {
        let config = Config::from_lookup(lookup(&[
            ("FLEETBOOK_METRICS_PORT", "http"),
            ("FLEETBOOK_COMPACT_THRESHOLD", "-1"),
            ("FLEETBOOK_RECONCILE_INTERVAL_SECS", "0"),
        ]));
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.reconcile_interval, Duration::from_secs(300));
    }
}

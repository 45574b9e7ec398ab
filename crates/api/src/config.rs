//! Runtime configuration from `EDGEHUB_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use edgehub_bus::{Topics, DEFAULT_ACK_ROOT, DEFAULT_CLOUD_ROOT, DEFAULT_EDGE_ROOT};
use edgehub_codec::Compression;
use edgehub_correlate::SweepConfig;
use edgehub_persist::DEFAULT_MANIFEST_ROOT;
use edgehub_watcher::WatcherConfig;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("EDGEHUB_NODE_NAME is not set")]
    MissingNodeName,
}

/// Timeouts used by the resource clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// How long an operation waits for its acknowledgement.
    pub ack_wait: Duration,
    /// Bound on a single publish.
    pub publish_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { ack_wait: Duration::from_secs(5), publish_timeout: Duration::from_secs(3) }
    }
}

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub node_name: String,
    pub manifest_root: PathBuf,
    pub edge_root: String,
    pub cloud_root: String,
    pub ack_root: String,
    pub client: ClientConfig,
    pub sweep: SweepConfig,
    pub watcher: WatcherConfig,
    pub compression: Compression,
    pub heartbeat: Duration,
    pub start_attempts: u32,
}

impl EdgeConfig {
    /// Defaults for `node_name`; everything else as documented on each knob.
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            manifest_root: PathBuf::from(DEFAULT_MANIFEST_ROOT),
            edge_root: DEFAULT_EDGE_ROOT.to_string(),
            cloud_root: DEFAULT_CLOUD_ROOT.to_string(),
            ack_root: DEFAULT_ACK_ROOT.to_string(),
            client: ClientConfig::default(),
            sweep: SweepConfig::default(),
            watcher: WatcherConfig::default(),
            compression: Compression::None,
            heartbeat: Duration::from_secs(60),
            start_attempts: 3,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary variable source. Unparsable values fall back to the default.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let node_name = get("EDGEHUB_NODE_NAME").filter(|s| !s.trim().is_empty()).ok_or(ConfigError::MissingNodeName)?;
        let mut cfg = Self::new(node_name.trim());
        if let Some(root) = get("EDGEHUB_MANIFEST_ROOT").filter(|s| !s.is_empty()) {
            cfg.manifest_root = PathBuf::from(root);
        }
        if let Some(v) = get("EDGEHUB_EDGE_ROOT").filter(|s| !s.is_empty()) {
            cfg.edge_root = v;
        }
        if let Some(v) = get("EDGEHUB_CLOUD_ROOT").filter(|s| !s.is_empty()) {
            cfg.cloud_root = v;
        }
        if let Some(v) = get("EDGEHUB_ACK_ROOT").filter(|s| !s.is_empty()) {
            cfg.ack_root = v;
        }
        // Periods and waits must be positive; zero keeps the default.
        let secs = |var: &str, default: Duration| positive(&get, var).map(Duration::from_secs).unwrap_or(default);
        cfg.client.ack_wait = secs("EDGEHUB_ACK_WAIT_SECS", cfg.client.ack_wait);
        cfg.client.publish_timeout = secs("EDGEHUB_PUBLISH_TIMEOUT_SECS", cfg.client.publish_timeout);
        cfg.sweep.period = secs("EDGEHUB_SWEEP_SECS", cfg.sweep.period);
        cfg.sweep.retention = secs("EDGEHUB_RETENTION_SECS", cfg.sweep.retention);
        cfg.heartbeat = secs("EDGEHUB_HEARTBEAT_SECS", cfg.heartbeat);
        cfg.watcher.backoff_max = secs("EDGEHUB_WATCH_BACKOFF_MAX_SECS", cfg.watcher.backoff_max);
        cfg.watcher.backoff_min =
            positive(&get, "EDGEHUB_WATCH_BACKOFF_MIN_MS").map(Duration::from_millis).unwrap_or(cfg.watcher.backoff_min);
        // 0 disables the periodic relist.
        if let Some(n) = parsed::<u64>(&get, "EDGEHUB_RELIST_SECS") {
            cfg.watcher.relist_interval = (n > 0).then(|| Duration::from_secs(n));
        }
        if let Some(n) = parsed::<u32>(&get, "EDGEHUB_START_ATTEMPTS") {
            cfg.start_attempts = n.max(1);
        }
        if let Some(c) = parsed::<Compression>(&get, "EDGEHUB_COMPRESS") {
            cfg.compression = c;
        }
        Ok(cfg)
    }

    pub fn topics(&self) -> Topics {
        Topics::new(&self.edge_root, &self.cloud_root, &self.ack_root, &self.node_name)
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, var: &str) -> Option<T> {
    let raw = get(var)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = %var, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

fn positive(get: &impl Fn(&str) -> Option<String>, var: &str) -> Option<u64> {
    match parsed::<u64>(get, var) {
        Some(0) => {
            warn!(var = %var, "ignoring zero setting");
            None
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn node_name_is_required() {
        assert!(matches!(EdgeConfig::from_lookup(lookup(&[])), Err(ConfigError::MissingNodeName)));
        assert!(matches!(EdgeConfig::from_lookup(lookup(&[("EDGEHUB_NODE_NAME", "  ")])), Err(ConfigError::MissingNodeName)));
    }

    #[test]
    fn defaults() {
        let cfg = EdgeConfig::from_lookup(lookup(&[("EDGEHUB_NODE_NAME", "edge-1")])).unwrap();
        assert_eq!(cfg.manifest_root, PathBuf::from("/etc/kubernetes/mqttManifests"));
        assert_eq!(cfg.client, ClientConfig::default());
        assert_eq!(cfg.sweep.retention, Duration::from_secs(7200));
        assert_eq!(cfg.watcher.relist_interval, Some(Duration::from_secs(15)));
        assert_eq!(cfg.compression, Compression::None);
        assert_eq!(cfg.start_attempts, 3);
        assert_eq!(cfg.topics().ack(), "/lite/cloud/ack/edge-1");
    }

    #[test]
    fn overrides_and_bad_values() {
        let cfg = EdgeConfig::from_lookup(lookup(&[
            ("EDGEHUB_NODE_NAME", "edge-2"),
            ("EDGEHUB_ACK_WAIT_SECS", "9"),
            ("EDGEHUB_RELIST_SECS", "0"),
            ("EDGEHUB_WATCH_BACKOFF_MIN_MS", "250"),
            ("EDGEHUB_COMPRESS", "gzip"),
            ("EDGEHUB_HEARTBEAT_SECS", "soon"),
            ("EDGEHUB_EDGE_ROOT", "/custom/edge/"),
        ]))
        .unwrap();
        assert_eq!(cfg.client.ack_wait, Duration::from_secs(9));
        assert_eq!(cfg.watcher.relist_interval, None);
        assert_eq!(cfg.watcher.backoff_min, Duration::from_millis(250));
        assert_eq!(cfg.compression, Compression::Gzip);
        assert_eq!(cfg.heartbeat, Duration::from_secs(60));
        assert_eq!(cfg.topics().online(), "/custom/edge/nodes/edge-2/online");
    }

    #[test]
    fn zero_periods_keep_their_defaults() {
        let cfg = EdgeConfig::from_lookup(lookup(&[
            ("EDGEHUB_NODE_NAME", "edge-3"),
            ("EDGEHUB_SWEEP_SECS", "0"),
            ("EDGEHUB_HEARTBEAT_SECS", "0"),
            ("EDGEHUB_WATCH_BACKOFF_MIN_MS", "0"),
            ("EDGEHUB_WATCH_BACKOFF_MAX_SECS", "0"),
            ("EDGEHUB_ACK_WAIT_SECS", "0"),
        ]))
        .unwrap();
        assert_eq!(cfg.sweep.period, Duration::from_secs(5));
        assert_eq!(cfg.heartbeat, Duration::from_secs(60));
        assert_eq!(cfg.watcher.backoff_min, Duration::from_secs(1));
        assert_eq!(cfg.watcher.backoff_max, Duration::from_secs(20));
        assert_eq!(cfg.client.ack_wait, Duration::from_secs(5));
    }
}

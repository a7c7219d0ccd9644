use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level daemon configuration (loaded from rdsync.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RdsyncConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub signature: SignatureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address (default: 127.0.0.1:9090)
    pub listen: String,
    /// URL advertised to peers in the SourceServerInfo header
    pub url: String,
    /// Stable server identifier; generated and persisted in storage when unset
    pub server_id: Option<String>,
    /// Prometheus metrics endpoint (default: 127.0.0.1:9100)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
    /// NATS server for synchronization updates (daemon built with `nats`)
    pub nats_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend: "memory" or "fs"
    pub backend: String,
    /// Root directory for the fs backend
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Bytes read from the source signature per comparator step
    pub input_buffer_size: usize,
    /// Upper bound on the seed signature the comparator will index
    pub comparator_buffer_size: usize,
    /// Capacity of the Need scratch array handed to the comparator
    pub need_batch_size: usize,
    /// Maximum history entries kept per file (0 = unbounded)
    pub history_limit: usize,
    /// Outbound synchronization attempts allowed to run at once
    pub max_concurrent_syncs: usize,
    /// Timeout for a single peer request, in seconds
    pub request_timeout_secs: u64,
}

/// FastCDC chunk size targets used when computing signatures
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    pub min_chunk: u32,
    pub avg_chunk: u32,
    pub max_chunk: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9090".into(),
            url: "http://127.0.0.1:9090".into(),
            server_id: None,
            metrics_addr: Some("127.0.0.1:9100".into()),
            log_level: "info".into(),
            log_format: "text".into(),
            nats_url: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "memory".into(),
            root: PathBuf::from("/var/lib/rdsync"),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            input_buffer_size: 512 * 1024,
            comparator_buffer_size: 32 * 1024 * 1024,
            need_batch_size: 256,
            history_limit: 0,
            max_concurrent_syncs: 5,
            request_timeout_secs: 300,
        }
    }
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            min_chunk: 512,
            avg_chunk: 2048,
            max_chunk: 8192,
        }
    }
}

impl SyncConfig {
    /// `None` when history growth is unbounded.
    pub fn history_bound(&self) -> Option<usize> {
        (self.history_limit > 0).then_some(self.history_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[server]
listen = "0.0.0.0:8080"
url = "http://peer-a:8080"
server_id = "peer-a"
log_level = "debug"
log_format = "json"

[storage]
backend = "fs"
root = "/srv/rdsync"

[sync]
input_buffer_size = 4096
comparator_buffer_size = 1048576
need_batch_size = 16
history_limit = 50
max_concurrent_syncs = 2
request_timeout_secs = 30

[signature]
min_chunk = 256
avg_chunk = 1024
max_chunk = 4096
"#;
        let config: RdsyncConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.server.server_id.as_deref(), Some("peer-a"));
        assert_eq!(config.server.log_format, "json");
        assert_eq!(config.storage.backend, "fs");
        assert_eq!(config.storage.root, PathBuf::from("/srv/rdsync"));
        assert_eq!(config.sync.input_buffer_size, 4096);
        assert_eq!(config.sync.need_batch_size, 16);
        assert_eq!(config.sync.history_bound(), Some(50));
        assert_eq!(config.signature.avg_chunk, 1024);
    }

    #[test]
    fn test_parse_defaults() {
        let config: RdsyncConfig = toml::from_str("").unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:9090");
        assert!(config.server.server_id.is_none());
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.sync.need_batch_size, 256);
        assert_eq!(config.sync.history_bound(), None);
        assert_eq!(config.sync.max_concurrent_syncs, 5);
        assert_eq!(config.signature.min_chunk, 512);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[sync]
history_limit = 10
"#;
        let config: RdsyncConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.sync.history_bound(), Some(10));
        // Defaults
        assert_eq!(config.sync.input_buffer_size, 512 * 1024);
        assert_eq!(config.server.log_level, "info");
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = RdsyncConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: RdsyncConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.server.url, parsed.server.url);
        assert_eq!(config.storage.backend, parsed.storage.backend);
        assert_eq!(config.sync.comparator_buffer_size, parsed.sync.comparator_buffer_size);
    }
}

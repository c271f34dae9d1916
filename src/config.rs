use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Configuration for the host agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Overrides the hostname-derived system identity when non-empty.
    #[serde(default)]
    pub system_id: String,

    /// Sampling cadence. Default: 10s.
    #[serde(default = "default_agent_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Where reports go each tick. Default: network.
    #[serde(default)]
    pub mode: ReportMode,

    /// Collector connection configuration.
    #[serde(default)]
    pub collector: CollectorEndpointConfig,

    /// Kernel instrumentation object configuration.
    #[serde(default)]
    pub bpf: BpfConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default = "default_agent_health")]
    pub health: HealthConfig,
}

/// Report destination for the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportMode {
    /// Push reports to the collector over TCP.
    #[default]
    Network,
    /// Print a leak report table to stdout.
    Console,
}

/// How the agent reaches the collector.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorEndpointConfig {
    /// `host:port` of the collector. Default: "localhost:8080".
    #[serde(default = "default_collector_address")]
    pub address: String,

    /// Base delay between dial attempts. Default: 5s.
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Upper bound of the random delay added to each retry. Default: 1s.
    #[serde(default = "default_retry_jitter", with = "humantime_serde")]
    pub retry_jitter: Duration,

    /// Timeout of a single dial attempt. Default: 10s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Kernel instrumentation object and the names inside it.
#[derive(Debug, Clone, Deserialize)]
pub struct BpfConfig {
    /// Path of the compiled eBPF ELF object. Default: "ram_monitor.o".
    #[serde(default = "default_bpf_object_path")]
    pub object_path: PathBuf,

    /// Accumulator hash map name. Default: "ram_usage".
    #[serde(default = "default_bpf_map_name")]
    pub map_name: String,

    /// Program attached to kmem/mm_page_alloc. Default: "trace_alloc".
    #[serde(default = "default_alloc_program")]
    pub alloc_program: String,

    /// Program attached to kmem/mm_page_free. Default: "trace_free".
    #[serde(default = "default_free_program")]
    pub free_program: String,
}

/// Configuration for the central collector.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Listen address: IP literal or hostname (first IPv4 result), or
    /// ":port" for all interfaces. Default: ":8080".
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Ingest queue capacity. Default: 1024.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Longest accepted line in bytes, excluding the newline. Default: 1MiB.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    /// Document store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Document store backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Firestore,
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default)]
    pub firestore: FirestoreConfig,
}

/// Google Cloud Firestore connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FirestoreConfig {
    /// Service account JSON key. Default: "serviceAccountKey.json".
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,

    /// Overrides the project id taken from the service account key.
    #[serde(default)]
    pub project_id: String,

    /// Database id. Default: "(default)".
    #[serde(default = "default_database")]
    pub database: String,

    /// REST endpoint. Default: "https://firestore.googleapis.com".
    #[serde(default = "default_firestore_endpoint")]
    pub endpoint: String,

    /// `host:port` of a local emulator; skips credentials when set.
    #[serde(default)]
    pub emulator_host: String,

    /// Per-request timeout. Default: 10s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_agent_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_collector_address() -> String {
    "localhost:8080".to_string()
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_retry_jitter() -> Duration {
    Duration::from_secs(1)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_bpf_object_path() -> PathBuf {
    PathBuf::from("ram_monitor.o")
}

fn default_bpf_map_name() -> String {
    "ram_usage".to_string()
}

fn default_alloc_program() -> String {
    "trace_alloc".to_string()
}

fn default_free_program() -> String {
    "trace_free".to_string()
}

fn default_listen_addr() -> String {
    ":8080".to_string()
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_line_bytes() -> usize {
    1024 * 1024
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("serviceAccountKey.json")
}

fn default_database() -> String {
    "(default)".to_string()
}

fn default_firestore_endpoint() -> String {
    "https://firestore.googleapis.com".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_agent_health() -> HealthConfig {
    HealthConfig {
        enabled: true,
        addr: ":9091".to_string(),
    }
}

// --- Default trait impls ---

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            system_id: String::new(),
            interval: default_agent_interval(),
            mode: ReportMode::default(),
            collector: CollectorEndpointConfig::default(),
            bpf: BpfConfig::default(),
            health: default_agent_health(),
        }
    }
}

impl Default for CollectorEndpointConfig {
    fn default() -> Self {
        Self {
            address: default_collector_address(),
            retry_interval: default_retry_interval(),
            retry_jitter: default_retry_jitter(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Default for BpfConfig {
    fn default() -> Self {
        Self {
            object_path: default_bpf_object_path(),
            map_name: default_bpf_map_name(),
            alloc_program: default_alloc_program(),
            free_program: default_free_program(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            listen_addr: default_listen_addr(),
            queue_capacity: default_queue_capacity(),
            max_line_bytes: default_max_line_bytes(),
            store: StoreConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for FirestoreConfig {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
            project_id: String::new(),
            database: default_database(),
            endpoint: default_firestore_endpoint(),
            emulator_host: String::new(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;

    // An empty document means "all defaults".
    if data.trim().is_empty() {
        return serde_yaml::from_str("{}")
            .with_context(|| format!("parsing config file {}", path.display()));
    }

    serde_yaml::from_str(&data).with_context(|| format!("parsing config file {}", path.display()))
}

/// Expand the ":port" shorthand to an all-interfaces IPv4 address.
pub fn expand_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let cfg: AgentConfig = load_yaml(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            bail!("interval must be positive");
        }

        if self.mode == ReportMode::Network {
            if self.collector.address.is_empty() {
                bail!("collector.address is required in network mode");
            }

            if self.collector.retry_interval.is_zero() {
                bail!("collector.retry_interval must be positive");
            }

            if self.collector.connect_timeout.is_zero() {
                bail!("collector.connect_timeout must be positive");
            }
        }

        if self.bpf.object_path.as_os_str().is_empty() {
            bail!("bpf.object_path is required");
        }

        if self.bpf.map_name.is_empty() {
            bail!("bpf.map_name is required");
        }

        if self.bpf.alloc_program.is_empty() || self.bpf.free_program.is_empty() {
            bail!("bpf.alloc_program and bpf.free_program are required");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when enabled");
        }

        Ok(())
    }
}

impl CollectorConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let cfg: CollectorConfig = load_yaml(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            bail!("listen_addr is required");
        }

        if self.queue_capacity == 0 {
            bail!("queue_capacity must be positive");
        }

        if self.max_line_bytes == 0 {
            bail!("max_line_bytes must be positive");
        }

        if self.store.backend == StoreBackend::Firestore {
            let fs = &self.store.firestore;
            if fs.emulator_host.is_empty() {
                if fs.credentials_path.as_os_str().is_empty() {
                    bail!("store.firestore.credentials_path is required");
                }
                if fs.endpoint.is_empty() {
                    bail!("store.firestore.endpoint is required");
                }
            } else if fs.project_id.is_empty() {
                bail!("store.firestore.project_id is required with emulator_host");
            }

            if fs.database.is_empty() {
                bail!("store.firestore.database is required");
            }

            if fs.request_timeout.is_zero() {
                bail!("store.firestore.request_timeout must be positive");
            }
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when enabled");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn test_default_agent_config_values() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.interval, Duration::from_secs(10));
        assert_eq!(cfg.mode, ReportMode::Network);
        assert_eq!(cfg.collector.address, "localhost:8080");
        assert_eq!(cfg.collector.retry_interval, Duration::from_secs(5));
        assert_eq!(cfg.bpf.object_path, PathBuf::from("ram_monitor.o"));
        assert_eq!(cfg.bpf.map_name, "ram_usage");
        assert_eq!(cfg.health.addr, ":9091");
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn test_default_collector_config_values() {
        let cfg = CollectorConfig::default();
        assert_eq!(cfg.listen_addr, ":8080");
        assert_eq!(cfg.queue_capacity, 1024);
        assert_eq!(cfg.store.backend, StoreBackend::Firestore);
        assert_eq!(
            cfg.store.firestore.credentials_path,
            PathBuf::from("serviceAccountKey.json")
        );
        assert_eq!(cfg.health.addr, ":9090");
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn test_load_agent_config_from_yaml() {
        let file = write_config(
            r#"
system_id: edge-01
interval: 1s
mode: console
collector:
  address: "10.0.0.5:8080"
  retry_interval: 2s
  retry_jitter: 500ms
health:
  enabled: false
"#,
        );

        let cfg = AgentConfig::load(file.path()).expect("load");
        assert_eq!(cfg.system_id, "edge-01");
        assert_eq!(cfg.interval, Duration::from_secs(1));
        assert_eq!(cfg.mode, ReportMode::Console);
        assert_eq!(cfg.collector.address, "10.0.0.5:8080");
        assert_eq!(cfg.collector.retry_jitter, Duration::from_millis(500));
        assert_eq!(cfg.collector.connect_timeout, Duration::from_secs(10));
        assert!(!cfg.health.enabled);
    }

    #[test]
    fn test_load_empty_file_yields_defaults() {
        let file = write_config("");
        let cfg = CollectorConfig::load(file.path()).expect("load");
        assert_eq!(cfg.queue_capacity, 1024);
        assert_eq!(cfg.max_line_bytes, 1024 * 1024);
    }

    #[test]
    fn test_load_collector_config_memory_backend() {
        let file = write_config(
            r#"
listen_addr: "127.0.0.1:9000"
queue_capacity: 16
store:
  backend: memory
"#,
        );

        let cfg = CollectorConfig::load(file.path()).expect("load");
        assert_eq!(cfg.listen_addr, "127.0.0.1:9000");
        assert_eq!(cfg.queue_capacity, 16);
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let cfg = AgentConfig {
            interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_queue_capacity() {
        let cfg = CollectorConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_emulator_requires_project() {
        let mut cfg = CollectorConfig::default();
        cfg.store.firestore.emulator_host = "localhost:8081".to_string();
        assert!(cfg.validate().is_err());

        cfg.store.firestore.project_id = "demo".to_string();
        cfg.validate().expect("emulator with project is valid");
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let file = write_config("mode: syslog\n");
        assert!(AgentConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_expand_listen_addr() {
        assert_eq!(expand_listen_addr(":8080"), "0.0.0.0:8080");
        assert_eq!(expand_listen_addr("127.0.0.1:1"), "127.0.0.1:1");
    }
}

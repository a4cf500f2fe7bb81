use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the logship agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Event-log sources; one worker runs per entry.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Event-log backend locations.
    #[serde(default)]
    pub eventlog: EventLogConfig,

    /// Bulk output configuration.
    #[serde(default)]
    pub output: OutputConfig,

    /// Cursor checkpoint configuration.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Prometheus metrics endpoint configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// One event-log source to tail.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Source name, e.g. "application". Also the journal/plain file stem.
    pub name: String,

    /// Drop records older than this at read time. Zero disables the filter.
    /// Default: 0.
    #[serde(default, with = "humantime_serde")]
    pub ignore_older: Duration,

    /// Maximum records returned per read. Default: 100.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Event-log backend locations. The journal directory is probed first,
/// the plain-text directory second.
#[derive(Debug, Clone, Deserialize)]
pub struct EventLogConfig {
    /// Directory holding per-source NDJSON journal files.
    #[serde(default = "default_journal_dir")]
    pub journal_dir: String,

    /// Directory holding per-source plain-text log files.
    #[serde(default = "default_plain_dir")]
    pub plain_dir: String,
}

/// Bulk output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Base URL of the index service, e.g. "https://search.example.com:9200".
    #[serde(default)]
    pub url: String,

    /// Index name prefix; the UTC date of each document is appended.
    /// Default: "logship".
    #[serde(default = "default_index")]
    pub index: String,

    /// Basic-auth username. Empty disables authentication.
    #[serde(default)]
    pub username: String,

    /// Basic-auth password.
    #[serde(default)]
    pub password: String,

    /// Explicit forward proxy URL. Empty defers to environment proxies.
    #[serde(default)]
    pub proxy_url: String,

    /// Request timeout for bulk calls. Default: 90s.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Timeout for connection pings. Default: 5s.
    #[serde(default = "default_ping_timeout", with = "humantime_serde")]
    pub ping_timeout: Duration,

    /// Request body compression (none, gzip). Default: none.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// TLS options for the transport.
    #[serde(default)]
    pub tls: TlsConfig,
}

/// TLS options for the output transport.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    /// Path to a PEM CA bundle to trust in addition to system roots.
    #[serde(default)]
    pub ca_file: String,

    /// Disable certificate verification. Default: false.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Cursor checkpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointConfig {
    /// Checkpoint file path; relative paths resolve against the working
    /// directory at startup. Default: ".logship.state".
    #[serde(default = "default_checkpoint_path")]
    pub path: String,

    /// Flush after this many unwritten cursor updates. Default: 10.
    #[serde(default = "default_max_unwritten")]
    pub max_unwritten: usize,

    /// Flush when the last write is older than this. Default: 5s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

/// Prometheus metrics endpoint configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Listen address, e.g. ":9300". Empty keeps metrics in-process only.
    #[serde(default)]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_journal_dir() -> String {
    "/var/spool/logship/journal".to_string()
}

fn default_plain_dir() -> String {
    "/var/log/logship".to_string()
}

fn default_index() -> String {
    "logship".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_ping_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_checkpoint_path() -> String {
    ".logship.state".to_string()
}

fn default_max_unwritten() -> usize {
    10
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            sources: Vec::new(),
            eventlog: EventLogConfig::default(),
            output: OutputConfig::default(),
            checkpoint: CheckpointConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            journal_dir: default_journal_dir(),
            plain_dir: default_plain_dir(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            index: default_index(),
            username: String::new(),
            password: String::new(),
            proxy_url: String::new(),
            timeout: default_timeout(),
            ping_timeout: default_ping_timeout(),
            compression: default_compression(),
            tls: TlsConfig::default(),
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: default_checkpoint_path(),
            max_unwritten: default_max_unwritten(),
            flush_interval: default_flush_interval(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            bail!("at least one source is required");
        }

        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if source.name.is_empty() {
                bail!("source name must not be empty");
            }
            if !seen.insert(source.name.as_str()) {
                bail!("duplicate source name: {}", source.name);
            }
            if source.batch_size == 0 {
                bail!("source {} batch_size must be positive", source.name);
            }
        }

        if self.output.url.is_empty() {
            bail!("output.url is required");
        }

        if self.output.index.is_empty() {
            bail!("output.index is required");
        }

        match self.output.compression.as_str() {
            "none" | "" | "gzip" => {}
            other => bail!("invalid compression type: {other}"),
        }

        if self.checkpoint.path.is_empty() {
            bail!("checkpoint.path is required");
        }

        if self.checkpoint.max_unwritten == 0 {
            bail!("checkpoint.max_unwritten must be positive");
        }

        Ok(())
    }
}

//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the acquisition runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use wattline_schema::{Device, ProtocolKind, TagMap};

use crate::logging::LogFormat;

fn default_poll_interval_ms() -> u64 {
    1500
}

fn default_refresh_interval_ms() -> u64 {
    30_000
}

fn default_start_jitter_pct() -> f64 {
    0.1
}

fn default_request_timeout_ms() -> u64 {
    1500
}

fn default_snmp_timeout_ms() -> u64 {
    5000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_base_ms() -> u64 {
    150
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cool_down_ms() -> u64 {
    30_000
}

fn default_max_buffer_size() -> usize {
    1000
}

fn default_min_batch_size() -> usize {
    10
}

fn default_flush_interval_ms() -> u64 {
    5000
}

fn default_shutdown_flush_wait_ms() -> u64 {
    10_000
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    "0.0.0.0:9898"
        .parse()
        .expect("valid default metrics address")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_true() -> bool {
    true
}

fn default_scale() -> f64 {
    1.0
}

/// Primary configuration object for the Wattline daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Acquisition scheduling knobs.
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Protocol client knobs shared by both wire protocols.
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Per-device circuit breaker knobs.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Buffered bulk writer knobs.
    #[serde(default)]
    pub writer: WriterConfig,
    /// Measurement storage backend.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Prometheus exporter surface.
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Tracing output configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Device inventory for config-file-backed deployments.
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

impl AppConfig {
    /// Environment variable overriding the config search path.
    pub const ENV_CONFIG_PATH: &'static str = "WATTLINE_CONFIG";

    /// Load configuration from disk, respecting the `WATTLINE_CONFIG` override.
    ///
    /// Candidates are tried in order; the first existing file wins.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                return Self::from_path(PathBuf::from(env_path));
            }
        }
        for candidate in candidates {
            if candidate.as_ref().exists() {
                return Self::from_path(candidate.as_ref().to_path_buf());
            }
        }
        Err(anyhow!(
            "no configuration file found; set {} or provide --config",
            Self::ENV_CONFIG_PATH
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: AppConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        debug!(path = %path.display(), devices = config.devices.len(), "configuration parsed");
        Ok(config)
    }

    /// Validate the whole tree once, at startup. Anything caught here is
    /// fatal; nothing later in the pipeline re-checks these invariants.
    pub fn validate(&self) -> Result<()> {
        self.acquisition.validate()?;
        self.protocol.validate()?;
        self.breaker.validate()?;
        self.writer.validate()?;
        let mut seen = std::collections::HashSet::new();
        for entry in &self.devices {
            if !seen.insert(entry.device_id) {
                return Err(anyhow!("duplicate device id {} in [devices]", entry.device_id));
            }
            entry.validate()?;
        }
        Ok(())
    }
}

/// Scheduling cadence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Poll interval used when a device row does not carry its own.
    #[serde(default = "default_poll_interval_ms")]
    pub default_poll_interval_ms: u64,
    /// How often the scheduler re-reads the enabled-device set.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    /// Randomized start offset per device, as a fraction of its interval,
    /// to desynchronize poll phases.
    #[serde(default = "default_start_jitter_pct")]
    pub start_jitter_pct: f64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            default_poll_interval_ms: default_poll_interval_ms(),
            refresh_interval_ms: default_refresh_interval_ms(),
            start_jitter_pct: default_start_jitter_pct(),
        }
    }
}

impl AcquisitionConfig {
    /// Registry refresh cadence.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.default_poll_interval_ms == 0 {
            return Err(anyhow!("acquisition.default_poll_interval_ms must be > 0"));
        }
        if self.refresh_interval_ms == 0 {
            return Err(anyhow!("acquisition.refresh_interval_ms must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.start_jitter_pct) {
            return Err(anyhow!("acquisition.start_jitter_pct must be within 0..=1"));
        }
        Ok(())
    }
}

/// Protocol client configuration, covering both WebMI and SNMP variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Hard per-request timeout for WebMI calls, independent of retries.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Per-request timeout for SNMP GETs.
    #[serde(default = "default_snmp_timeout_ms")]
    pub snmp_timeout_ms: u64,
    /// Whole-request attempts for transport failures and non-2xx statuses.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base delay of the exponential backoff between attempts.
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            snmp_timeout_ms: default_snmp_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
        }
    }
}

impl ProtocolConfig {
    /// WebMI request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// SNMP request timeout.
    pub fn snmp_timeout(&self) -> Duration {
        Duration::from_millis(self.snmp_timeout_ms)
    }

    /// Backoff base delay.
    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.retry_attempts == 0 {
            return Err(anyhow!("protocol.retry_attempts must be >= 1"));
        }
        if self.request_timeout_ms == 0 || self.snmp_timeout_ms == 0 {
            return Err(anyhow!("protocol timeouts must be > 0"));
        }
        Ok(())
    }
}

/// Circuit breaker configuration.
///
/// The upstream behavior ships no tunables for these; the defaults here are
/// project choices and both are expected to be reviewed per site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures after which the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an open breaker suppresses reads before probing again.
    #[serde(default = "default_cool_down_ms")]
    pub cool_down_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cool_down_ms: default_cool_down_ms(),
        }
    }
}

impl BreakerConfig {
    /// Cool-down window.
    pub fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(anyhow!("breaker.failure_threshold must be >= 1"));
        }
        if self.cool_down_ms == 0 {
            return Err(anyhow!("breaker.cool_down_ms must be > 0"));
        }
        Ok(())
    }
}

/// Buffered bulk writer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Buffer depth at which an immediate flush is triggered.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    /// Minimum depth required before a periodic tick flushes.
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
    /// Periodic flush cadence.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Upper bound on the final drain during shutdown; the process exits
    /// when it elapses even if the tail is still buffered.
    #[serde(default = "default_shutdown_flush_wait_ms")]
    pub shutdown_flush_wait_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: default_max_buffer_size(),
            min_batch_size: default_min_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            shutdown_flush_wait_ms: default_shutdown_flush_wait_ms(),
        }
    }
}

impl WriterConfig {
    /// Periodic flush cadence.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Shutdown drain bound.
    pub fn shutdown_flush_wait(&self) -> Duration {
        Duration::from_millis(self.shutdown_flush_wait_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_buffer_size == 0 {
            return Err(anyhow!("writer.max_buffer_size must be > 0"));
        }
        if self.min_batch_size > self.max_buffer_size {
            return Err(anyhow!(
                "writer.min_batch_size ({}) must not exceed writer.max_buffer_size ({})",
                self.min_batch_size,
                self.max_buffer_size
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(anyhow!("writer.flush_interval_ms must be > 0"));
        }
        Ok(())
    }
}

/// Measurement storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// PostgreSQL connection URL. Empty selects the in-memory store, which
    /// is only useful for bench and simulation runs.
    #[serde(default)]
    pub database_url: String,
    /// Wall-clock bound on a single bulk-insert transaction.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl StorageConfig {
    /// Bulk-insert transaction bound.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Prometheus exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether to expose the `/metrics` endpoint at all.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Bind address of the exporter.
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

/// Tracing output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory receiving the rolling daily log file.
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    /// Stdout format.
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Log file name prefix; defaults to the service name.
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// One device row in a config-file-backed deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Registry identity.
    pub device_id: i32,
    /// Human-readable name.
    pub name: String,
    /// Network address of the device or gateway.
    pub ip_address: String,
    /// Wire protocol.
    #[serde(default)]
    pub protocol: ProtocolKind,
    /// Whether the device participates in acquisition.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-device poll interval; falls back to the acquisition default.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    /// Free-form metadata (SNMP community/port live here).
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Signal definitions for this device.
    #[serde(default)]
    pub tags: Vec<TagEntry>,
}

/// One signal definition under a [`DeviceEntry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagEntry {
    /// Physical signal name.
    pub signal: String,
    /// Protocol address (WebMI key or SNMP OID).
    pub address: String,
    /// Engineering unit.
    #[serde(default)]
    pub unit: Option<String>,
    /// Divisor applied to raw values.
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Whether the signal is read.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Optional operator note.
    #[serde(default)]
    pub description: Option<String>,
}

impl DeviceEntry {
    /// Materialize the schema types this entry describes.
    pub fn into_model(&self, default_poll_interval_ms: u64) -> (Device, Vec<TagMap>) {
        let device = Device {
            device_id: self.device_id,
            name: self.name.clone(),
            ip_address: self.ip_address.clone(),
            protocol: self.protocol,
            enabled: self.enabled,
            poll_interval_ms: self.poll_interval_ms.unwrap_or(default_poll_interval_ms),
            last_seen_utc: None,
            metadata: self.metadata.clone(),
        };
        let mappings = self
            .tags
            .iter()
            .map(|tag| TagMap {
                device_id: self.device_id,
                signal: tag.signal.clone(),
                address: tag.address.clone(),
                unit: tag.unit.clone(),
                scale: tag.scale,
                enabled: tag.enabled,
                description: tag.description.clone(),
            })
            .collect();
        (device, mappings)
    }

    fn validate(&self) -> Result<()> {
        let (device, mappings) = self.into_model(default_poll_interval_ms());
        device
            .validate()
            .map_err(|err| anyhow!("device {}: {err}", self.device_id))?;
        for mapping in &mappings {
            mapping
                .validate()
                .map_err(|err| anyhow!("device {}: {err}", self.device_id))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn config_parses_device_inventory() {
        let raw = r#"
            [writer]
            max_buffer_size = 500

            [[devices]]
            device_id = 1
            name = "tgbt-a"
            ip_address = "10.0.4.21"
            protocol = "webmi"

            [[devices.tags]]
            signal = "U_L1"
            address = "U1_255"
            scale = 100.0
            unit = "V"
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.writer.max_buffer_size, 500);
        assert_eq!(config.devices.len(), 1);

        let (device, tags) = config.devices[0].into_model(1500);
        assert_eq!(device.poll_interval_ms, 1500);
        assert_eq!(tags[0].apply_scale(23_000.0), 230.0);
    }

    #[test]
    fn zero_scale_is_fatal_at_startup() {
        let raw = r#"
            [[devices]]
            device_id = 2
            name = "tgbt-b"
            ip_address = "10.0.4.22"

            [[devices.tags]]
            signal = "I_L1"
            address = "I1_255"
            scale = 0.0
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_picks_the_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wattline.toml");
        std::fs::write(&path, "[breaker]\nfailure_threshold = 7\n").unwrap();

        let missing = dir.path().join("absent.toml");
        let config = AppConfig::load(&[missing, path]).unwrap();
        assert_eq!(config.breaker.failure_threshold, 7);
    }

    #[test]
    fn min_batch_above_max_buffer_is_rejected() {
        let mut config = AppConfig::default();
        config.writer.min_batch_size = 50;
        config.writer.max_buffer_size = 10;
        assert!(config.validate().is_err());
    }
}

//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared configuration and logging primitives."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;
use crate::DEFAULT_DEVICE_PORT;

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    DEFAULT_DEVICE_PORT
}

fn default_request_timeout() -> Duration {
    Duration::from_millis(5000)
}

fn default_min_request_interval() -> Duration {
    Duration::from_millis(300)
}

fn default_read_retries() -> u32 {
    2
}

fn default_write_retries() -> u32 {
    7
}

fn default_retry_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_retry_jitter() -> Duration {
    Duration::from_millis(100)
}

fn default_destination_idle_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_fast_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_medium_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_slow_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_request_delay() -> Duration {
    Duration::from_millis(2000)
}

fn default_poll_timeout() -> Duration {
    Duration::from_millis(2500)
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_discovery_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_probe_window() -> Duration {
    Duration::from_millis(500)
}

fn default_discovery_cache_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_scan_interval() -> Duration {
    Duration::from_secs(600)
}

fn default_min_scan_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_unconfigured_debounce() -> Duration {
    Duration::from_secs(3600)
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(2000)
}

fn default_verification_attempts() -> u32 {
    3
}

fn default_verification_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_stop_power_threshold() -> i32 {
    50
}

fn default_write_attempts() -> u32 {
    8
}

fn default_control_backoff() -> Duration {
    Duration::from_millis(1000)
}

fn default_control_jitter() -> Duration {
    Duration::from_millis(300)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9899))
}

/// Primary configuration object for the R-BESS runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub devices: IndexMap<String, DeviceConfig>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "R_BESS_CONFIG";

    /// Load configuration from disk, respecting the `R_BESS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Retrieve a device configuration by name.
    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.get(name)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;
        self.polling.validate()?;
        self.scanner.validate()?;
        self.control.validate()?;
        if self.discovery.timeout.is_zero() {
            return Err(anyhow!("discovery.timeout_secs must be greater than zero"));
        }
        for (name, device) in &self.devices {
            device.validate(name)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Socket, spacing, and retry settings for the UDP transport.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    #[serde(default = "default_port")]
    pub bind_port: u16,
    #[serde(default = "default_port")]
    pub device_port: u16,
    #[serde(rename = "request_timeout_ms", default = "default_request_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    #[serde(
        rename = "min_request_interval_ms",
        default = "default_min_request_interval"
    )]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_request_interval: Duration,
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(rename = "retry_base_delay_ms", default = "default_retry_base_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_base_delay: Duration,
    #[serde(rename = "retry_jitter_ms", default = "default_retry_jitter")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_jitter: Duration,
    /// Explicit broadcast targets. Empty means enumerate local interfaces.
    #[serde(default)]
    pub broadcast_addresses: Vec<Ipv4Addr>,
    #[serde(
        rename = "destination_idle_ttl_secs",
        default = "default_destination_idle_ttl"
    )]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub destination_idle_ttl: Duration,
}

impl TransportConfig {
    pub fn bind_socket(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.bind_port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(anyhow!("transport.request_timeout_ms must be greater than zero"));
        }
        if self.write_retries <= self.read_retries {
            return Err(anyhow!(
                "transport.write_retries ({}) must exceed transport.read_retries ({})",
                self.write_retries,
                self.read_retries
            ));
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port: default_port(),
            device_port: default_port(),
            request_timeout: default_request_timeout(),
            min_request_interval: default_min_request_interval(),
            read_retries: default_read_retries(),
            write_retries: default_write_retries(),
            retry_base_delay: default_retry_base_delay(),
            retry_jitter: default_retry_jitter(),
            broadcast_addresses: Vec::new(),
            destination_idle_ttl: default_destination_idle_ttl(),
        }
    }
}

/// Codec behaviour toggles.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodecConfig {
    /// Emit warnings for suspicious but legal command values.
    #[serde(default)]
    pub strict: bool,
}

/// Tiered polling schedule and failure policy.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(rename = "fast_interval_secs", default = "default_fast_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub fast_interval: Duration,
    #[serde(rename = "medium_interval_secs", default = "default_medium_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub medium_interval: Duration,
    #[serde(rename = "slow_interval_secs", default = "default_slow_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub slow_interval: Duration,
    #[serde(rename = "request_delay_ms", default = "default_request_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_delay: Duration,
    #[serde(rename = "request_timeout_ms", default = "default_poll_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Poll `PV.GetStatus` in the medium tier.
    #[serde(default = "default_true")]
    pub include_pv: bool,
}

impl PollingConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("polling.fast_interval_secs", self.fast_interval),
            ("polling.medium_interval_secs", self.medium_interval),
            ("polling.slow_interval_secs", self.slow_interval),
            ("polling.request_timeout_ms", self.request_timeout),
        ] {
            if value.is_zero() {
                return Err(anyhow!("{} must be greater than zero", name));
            }
        }
        if self.failure_threshold == 0 {
            return Err(anyhow!("polling.failure_threshold must be at least 1"));
        }
        Ok(())
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            fast_interval: default_fast_interval(),
            medium_interval: default_medium_interval(),
            slow_interval: default_slow_interval(),
            request_delay: default_request_delay(),
            request_timeout: default_poll_timeout(),
            failure_threshold: default_failure_threshold(),
            include_pv: true,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(rename = "timeout_secs", default = "default_discovery_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
    /// Send a wake-up probe and drain its replies before the discovery exchange.
    #[serde(default = "default_true")]
    pub probe: bool,
    #[serde(rename = "probe_window_ms", default = "default_probe_window")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub probe_window: Duration,
    #[serde(rename = "cache_ttl_secs", default = "default_discovery_cache_ttl")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub cache_ttl: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout: default_discovery_timeout(),
            probe: true,
            probe_window: default_probe_window(),
            cache_ttl: default_discovery_cache_ttl(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "interval_secs", default = "default_scan_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub interval: Duration,
    /// Cooldown applied to every scan, whatever triggered it.
    #[serde(rename = "min_interval_secs", default = "default_min_scan_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub min_interval: Duration,
    #[serde(
        rename = "unconfigured_debounce_secs",
        default = "default_unconfigured_debounce"
    )]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub unconfigured_debounce: Duration,
}

impl ScannerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(anyhow!("scanner.interval_secs must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_scan_interval(),
            min_interval: default_min_scan_interval(),
            unconfigured_debounce: default_unconfigured_debounce(),
        }
    }
}

/// Timing of write verification in the control executor.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Wait between a write and its first read-back.
    #[serde(rename = "settle_delay_ms", default = "default_settle_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub settle_delay: Duration,
    #[serde(default = "default_verification_attempts")]
    pub verification_attempts: u32,
    #[serde(
        rename = "verification_interval_ms",
        default = "default_verification_interval"
    )]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub verification_interval: Duration,
    /// Battery power magnitude (W) below which a stop counts as confirmed.
    #[serde(default = "default_stop_power_threshold")]
    pub stop_power_threshold: i32,
    /// Writes sent before an unconfirmed command is given up, the first included.
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,
    /// Backoff after the first unconfirmed write; doubles with each further one.
    #[serde(rename = "retry_backoff_ms", default = "default_control_backoff")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_backoff: Duration,
    #[serde(rename = "retry_jitter_ms", default = "default_control_jitter")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_jitter: Duration,
}

impl ControlConfig {
    pub fn validate(&self) -> Result<()> {
        if self.write_attempts == 0 {
            return Err(anyhow!("control.write_attempts must be at least 1"));
        }
        Ok(())
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            settle_delay: default_settle_delay(),
            verification_attempts: default_verification_attempts(),
            verification_interval: default_verification_interval(),
            stop_power_threshold: default_stop_power_threshold(),
            write_attempts: default_write_attempts(),
            retry_backoff: default_control_backoff(),
            retry_jitter: default_control_jitter(),
        }
    }
}

/// A device the operator has already configured.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub ble_mac: Option<String>,
    #[serde(default)]
    pub wifi_mac: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    /// Value sent as the `id` parameter of device-scoped methods.
    #[serde(default)]
    pub device_index: u8,
}

impl DeviceConfig {
    pub fn new(host: IpAddr) -> Self {
        Self {
            host,
            port: default_port(),
            ble_mac: None,
            wifi_mac: None,
            device_type: None,
            device_index: 0,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.host.is_unspecified() {
            return Err(anyhow!("device '{}' must declare a concrete host", name));
        }
        if self.port == 0 {
            return Err(anyhow!("device '{}' must declare a non-zero port", name));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[transport]
bind_port = 0
min_request_interval_ms = 250
read_retries = 1
write_retries = 5

[codec]
strict = true

[polling]
fast_interval_secs = 15
request_delay_ms = 500
failure_threshold = 4

[devices.garage]
host = "192.168.1.50"
ble_mac = "AA:BB:CC:DD:EE:FF"
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let config: AppConfig = SAMPLE.parse().expect("sample config parses");
        assert_eq!(config.transport.bind_port, 0);
        assert_eq!(config.transport.device_port, 30000);
        assert_eq!(
            config.transport.min_request_interval,
            Duration::from_millis(250)
        );
        assert!(config.codec.strict);
        assert_eq!(config.polling.fast_interval, Duration::from_secs(15));
        assert_eq!(config.polling.medium_interval, Duration::from_secs(60));
        assert_eq!(config.polling.request_delay, Duration::from_millis(500));
        assert_eq!(config.polling.failure_threshold, 4);
        assert_eq!(config.scanner.min_interval, Duration::from_secs(30));

        let garage = config.device("garage").expect("device present");
        assert_eq!(garage.port, 30000);
        assert_eq!(garage.socket_addr().to_string(), "192.168.1.50:30000");
        assert_eq!(garage.ble_mac.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config: AppConfig = "".parse().expect("empty config is valid");
        assert!(config.devices.is_empty());
        assert_eq!(config.transport.read_retries, 2);
        assert_eq!(config.transport.write_retries, 7);
        assert_eq!(config.polling.slow_interval, Duration::from_secs(300));
        assert_eq!(config.metrics.listen.port(), 9899);
    }

    #[test]
    fn rejects_write_budget_not_above_read_budget() {
        let err = "[transport]\nread_retries = 3\nwrite_retries = 3\n"
            .parse::<AppConfig>()
            .expect_err("equal budgets rejected");
        assert!(err.to_string().contains("write_retries"));
    }

    #[test]
    fn control_retries_default_and_reject_zero_budget() {
        let config: AppConfig = "".parse().expect("empty config is valid");
        assert_eq!(config.control.write_attempts, 8);
        assert_eq!(config.control.retry_backoff, Duration::from_millis(1000));

        let err = "[control]\nwrite_attempts = 0\n"
            .parse::<AppConfig>()
            .expect_err("zero write attempts rejected");
        assert!(err.to_string().contains("write_attempts"));
    }

    #[test]
    fn rejects_zero_failure_threshold() {
        let err = "[polling]\nfailure_threshold = 0\n"
            .parse::<AppConfig>()
            .expect_err("zero threshold rejected");
        assert!(err.to_string().contains("failure_threshold"));
    }

    #[test]
    fn rejects_unspecified_device_host() {
        let err = "[devices.bad]\nhost = \"0.0.0.0\"\n"
            .parse::<AppConfig>()
            .expect_err("unspecified host rejected");
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn load_with_source_picks_first_existing_candidate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("missing.toml");
        let present = dir.path().join("present.toml");
        let mut file = fs::File::create(&present).expect("create config");
        file.write_all(SAMPLE.as_bytes()).expect("write config");

        let loaded = AppConfig::load_with_source(&[missing.clone(), present.clone()])
            .expect("config loads");
        assert_eq!(loaded.source, present);
        assert_eq!(loaded.config.devices.len(), 1);

        let err = AppConfig::load_with_source(&[missing]).expect_err("nothing to load");
        assert!(err.to_string().contains("no configuration files found"));
    }
}

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the spikewatch agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Kernel tracer subprocess configuration.
    #[serde(default)]
    pub tracer: TracerConfig,

    /// Rolling telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Spike detector thresholds and state machine timing.
    #[serde(default)]
    pub detector: DetectorConfig,

    /// RCA orchestration and LLM endpoint configuration.
    #[serde(default)]
    pub rca: RcaConfig,

    /// Incident store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Read API / health server configuration.
    #[serde(default)]
    pub api: ApiConfig,
}

/// Kernel tracer subprocess configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TracerConfig {
    /// Tracer executable emitting one JSON event per stdout line.
    #[serde(default)]
    pub command: String,

    /// Arguments passed to the tracer.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Rolling telemetry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Bucket close cadence. Default: 1s.
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Host sample ring size in seconds. Default: 300.
    #[serde(default = "default_host_window_seconds")]
    pub host_window_seconds: usize,

    /// Per-pid snapshot ring size in seconds. Default: 120.
    #[serde(default = "default_pid_window_seconds")]
    pub pid_window_seconds: usize,

    /// Normalized event ring size. Default: 10000.
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    /// Ingest queue capacity between the reader and the ticker.
    /// Default: 65536.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Spike detector thresholds and state machine timing.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Robust-baseline window in seconds. Default: 120.
    #[serde(default = "default_baseline_seconds")]
    pub baseline_seconds: u64,

    /// Robust-z trigger threshold. Default: 3.0.
    #[serde(default = "default_z_threshold")]
    pub z_threshold: f64,

    /// Absolute CPU gate in percent. Default: 70.
    #[serde(default = "default_cpu_floor")]
    pub cpu_floor: f64,

    /// Absolute RAM gate in percent. Default: 80.
    #[serde(default = "default_ram_floor")]
    pub ram_floor: f64,

    /// Consecutive triggers for Candidate → Confirmed. Default: 3.
    #[serde(default = "default_persistence_samples")]
    pub persistence_samples: u32,

    /// Consecutive quiet samples for Confirmed → Cooling. Default: 5.
    #[serde(default = "default_cooldown_samples")]
    pub cooldown_samples: u32,

    /// Quiet seconds for Cooling → Normal. Default: 30.
    #[serde(default = "default_cooling_seconds")]
    pub cooling_seconds: u64,

    /// Debounce between incident creations. Default: 60.
    #[serde(default = "default_min_incident_gap_seconds")]
    pub min_incident_gap_seconds: u64,
}

/// RCA orchestration and LLM endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RcaConfig {
    /// LLM collaborator endpoint. Empty disables remote analysis; local
    /// rankings are still attached with an unavailability summary.
    #[serde(default)]
    pub endpoint: String,

    /// Attribution window the ranker reads, ending at detection.
    /// Default: 60s.
    #[serde(default = "default_attribution_window", with = "humantime_serde")]
    pub attribution_window: Duration,

    /// Per-request timeout. Default: 20s.
    #[serde(default = "default_llm_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Retry budget for transport errors and 5xx replies. Default: 2.
    #[serde(default = "default_llm_retries")]
    pub retries: u32,

    /// Exponential backoff base. Default: 2s.
    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Pending-incident queue depth. Default: 16.
    #[serde(default = "default_rca_queue_depth")]
    pub queue_depth: usize,
}

/// Incident store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Retained incidents, FIFO-evicted beyond this. Default: 200.
    #[serde(default = "default_incident_retention")]
    pub incident_retention: usize,
}

/// Read API / health server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_api_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_host_window_seconds() -> usize {
    300
}

fn default_pid_window_seconds() -> usize {
    120
}

fn default_event_buffer_size() -> usize {
    10_000
}

fn default_queue_capacity() -> usize {
    65_536
}

fn default_baseline_seconds() -> u64 {
    120
}

fn default_z_threshold() -> f64 {
    3.0
}

fn default_cpu_floor() -> f64 {
    70.0
}

fn default_ram_floor() -> f64 {
    80.0
}

fn default_persistence_samples() -> u32 {
    3
}

fn default_cooldown_samples() -> u32 {
    5
}

fn default_cooling_seconds() -> u64 {
    30
}

fn default_min_incident_gap_seconds() -> u64 {
    60
}

fn default_attribution_window() -> Duration {
    Duration::from_secs(60)
}

fn default_llm_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_llm_retries() -> u32 {
    2
}

fn default_backoff_base() -> Duration {
    Duration::from_secs(2)
}

fn default_rca_queue_depth() -> usize {
    16
}

fn default_incident_retention() -> usize {
    200
}

fn default_api_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            tracer: TracerConfig::default(),
            telemetry: TelemetryConfig::default(),
            detector: DetectorConfig::default(),
            rca: RcaConfig::default(),
            store: StoreConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            host_window_seconds: default_host_window_seconds(),
            pid_window_seconds: default_pid_window_seconds(),
            event_buffer_size: default_event_buffer_size(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            baseline_seconds: default_baseline_seconds(),
            z_threshold: default_z_threshold(),
            cpu_floor: default_cpu_floor(),
            ram_floor: default_ram_floor(),
            persistence_samples: default_persistence_samples(),
            cooldown_samples: default_cooldown_samples(),
            cooling_seconds: default_cooling_seconds(),
            min_incident_gap_seconds: default_min_incident_gap_seconds(),
        }
    }
}

impl Default for RcaConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            attribution_window: default_attribution_window(),
            timeout: default_llm_timeout(),
            retries: default_llm_retries(),
            backoff_base: default_backoff_base(),
            queue_depth: default_rca_queue_depth(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            incident_retention: default_incident_retention(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: default_api_addr(),
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
        if self.tracer.command.is_empty() {
            bail!("tracer.command is required");
        }

        if self.telemetry.tick_interval.is_zero() {
            bail!("telemetry.tick_interval must be positive");
        }

        if self.telemetry.host_window_seconds == 0 {
            bail!("telemetry.host_window_seconds must be positive");
        }

        if self.telemetry.pid_window_seconds == 0 {
            bail!("telemetry.pid_window_seconds must be positive");
        }

        if self.telemetry.queue_capacity == 0 {
            bail!("telemetry.queue_capacity must be positive");
        }

        if self.detector.baseline_seconds == 0 {
            bail!("detector.baseline_seconds must be positive");
        }

        if self.detector.z_threshold <= 0.0 {
            bail!("detector.z_threshold must be positive");
        }

        if !(0.0..=100.0).contains(&self.detector.cpu_floor)
            || !(0.0..=100.0).contains(&self.detector.ram_floor)
        {
            bail!("detector floors must be percentages in [0, 100]");
        }

        if self.detector.persistence_samples == 0 {
            bail!("detector.persistence_samples must be at least 1");
        }

        if self.rca.attribution_window.is_zero() {
            bail!("rca.attribution_window must be positive");
        }

        if self.rca.queue_depth == 0 {
            bail!("rca.queue_depth must be positive");
        }

        if self.store.incident_retention == 0 {
            bail!("store.incident_retention must be positive");
        }

        if self.api.addr.is_empty() {
            bail!("api.addr is required");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            tracer: TracerConfig {
                command: "etw-tracer.exe".to_string(),
                args: vec!["--kernel".to_string()],
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.telemetry.tick_interval, Duration::from_secs(1));
        assert_eq!(cfg.telemetry.host_window_seconds, 300);
        assert_eq!(cfg.telemetry.pid_window_seconds, 120);
        assert_eq!(cfg.detector.baseline_seconds, 120);
        assert_eq!(cfg.detector.z_threshold, 3.0);
        assert_eq!(cfg.detector.cpu_floor, 70.0);
        assert_eq!(cfg.detector.ram_floor, 80.0);
        assert_eq!(cfg.detector.persistence_samples, 3);
        assert_eq!(cfg.detector.cooldown_samples, 5);
        assert_eq!(cfg.detector.cooling_seconds, 30);
        assert_eq!(cfg.detector.min_incident_gap_seconds, 60);
        assert_eq!(cfg.rca.timeout, Duration::from_secs(20));
        assert_eq!(cfg.rca.retries, 2);
        assert_eq!(cfg.rca.queue_depth, 16);
        assert_eq!(cfg.store.incident_retention, 200);
        assert_eq!(cfg.api.addr, ":9090");
    }

    #[test]
    fn test_validation_requires_tracer_command() {
        let cfg = Config::default();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("tracer.command"));

        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_thresholds() {
        let mut cfg = valid_config();
        cfg.detector.z_threshold = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.detector.cpu_floor = 120.0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.detector.persistence_samples = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.store.incident_retention = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_yaml_parsing_with_defaults() {
        let yaml = r#"
tracer:
  command: "C:/tracers/EtwKernelTracer.exe"
detector:
  z_threshold: 2.5
  cpu_floor: 75
rca:
  endpoint: "http://127.0.0.1:5001/analyze"
  timeout: 10s
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parses");
        assert_eq!(cfg.tracer.command, "C:/tracers/EtwKernelTracer.exe");
        assert_eq!(cfg.detector.z_threshold, 2.5);
        assert_eq!(cfg.detector.cpu_floor, 75.0);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.detector.ram_floor, 80.0);
        assert_eq!(cfg.rca.timeout, Duration::from_secs(10));
        assert_eq!(cfg.rca.retries, 2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_yaml_rejects_bad_duration() {
        let yaml = r#"
tracer:
  command: "t.exe"
telemetry:
  tick_interval: "not-a-duration"
"#;
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }
}

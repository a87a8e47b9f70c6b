use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the wattscope agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// TCP address for the scrape server. Default: "0.0.0.0:8888".
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// URL path for metrics. Default: "/metrics".
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    /// Collection tick duration. Default: 3s.
    #[serde(default = "default_sample_period", with = "humantime_serde")]
    pub sample_period: Duration,

    /// Turn on the accelerator source. Default: false.
    #[serde(default)]
    pub enable_gpu: bool,

    /// Use the tracing-reported cgroup id for container identity.
    /// Default: true.
    #[serde(default = "default_true")]
    pub enable_cgroup_id: bool,

    /// Include hardware counter channels in exposition. Default: true.
    #[serde(default = "default_true")]
    pub expose_hardware_counter_metrics: bool,

    /// Network endpoint for power-model inference. Empty = disabled.
    #[serde(default)]
    pub model_server_endpoint: String,

    /// Kubelet stats-summary endpoint (e.g. "http://localhost:10250").
    /// Empty = kubelet channels disabled.
    #[serde(default)]
    pub kubelet_endpoint: String,

    /// Allow the model-specific-register energy backend when the sysfs
    /// counters are missing. Default: false.
    #[serde(default)]
    pub enable_msr: bool,

    /// Consecutive transient failures before a source is demoted to
    /// unavailable. Default: 5.
    #[serde(default = "default_max_transient_failures")]
    pub max_transient_failures: u32,

    /// Override for the cgroup filesystem root. Empty = probe the standard
    /// candidates.
    #[serde(default)]
    pub cgroup_root: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0:8888".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_sample_period() -> Duration {
    Duration::from_secs(3)
}

fn default_true() -> bool {
    true
}

fn default_max_transient_failures() -> u32 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            bind_address: default_bind_address(),
            metrics_path: default_metrics_path(),
            sample_period: default_sample_period(),
            enable_gpu: false,
            enable_cgroup_id: true,
            expose_hardware_counter_metrics: true,
            model_server_endpoint: String::new(),
            kubelet_endpoint: String::new(),
            enable_msr: false,
            max_transient_failures: default_max_transient_failures(),
            cgroup_root: String::new(),
        }
    }
}

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

    /// Validate the configuration. Invalid configuration is the only fatal
    /// error class: the agent refuses to start.
    pub fn validate(&self) -> Result<()> {
        self.bind_address
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid bind_address: {}", self.bind_address))?;

        if !self.metrics_path.starts_with('/') {
            bail!("metrics_path must start with '/': {}", self.metrics_path);
        }

        if self.sample_period < Duration::from_secs(1) {
            bail!("sample_period must be at least 1s (sub-second sampling is unsupported)");
        }

        if self.max_transient_failures == 0 {
            bail!("max_transient_failures must be positive");
        }

        if !self.model_server_endpoint.is_empty() && !self.model_server_endpoint.starts_with("http")
        {
            bail!(
                "model_server_endpoint must be an http(s) URL: {}",
                self.model_server_endpoint
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.bind_address, "0.0.0.0:8888");
        assert_eq!(cfg.metrics_path, "/metrics");
        assert_eq!(cfg.sample_period, Duration::from_secs(3));
        assert!(cfg.enable_cgroup_id);
        assert!(!cfg.enable_gpu);
    }

    #[test]
    fn test_validation_rejects_bad_bind_address() {
        let cfg = Config {
            bind_address: "not-an-address".to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_subsecond_period() {
        let cfg = Config {
            sample_period: Duration::from_millis(200),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("sample_period"));
    }

    #[test]
    fn test_validation_rejects_relative_metrics_path() {
        let cfg = Config {
            metrics_path: "metrics".to_string(),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("metrics_path"));
    }

    #[test]
    fn test_validation_rejects_non_http_model_endpoint() {
        let cfg = Config {
            model_server_endpoint: "ftp://models".to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip_with_humantime() {
        let cfg: Config = serde_yaml::from_str(
            "bind_address: \"127.0.0.1:9100\"\nsample_period: 10s\nenable_gpu: true\n",
        )
        .expect("yaml parses");
        assert_eq!(cfg.bind_address, "127.0.0.1:9100");
        assert_eq!(cfg.sample_period, Duration::from_secs(10));
        assert!(cfg.enable_gpu);
    }
}

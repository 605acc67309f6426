use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// How long `stop` waits for a loop to exit before abandoning it
    #[serde(default = "default_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            log_level: default_log_level(),
            shutdown_grace_ms: default_grace_ms(),
        }
    }
}

impl AgentConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CollectorConfig {
    #[serde(default)]
    pub resource: ResourceCollectorConfig,
    #[serde(default)]
    pub network: NetworkCollectorConfig,
    #[serde(default)]
    pub process: ProcessCollectorConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResourceCollectorConfig {
    #[serde(default = "default_resource_interval")]
    pub interval_ms: u64,
    /// Upper bound on one filesystem scan
    #[serde(default = "default_disk_timeout")]
    pub disk_timeout_secs: u64,
}

impl Default for ResourceCollectorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_resource_interval(),
            disk_timeout_secs: default_disk_timeout(),
        }
    }
}

impl ResourceCollectorConfig {
    pub fn disk_timeout(&self) -> Duration {
        Duration::from_secs(self.disk_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkCollectorConfig {
    #[serde(default = "default_second")]
    pub interval_ms: u64,
    #[serde(default = "default_exclude_interfaces")]
    pub exclude_interfaces: Vec<String>,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for NetworkCollectorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_second(),
            exclude_interfaces: default_exclude_interfaces(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessCollectorConfig {
    #[serde(default = "default_second")]
    pub interval_ms: u64,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for ProcessCollectorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_second(),
            top_n: default_top_n(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RealtimeConfig {
    /// Pause between processing cycles. Zero runs the loop back to back.
    #[serde(default = "default_realtime_interval")]
    pub interval_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self { interval_ms: default_realtime_interval() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ThresholdConfig {
    #[serde(default = "default_80")]
    pub cpu_warn_percent: f64,
    #[serde(default = "default_95")]
    pub cpu_critical_percent: f64,
    #[serde(default = "default_80")]
    pub memory_warn_percent: f64,
    #[serde(default = "default_90")]
    pub memory_critical_percent: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            cpu_warn_percent: 80.0,
            cpu_critical_percent: 95.0,
            memory_warn_percent: 80.0,
            memory_critical_percent: 90.0,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        // Expand environment variables
        let expanded = expand_env_vars(content)?;

        let config: Config = toml::from_str(&expanded)
            .with_context(|| "Failed to parse configuration")?;

        Ok(config)
    }
}

/// Expand ${ENV_VAR} references in config string
fn expand_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .to_string())
}

// Default value functions
fn default_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
fn default_log_level() -> String { "info".to_string() }
fn default_grace_ms() -> u64 { 1000 }
fn default_resource_interval() -> u64 { 100 }
fn default_second() -> u64 { 1000 }
fn default_realtime_interval() -> u64 { 100 }
fn default_top_n() -> usize { 10 }
fn default_command_timeout() -> u64 { 10 }
fn default_disk_timeout() -> u64 { 5 }
fn default_exclude_interfaces() -> Vec<String> { vec!["lo".into()] }
fn default_80() -> f64 { 80.0 }
fn default_90() -> f64 { 90.0 }
fn default_95() -> f64 { 95.0 }

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.collector.resource.interval_ms, 100);
        assert_eq!(config.collector.resource.disk_timeout(), Duration::from_secs(5));
        assert_eq!(config.collector.network.interval_ms, 1000);
        assert_eq!(config.collector.process.interval_ms, 1000);
        assert_eq!(config.collector.process.top_n, 10);
        assert_eq!(config.agent.shutdown_grace(), Duration::from_secs(1));
        assert_eq!(config.collector.network.exclude_interfaces, vec!["lo".to_string()]);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = Config::parse(
            r#"
            [collector.realtime]
            interval_ms = 0

            [thresholds]
            cpu_warn_percent = 50.0
            "#,
        )
        .unwrap();
        assert_eq!(config.collector.realtime.interval_ms, 0);
        assert_eq!(config.thresholds.cpu_warn_percent, 50.0);
        assert_eq!(config.thresholds.cpu_critical_percent, 95.0);
    }

    #[test]
    fn expands_environment_references() {
        std::env::set_var("ZENITH_TEST_LOG_LEVEL", "debug");
        let config = Config::parse(
            r#"
            [agent]
            log_level = "${ZENITH_TEST_LOG_LEVEL}"
            hostname = "${ZENITH_TEST_UNSET_VARIABLE}"
            "#,
        )
        .unwrap();
        assert_eq!(config.agent.log_level, "debug");
        assert_eq!(config.agent.hostname, "");
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[collector.process]\ntop_n = 5").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.collector.process.top_n, 5);
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(Config::parse("[agent\nlog_level = 1").is_err());
        assert!(Config::load("/nonexistent/zenith/config.toml").is_err());
    }
}

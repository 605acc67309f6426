//! Platform strategies for raw counter and process-list acquisition.
//!
//! Each operating system gets its own [`CounterSource`] with an internal
//! fallback chain. The variant is picked once at startup by [`detect`].

pub mod command;
pub mod linux;
pub mod macos;
pub mod windows;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CollectorConfig;

/// Cumulative byte totals summed across all monitored interfaces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkCounters {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

impl NetworkCounters {
    fn add(&mut self, tx_bytes: u64, rx_bytes: u64) {
        self.tx_bytes = self.tx_bytes.saturating_add(tx_bytes);
        self.rx_bytes = self.rx_bytes.saturating_add(rx_bytes);
    }
}

/// Trait for platform counter sources.
///
/// Implementations run their own fallback chain and only return an error
/// once every strategy has failed.
#[async_trait]
pub trait CounterSource: Send + Sync {
    /// Human-readable name for this source (e.g., "linux")
    fn name(&self) -> &str;

    /// Read cumulative transmit/receive byte counters.
    async fn read_network_counters(&self) -> Result<NetworkCounters>;

    /// List up to `limit` process names ranked by CPU activity, busiest first.
    async fn list_top_processes(&self, limit: usize) -> Result<Vec<String>>;
}

/// Operating system family the agent was built for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl Platform {
    pub const fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Other
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Platform::Linux => "linux",
            Platform::MacOs => "macos",
            Platform::Windows => "windows",
            Platform::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// Options shared by every platform source
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub exclude_interfaces: Vec<String>,
    pub command_timeout: Duration,
}

impl SourceOptions {
    pub fn from_config(config: &CollectorConfig) -> Self {
        let secs = config
            .network
            .command_timeout_secs
            .max(config.process.command_timeout_secs);
        Self {
            exclude_interfaces: config.network.exclude_interfaces.clone(),
            command_timeout: Duration::from_secs(secs),
        }
    }

    fn is_excluded(&self, iface: &str) -> bool {
        self.exclude_interfaces.iter().any(|e| e == iface)
    }
}

/// Source for platforms without a strategy: zero counters, no processes.
pub struct UnsupportedSource;

#[async_trait]
impl CounterSource for UnsupportedSource {
    fn name(&self) -> &str {
        "unsupported"
    }

    async fn read_network_counters(&self) -> Result<NetworkCounters> {
        Ok(NetworkCounters::default())
    }

    async fn list_top_processes(&self, _limit: usize) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Pick the counter source for the platform this binary was built for.
pub fn detect(options: SourceOptions) -> Arc<dyn CounterSource> {
    let source: Arc<dyn CounterSource> = match Platform::current() {
        Platform::Linux => Arc::new(linux::LinuxSource::new(options)),
        Platform::MacOs => Arc::new(macos::MacSource::new(options)),
        Platform::Windows => Arc::new(windows::WindowsSource::new(options)),
        Platform::Other => {
            tracing::warn!("No counter source for this operating system, metrics will read zero");
            Arc::new(UnsupportedSource)
        }
    };

    tracing::info!(source = source.name(), "Selected counter source");
    source
}

/// Parse `ps` style output of a command column followed by a CPU column.
///
/// Rows whose trailing field is not numeric are skipped. With `strip_path`
/// the command is reduced to its final path component.
pub(crate) fn parse_ps_listing(
    output: &str,
    skip_header: bool,
    strip_path: bool,
    limit: usize,
) -> Vec<String> {
    output
        .lines()
        .skip(usize::from(skip_header))
        .filter_map(|line| {
            let (command, cpu) = line.trim().rsplit_once(char::is_whitespace)?;
            cpu.trim().parse::<f64>().ok()?;
            let command = command.trim();
            let name = if strip_path {
                command.rsplit('/').next().unwrap_or(command)
            } else {
                command
            };
            (!name.is_empty()).then(|| name.to_string())
        })
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ps_listing_keeps_order_and_limit() {
        let output = "chrome 12.5\nbash 3.0\nsshd 0.1\n";
        assert_eq!(parse_ps_listing(output, false, false, 2), vec!["chrome", "bash"]);
    }

    #[test]
    fn ps_listing_skips_header_and_garbage() {
        let output = "COMMAND %CPU\n/usr/bin/zsh 4.2\nnot-a-row\n\n/Applications/Web Content 1.0\n";
        assert_eq!(
            parse_ps_listing(output, true, true, 10),
            vec!["zsh", "Web Content"]
        );
    }

    #[test]
    fn ps_listing_leaves_kernel_thread_names_intact() {
        let output = "kworker/0:1-events   0.3\n";
        assert_eq!(parse_ps_listing(output, false, false, 10), vec!["kworker/0:1-events"]);
    }

    #[tokio::test]
    async fn unsupported_source_reads_zero() {
        let source = UnsupportedSource;
        assert_eq!(source.read_network_counters().await.unwrap(), NetworkCounters::default());
        assert!(source.list_top_processes(10).await.unwrap().is_empty());
    }
}

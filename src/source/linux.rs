use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{command, parse_ps_listing, CounterSource, NetworkCounters, SourceOptions};

const IFF_LOOPBACK: u32 = 0x8;

/// Reads counters from sysfs, falling back to /proc/net/dev
pub struct LinuxSource {
    options: SourceOptions,
    sys_class_net: PathBuf,
    proc_net_dev: PathBuf,
}

impl LinuxSource {
    pub fn new(options: SourceOptions) -> Self {
        Self::with_roots(options, "/sys/class/net", "/proc/net/dev")
    }

    /// Build a source reading from alternate sysfs/procfs locations.
    pub fn with_roots(
        options: SourceOptions,
        sys_class_net: impl Into<PathBuf>,
        proc_net_dev: impl Into<PathBuf>,
    ) -> Self {
        Self {
            options,
            sys_class_net: sys_class_net.into(),
            proc_net_dev: proc_net_dev.into(),
        }
    }

    /// Sum statistics of every non-loopback interface.
    ///
    /// Interfaces that are administratively down still count: their counters
    /// stand still, so toggling a link never moves the total.
    async fn read_sysfs(&self) -> Result<NetworkCounters> {
        let mut counters = NetworkCounters::default();
        let mut entries = tokio::fs::read_dir(&self.sys_class_net)
            .await
            .with_context(|| format!("Failed to list {}", self.sys_class_net.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.options.is_excluded(&name) {
                continue;
            }

            let dir = entry.path();
            if let Some(flags) = read_flags(&dir).await {
                if flags & IFF_LOOPBACK != 0 {
                    continue;
                }
            }

            let stats = dir.join("statistics");
            let tx = read_counter(&stats.join("tx_bytes")).await;
            let rx = read_counter(&stats.join("rx_bytes")).await;
            match (tx, rx) {
                (Some(tx), Some(rx)) => counters.add(tx, rx),
                _ => debug!(interface = %name, "Skipping interface without readable statistics"),
            }
        }

        Ok(counters)
    }

    async fn read_proc_net_dev(&self) -> Result<NetworkCounters> {
        let content = tokio::fs::read_to_string(&self.proc_net_dev)
            .await
            .with_context(|| format!("Failed to read {}", self.proc_net_dev.display()))?;
        Ok(parse_proc_net_dev(&content, &self.options))
    }
}

#[async_trait]
impl CounterSource for LinuxSource {
    fn name(&self) -> &str {
        "linux"
    }

    async fn read_network_counters(&self) -> Result<NetworkCounters> {
        match self.read_sysfs().await {
            Ok(counters) => Ok(counters),
            Err(e) => {
                debug!(error = %e, "sysfs unavailable, falling back to procfs");
                self.read_proc_net_dev()
                    .await
                    .context("All Linux network counter strategies failed")
            }
        }
    }

    async fn list_top_processes(&self, limit: usize) -> Result<Vec<String>> {
        let output = command::run(
            "ps",
            &["-eo", "comm,pcpu", "--sort=-pcpu", "--no-headers"],
            self.options.command_timeout,
        )
        .await?;
        Ok(parse_ps_listing(&output, false, false, limit))
    }
}

async fn read_flags(dir: &Path) -> Option<u32> {
    let raw = tokio::fs::read_to_string(dir.join("flags")).await.ok()?;
    u32::from_str_radix(raw.trim().trim_start_matches("0x"), 16).ok()
}

async fn read_counter(path: &Path) -> Option<u64> {
    tokio::fs::read_to_string(path).await.ok()?.trim().parse().ok()
}

/// Sum rx/tx bytes from /proc/net/dev, skipping loopback and excluded interfaces
fn parse_proc_net_dev(content: &str, options: &SourceOptions) -> NetworkCounters {
    let mut counters = NetworkCounters::default();

    for line in content.lines().skip(2) {
        let Some((iface, rest)) = line.split_once(':') else { continue };
        let iface = iface.trim();
        if iface == "lo" || options.is_excluded(iface) {
            continue;
        }

        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 16 {
            continue;
        }

        // Receive bytes lead the row, transmit bytes start the second half
        match (fields[8].parse::<u64>(), fields[0].parse::<u64>()) {
            (Ok(tx), Ok(rx)) => counters.add(tx, rx),
            _ => continue,
        }
    }

    counters
}

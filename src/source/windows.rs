use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::{command, CounterSource, NetworkCounters, SourceOptions};

const ADAPTER_STATISTICS: &str = "Get-NetAdapterStatistics | Where-Object {$_.Name -notlike '*Loopback*'} | Measure-Object -Property BytesSent,BytesReceived -Sum | Select-Object -ExpandProperty Sum";

/// Queries adapter statistics through PowerShell, falling back to WMI
pub struct WindowsSource {
    options: SourceOptions,
}

impl WindowsSource {
    pub fn new(options: SourceOptions) -> Self {
        Self { options }
    }

    async fn adapter_statistics(&self) -> Result<NetworkCounters> {
        let output = command::run(
            "powershell.exe",
            &["-NoProfile", "-NonInteractive", "-Command", ADAPTER_STATISTICS],
            self.options.command_timeout,
        )
        .await?;
        parse_measure_object(&output)
    }

    async fn wmi_raw_counters(&self) -> Result<NetworkCounters> {
        let output = command::run(
            "wmic",
            &[
                "path",
                "Win32_PerfRawData_Tcpip_NetworkInterface",
                "get",
                "BytesReceivedPersec,BytesSentPersec,Name",
                "/format:csv",
            ],
            self.options.command_timeout,
        )
        .await?;
        Ok(parse_wmic_counters(&output))
    }

    async fn wmi_processes(&self, limit: usize) -> Result<Vec<String>> {
        let output = command::run(
            "wmic",
            &[
                "path",
                "Win32_PerfFormattedData_PerfProc_Process",
                "get",
                "Name,PercentProcessorTime",
                "/format:csv",
            ],
            self.options.command_timeout,
        )
        .await?;
        Ok(parse_wmic_processes(&output, limit))
    }

    async fn tasklist(&self, limit: usize) -> Result<Vec<String>> {
        let output = command::run("tasklist", &["/fo", "csv", "/nh"], self.options.command_timeout)
            .await?;
        Ok(parse_tasklist(&output, limit))
    }
}

#[async_trait]
impl CounterSource for WindowsSource {
    fn name(&self) -> &str {
        "windows"
    }

    async fn read_network_counters(&self) -> Result<NetworkCounters> {
        match self.adapter_statistics().await {
            Ok(counters) => Ok(counters),
            Err(e) => {
                warn!(error = %e, "Adapter statistics unavailable, falling back to WMI");
                self.wmi_raw_counters()
                    .await
                    .context("All Windows network counter strategies failed")
            }
        }
    }

    async fn list_top_processes(&self, limit: usize) -> Result<Vec<String>> {
        match self.wmi_processes(limit).await {
            Ok(names) => Ok(names),
            Err(e) => {
                debug!(error = %e, "WMI process query failed, falling back to tasklist");
                self.tasklist(limit).await
            }
        }
    }
}

/// `Measure-Object ... -ExpandProperty Sum` prints the sent total, then the received total
fn parse_measure_object(output: &str) -> Result<NetworkCounters> {
    let mut sums = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| l.parse::<f64>().map(|v| v as u64));

    let tx = sums
        .next()
        .ok_or_else(|| anyhow!("missing BytesSent sum"))?
        .context("malformed BytesSent sum")?;
    let rx = sums
        .next()
        .ok_or_else(|| anyhow!("missing BytesReceived sum"))?
        .context("malformed BytesReceived sum")?;

    Ok(NetworkCounters { tx_bytes: tx, rx_bytes: rx })
}

/// wmic prints CSV columns alphabetically: `Node,BytesReceivedPersec,BytesSentPersec,Name`
fn parse_wmic_counters(output: &str) -> NetworkCounters {
    let mut counters = NetworkCounters::default();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("Node") {
            continue;
        }
        let parts: Vec<&str> = line.splitn(4, ',').collect();
        if parts.len() < 4 || parts[3].to_ascii_lowercase().contains("loopback") {
            continue;
        }

        let rx = parts[1].trim().parse::<u64>().unwrap_or(0);
        let tx = parts[2].trim().parse::<u64>().unwrap_or(0);
        counters.add(tx, rx);
    }

    counters
}

/// CSV columns are `Node,Name,PercentProcessorTime`; instances such as
/// `chrome#3` collapse onto their image name, keeping the busiest figure.
fn parse_wmic_processes(output: &str, limit: usize) -> Vec<String> {
    let mut busiest: HashMap<String, f64> = HashMap::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("Node") {
            continue;
        }
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() < 3 {
            continue;
        }
        let name = parts[1].trim();
        let name = name.split('#').next().unwrap_or(name);
        if name.is_empty() || name == "_Total" || name == "Idle" {
            continue;
        }
        let Ok(cpu) = parts[2].trim().parse::<f64>() else { continue };

        let entry = busiest.entry(name.to_string()).or_insert(cpu);
        if cpu > *entry {
            *entry = cpu;
        }
    }

    let mut rows: Vec<(String, f64)> = busiest.into_iter().collect();
    rows.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    rows.into_iter().take(limit).map(|(name, _)| name).collect()
}

/// First quoted CSV field of `tasklist /fo csv /nh`
fn parse_tasklist(output: &str, limit: usize) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let name = line.split(',').next()?.trim().trim_matches('"');
            (!name.is_empty()).then(|| name.to_string())
        })
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measure_object_reads_sent_then_received() {
        let counters = parse_measure_object("\r\n123456\r\n654321\r\n").unwrap();
        assert_eq!(counters, NetworkCounters { tx_bytes: 123456, rx_bytes: 654321 });
    }

    #[test]
    fn measure_object_requires_both_sums() {
        assert!(parse_measure_object("42\n").is_err());
        assert!(parse_measure_object("abc\n12\n").is_err());
    }

    #[test]
    fn wmic_counters_skip_header_and_loopback() {
        let output = "\r\nNode,BytesReceivedPersec,BytesSentPersec,Name\r\n\
HOST,1000,200,Intel[R] Ethernet Connection I219-V\r\n\
HOST,,,isatap.localdomain\r\n\
HOST,50,50,Software Loopback Interface 1\r\n\
HOST,3000,800,Realtek PCIe GbE, 2.5G\r\n";
        let counters = parse_wmic_counters(output);
        assert_eq!(counters, NetworkCounters { tx_bytes: 1000, rx_bytes: 4000 });
    }

    #[test]
    fn wmic_processes_rank_by_cpu() {
        let output = "Node,Name,PercentProcessorTime\n\
HOST,_Total,100\n\
HOST,Idle,80\n\
HOST,chrome#2,5\n\
HOST,explorer,12\n\
HOST,svchost,not-a-number\n\
HOST,chrome,7\n";
        assert_eq!(parse_wmic_processes(output, 2), vec!["explorer", "chrome"]);
    }

    #[test]
    fn wmic_instances_share_one_slot() {
        let output = "Node,Name,PercentProcessorTime\n\
HOST,chrome,9\n\
HOST,chrome#1,30\n\
HOST,chrome#2,20\n\
HOST,code,15\n\
HOST,slack,4\n";
        assert_eq!(parse_wmic_processes(output, 3), vec!["chrome", "code", "slack"]);
    }

    #[test]
    fn tasklist_takes_image_names() {
        let output = "\"System Idle Process\",\"0\",\"Services\",\"0\",\"8 K\"\n\"explorer.exe\",\"4242\",\"Console\",\"1\",\"90,000 K\"\n";
        assert_eq!(
            parse_tasklist(output, 10),
            vec!["System Idle Process", "explorer.exe"]
        );
    }
}

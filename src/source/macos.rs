use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;

use super::{command, parse_ps_listing, CounterSource, NetworkCounters, SourceOptions};

/// Parses `netstat` and `ps` output on macOS and other BSD-style systems
pub struct MacSource {
    options: SourceOptions,
}

impl MacSource {
    pub fn new(options: SourceOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl CounterSource for MacSource {
    fn name(&self) -> &str {
        "macos"
    }

    async fn read_network_counters(&self) -> Result<NetworkCounters> {
        let output = command::run("netstat", &["-ibn"], self.options.command_timeout)
            .await
            .context("Failed to read macOS network statistics")?;
        Ok(parse_netstat(&output, &self.options))
    }

    async fn list_top_processes(&self, limit: usize) -> Result<Vec<String>> {
        // BSD ps has no --sort; -r orders by CPU usage
        let output = command::run("ps", &["-Ao", "comm,%cpu", "-r"], self.options.command_timeout)
            .await?;
        Ok(parse_ps_listing(&output, true, true, limit))
    }
}

/// Sum the link-level rows of `netstat -ibn`.
///
/// Every interface has one `<Link#N>` row followed by one row per address
/// carrying the same totals, so only the first row per interface counts.
/// The address column may be blank, which shifts the leading columns; the
/// byte columns are located from the end of the row instead.
fn parse_netstat(content: &str, options: &SourceOptions) -> NetworkCounters {
    let mut counters = NetworkCounters::default();
    let mut seen = HashSet::new();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 || parts[0] == "Name" {
            continue;
        }

        let iface = parts[0].trim_end_matches('*');
        if iface.starts_with("lo") || options.is_excluded(iface) {
            continue;
        }
        if !parts[2].starts_with("<Link#") || seen.contains(iface) {
            continue;
        }

        let n = parts.len();
        match (parts[n - 2].parse::<u64>(), parts[n - 5].parse::<u64>()) {
            (Ok(tx), Ok(rx)) => {
                counters.add(tx, rx);
                seen.insert(iface.to_string());
            }
            _ => continue,
        }
    }

    counters
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const NETSTAT: &str = "\
Name       Mtu   Network       Address            Ipkts Ierrs     Ibytes    Opkts Oerrs     Obytes  Coll
lo0        16384 <Link#1>                          5000     0     800000     5000     0     800000     0
lo0        16384 127           127.0.0.1           5000     -     800000     5000     -     800000     -
en0        1500  <Link#4>    a4:83:e7:12:34:56     1200     0      65000      900     0      12000     0
en0        1500  192.168.1     192.168.1.10        1200     -      65000      900     -      12000     -
utun0      1380  <Link#9>                            10     0       3000       12     0       1000     0
en1*       1500  <Link#5>    a4:83:e7:12:34:57        0     0          0        0     0          0     0
gif0*      1280  <Link#2>                          oops     0       oops        0     0       oops     0
";

    #[test]
    fn sums_one_link_row_per_interface() {
        let options = SourceOptions {
            exclude_interfaces: vec![],
            command_timeout: Duration::from_secs(5),
        };
        let counters = parse_netstat(NETSTAT, &options);
        assert_eq!(counters, NetworkCounters { tx_bytes: 13000, rx_bytes: 68000 });
    }

    #[test]
    fn honours_excluded_interfaces() {
        let options = SourceOptions {
            exclude_interfaces: vec!["utun0".into()],
            command_timeout: Duration::from_secs(5),
        };
        let counters = parse_netstat(NETSTAT, &options);
        assert_eq!(counters, NetworkCounters { tx_bytes: 12000, rx_bytes: 65000 });
    }
}

use anyhow::Result;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

use crate::config::ThresholdConfig;
use crate::types::{MetricFamily, Severity, Snapshot};
use super::SnapshotSink;

/// Logs every snapshot at DEBUG
pub struct LogSink;

impl SnapshotSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn process(&mut self, timestamps: &[f64], snapshot: &Snapshot) -> Result<()> {
        if tracing::enabled!(tracing::Level::DEBUG) {
            let metrics = serde_json::to_string(&snapshot.flatten())?;
            debug!(cycle = timestamps.len(), %metrics, "Snapshot");
        }
        Ok(())
    }
}

/// A threshold crossing
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub timestamp: f64,
    pub severity: Severity,
    pub family: MetricFamily,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub hostname: String,
}

/// Compares CPU and memory usage against warn/critical thresholds.
///
/// Only changes of severity are logged, so a sustained breach produces one
/// line when it starts and one when it clears.
pub struct ThresholdSink {
    thresholds: ThresholdConfig,
    hostname: String,
    current: HashMap<MetricFamily, Severity>,
}

impl ThresholdSink {
    pub fn new(config: &ThresholdConfig, hostname: impl Into<String>) -> Self {
        Self {
            thresholds: config.clone(),
            hostname: hostname.into(),
            current: HashMap::new(),
        }
    }

    /// Alerts raised by this snapshot, regardless of previous state
    pub fn evaluate(&self, timestamp: f64, snapshot: &Snapshot) -> Vec<Alert> {
        let checks = [
            (
                MetricFamily::Cpu,
                self.thresholds.cpu_warn_percent,
                self.thresholds.cpu_critical_percent,
            ),
            (
                MetricFamily::Memory,
                self.thresholds.memory_warn_percent,
                self.thresholds.memory_critical_percent,
            ),
        ];

        checks
            .into_iter()
            .filter_map(|(family, warn, crit)| {
                let value = snapshot.get(family, "usage")?;
                self.check(timestamp, family, value, warn, crit)
            })
            .collect()
    }

    fn check(&self, timestamp: f64, family: MetricFamily, value: f64, warn: f64, crit: f64) -> Option<Alert> {
        let (severity, threshold) = if value >= crit {
            (Severity::Critical, crit)
        } else if value >= warn {
            (Severity::Warn, warn)
        } else {
            return None;
        };

        Some(Alert {
            timestamp,
            severity,
            family,
            value,
            threshold,
            message: format!("{} is {:.1}% (threshold: {:.1}%)", family, value, threshold),
            hostname: self.hostname.clone(),
        })
    }
}

impl SnapshotSink for ThresholdSink {
    fn name(&self) -> &str {
        "threshold"
    }

    fn process(&mut self, timestamps: &[f64], snapshot: &Snapshot) -> Result<()> {
        let timestamp = timestamps.last().copied().unwrap_or_default();
        let alerts = self.evaluate(timestamp, snapshot);

        for family in [MetricFamily::Cpu, MetricFamily::Memory] {
            let alert = alerts.iter().find(|a| a.family == family);
            let severity = alert.map(|a| a.severity);
            if self.current.get(&family).copied() == severity {
                continue;
            }

            match alert {
                Some(a) if a.severity == Severity::Critical => {
                    error!(metric = %family, severity = %a.severity, host = %a.hostname, "{}", a.message)
                }
                Some(a) => {
                    warn!(metric = %family, severity = %a.severity, host = %a.hostname, "{}", a.message)
                }
                None => info!(metric = %family, "Back below thresholds"),
            }

            match severity {
                Some(s) => self.current.insert(family, s),
                None => self.current.remove(&family),
            };
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot(cpu: f64, memory: f64) -> Snapshot {
        let family = |v: f64| BTreeMap::from([("usage".to_string(), v)]);
        Snapshot::new(BTreeMap::from([
            ("cpu".to_string(), family(cpu)),
            ("memory".to_string(), family(memory)),
            ("disk".to_string(), family(1.0)),
        ]))
    }

    #[test]
    fn below_thresholds_raises_nothing() {
        let sink = ThresholdSink::new(&ThresholdConfig::default(), "host-a");
        assert!(sink.evaluate(0.0, &snapshot(10.0, 20.0)).is_empty());
    }

    #[test]
    fn grades_warn_and_critical() {
        let sink = ThresholdSink::new(&ThresholdConfig::default(), "host-a");
        let alerts = sink.evaluate(7.0, &snapshot(85.0, 95.0));
        assert_eq!(alerts.len(), 2);

        assert_eq!(alerts[0].family, MetricFamily::Cpu);
        assert_eq!(alerts[0].severity, Severity::Warn);
        assert_eq!(alerts[0].threshold, 80.0);
        assert_eq!(alerts[0].message, "cpu is 85.0% (threshold: 80.0%)");

        assert_eq!(alerts[1].family, MetricFamily::Memory);
        assert_eq!(alerts[1].severity, Severity::Critical);
        assert_eq!(alerts[1].hostname, "host-a");
        assert_eq!(alerts[1].timestamp, 7.0);
    }

    #[test]
    fn tracks_severity_transitions() {
        let mut sink = ThresholdSink::new(&ThresholdConfig::default(), "host-a");
        sink.process(&[1.0], &snapshot(99.0, 10.0)).unwrap();
        assert_eq!(sink.current.get(&MetricFamily::Cpu), Some(&Severity::Critical));

        sink.process(&[1.0, 2.0], &snapshot(81.0, 10.0)).unwrap();
        assert_eq!(sink.current.get(&MetricFamily::Cpu), Some(&Severity::Warn));

        sink.process(&[1.0, 2.0, 3.0], &snapshot(5.0, 10.0)).unwrap();
        assert!(sink.current.is_empty());
    }

    #[test]
    fn log_sink_accepts_any_snapshot() {
        let mut sink = LogSink;
        assert!(sink.process(&[], &Snapshot::default()).is_ok());
    }
}

pub mod agent;
pub mod aggregator;
pub mod config;
pub mod processor;
pub mod sampler;
pub mod scheduler;
pub mod source;

/// Common types used across modules
pub mod types {
    use std::collections::BTreeMap;

    /// Metric family identifier
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum MetricFamily {
        Cpu,
        Memory,
        Disk,
        Network,
    }

    impl MetricFamily {
        pub fn as_str(&self) -> &'static str {
            match self {
                MetricFamily::Cpu => "cpu",
                MetricFamily::Memory => "memory",
                MetricFamily::Disk => "disk",
                MetricFamily::Network => "network",
            }
        }
    }

    impl std::fmt::Display for MetricFamily {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.as_str())
        }
    }

    /// One aggregated reading: metric family -> sub-metric -> value.
    ///
    /// Built whole by the aggregator and never mutated afterwards.
    #[derive(Debug, Clone, PartialEq, Default)]
    pub struct Snapshot {
        families: BTreeMap<String, BTreeMap<String, f64>>,
    }

    impl Snapshot {
        pub fn new(families: BTreeMap<String, BTreeMap<String, f64>>) -> Self {
            Self { families }
        }

        pub fn get(&self, family: MetricFamily, metric: &str) -> Option<f64> {
            self.families.get(family.as_str())?.get(metric).copied()
        }

        pub fn family(&self, family: &str) -> Option<&BTreeMap<String, f64>> {
            self.families.get(family)
        }

        pub fn families(&self) -> impl Iterator<Item = &str> {
            self.families.keys().map(String::as_str)
        }

        pub fn len(&self) -> usize {
            self.families.len()
        }

        pub fn is_empty(&self) -> bool {
            self.families.is_empty()
        }

        /// Flatten into the single-level map served to dashboards:
        /// single-valued families keep their family name, network rates
        /// become `up` and `down`.
        pub fn flatten(&self) -> BTreeMap<String, f64> {
            let mut flat = BTreeMap::new();
            for (family, metrics) in &self.families {
                if metrics.len() == 1 {
                    if let Some(value) = metrics.values().next() {
                        flat.insert(family.clone(), *value);
                    }
                    continue;
                }
                for (metric, value) in metrics {
                    let key = match (family.as_str(), metric.as_str()) {
                        ("network", "upload") => "up".to_string(),
                        ("network", "download") => "down".to_string(),
                        _ => format!("{}.{}", family, metric),
                    };
                    flat.insert(key, *value);
                }
            }
            flat
        }
    }

    /// Alert severity levels
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum Severity {
        Warn,
        Critical,
    }

    impl std::fmt::Display for Severity {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Severity::Warn => write!(f, "WARN"),
                Severity::Critical => write!(f, "CRITICAL"),
            }
        }
    }
}

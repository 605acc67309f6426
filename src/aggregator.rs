use std::collections::BTreeMap;
use std::sync::Arc;

use crate::sampler::network::NetworkSampler;
use crate::sampler::resource::ResourceSampler;
use crate::types::{MetricFamily, Snapshot};

/// Latest values the aggregator reads, one accessor per snapshot field.
///
/// Implemented by the live samplers; tests substitute fixed readings.
pub trait Readings: Send + Sync {
    fn cpu_usage(&self) -> f64;
    fn memory_usage_percentage(&self) -> f64;
    fn disk_usage_mb(&self) -> f64;
    fn data_up(&self) -> f64;
    fn data_down(&self) -> f64;
}

/// Live readings straight from the resource and network samplers
pub struct SamplerReadings {
    pub resource: Arc<ResourceSampler>,
    pub network: Arc<NetworkSampler>,
}

impl Readings for SamplerReadings {
    fn cpu_usage(&self) -> f64 {
        self.resource.cpu_usage()
    }

    fn memory_usage_percentage(&self) -> f64 {
        self.resource.memory_usage_percentage()
    }

    fn disk_usage_mb(&self) -> f64 {
        self.resource.disk_usage_mb()
    }

    fn data_up(&self) -> f64 {
        self.network.data_up()
    }

    fn data_down(&self) -> f64 {
        self.network.data_down()
    }
}

/// Merges the samplers' latest readings into one snapshot
#[derive(Clone)]
pub struct Aggregator {
    readings: Arc<dyn Readings>,
}

impl Aggregator {
    pub fn new(readings: Arc<dyn Readings>) -> Self {
        Self { readings }
    }

    /// Build a fresh snapshot from whatever the samplers last wrote.
    ///
    /// Fields may come from different sampling instants.
    pub fn aggregate(&self) -> Snapshot {
        let r = &self.readings;
        let families = [
            (MetricFamily::Cpu, vec![("usage", r.cpu_usage())]),
            (MetricFamily::Memory, vec![("usage", r.memory_usage_percentage())]),
            (MetricFamily::Disk, vec![("usage", r.disk_usage_mb())]),
            (
                MetricFamily::Network,
                vec![("upload", r.data_up()), ("download", r.data_down())],
            ),
        ];

        Snapshot::new(
            families
                .into_iter()
                .map(|(family, metrics)| {
                    let metrics: BTreeMap<String, f64> = metrics
                        .into_iter()
                        .map(|(name, value)| (name.to_string(), value))
                        .collect();
                    (family.as_str().to_string(), metrics)
                })
                .collect(),
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct Fixed(pub [f64; 5]);

    impl Readings for Fixed {
        fn cpu_usage(&self) -> f64 {
            self.0[0]
        }
        fn memory_usage_percentage(&self) -> f64 {
            self.0[1]
        }
        fn disk_usage_mb(&self) -> f64 {
            self.0[2]
        }
        fn data_up(&self) -> f64 {
            self.0[3]
        }
        fn data_down(&self) -> f64 {
            self.0[4]
        }
    }

    #[test]
    fn snapshot_has_exactly_four_families() {
        let snapshot = Aggregator::new(Arc::new(Fixed([1.0, 2.0, 3.0, 4.0, 5.0]))).aggregate();
        let families: Vec<&str> = snapshot.families().collect();
        assert_eq!(families, vec!["cpu", "disk", "memory", "network"]);

        let network = snapshot.family("network").unwrap();
        let keys: Vec<&str> = network.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["download", "upload"]);
        for family in ["cpu", "memory", "disk"] {
            let keys: Vec<&String> = snapshot.family(family).unwrap().keys().collect();
            assert_eq!(keys, vec!["usage"]);
        }
    }

    #[test]
    fn snapshot_carries_latest_readings() {
        let snapshot = Aggregator::new(Arc::new(Fixed([12.5, 40.0, 2048.0, 500.0, 750.0]))).aggregate();
        assert_eq!(snapshot.get(MetricFamily::Cpu, "usage"), Some(12.5));
        assert_eq!(snapshot.get(MetricFamily::Memory, "usage"), Some(40.0));
        assert_eq!(snapshot.get(MetricFamily::Disk, "usage"), Some(2048.0));
        assert_eq!(snapshot.get(MetricFamily::Network, "upload"), Some(500.0));
        assert_eq!(snapshot.get(MetricFamily::Network, "download"), Some(750.0));
    }

    #[test]
    fn flatten_uses_dashboard_keys() {
        let snapshot = Aggregator::new(Arc::new(Fixed([1.0, 2.0, 3.0, 4.0, 5.0]))).aggregate();
        let flat = snapshot.flatten();
        let keys: Vec<&str> = flat.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["cpu", "disk", "down", "memory", "up"]);
        assert_eq!(flat["up"], 4.0);
        assert_eq!(flat["down"], 5.0);
    }
}

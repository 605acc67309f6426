use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::aggregator::{Aggregator, SamplerReadings};
use crate::config::Config;
use crate::processor::sink::{LogSink, ThresholdSink};
use crate::processor::{DataProcessor, RealtimeProcessor, SnapshotSink};
use crate::sampler::network::NetworkSampler;
use crate::sampler::process::{ProcessReport, ProcessSampler};
use crate::sampler::resource::ResourceSampler;
use crate::scheduler::PollingLoop;
use crate::source::{self, CounterSource, Platform, SourceOptions};
use crate::types::Snapshot;

/// Owns every sampler, loop and the realtime processor.
///
/// Samplers are built once and shared by reference, so each OS probe and
/// each background loop exists exactly once.
pub struct Agent {
    resource: Arc<ResourceSampler>,
    network: Arc<NetworkSampler>,
    process: Arc<ProcessSampler>,
    aggregator: Aggregator,
    loops: Vec<PollingLoop>,
    realtime: RealtimeProcessor,
}

impl Agent {
    /// Build the agent with the counter source for this platform
    pub fn new(config: &Config) -> Self {
        let source = source::detect(SourceOptions::from_config(&config.collector));
        let sinks: Vec<Box<dyn SnapshotSink>> = vec![
            Box::new(LogSink),
            Box::new(ThresholdSink::new(&config.thresholds, config.agent.hostname.clone())),
        ];
        Self::with_source(config, source, sinks)
    }

    /// Build the agent around an explicit counter source and sink set
    pub fn with_source(
        config: &Config,
        source: Arc<dyn CounterSource>,
        sinks: Vec<Box<dyn SnapshotSink>>,
    ) -> Self {
        let collectors = &config.collector;
        let grace = config.agent.shutdown_grace();

        let resource = Arc::new(ResourceSampler::new(
            Platform::current(),
            collectors.resource.disk_timeout(),
        ));
        let network = Arc::new(NetworkSampler::new(source.clone()));
        let process = Arc::new(ProcessSampler::new(source, collectors.process.top_n));

        let loops = vec![
            PollingLoop::new(
                resource.clone(),
                Duration::from_millis(collectors.resource.interval_ms),
                grace,
            ),
            PollingLoop::new(
                network.clone(),
                Duration::from_millis(collectors.network.interval_ms),
                grace,
            ),
            PollingLoop::new(
                process.clone(),
                Duration::from_millis(collectors.process.interval_ms),
                grace,
            ),
        ];

        let aggregator = Aggregator::new(Arc::new(SamplerReadings {
            resource: resource.clone(),
            network: network.clone(),
        }));
        let realtime = RealtimeProcessor::new(
            aggregator.clone(),
            DataProcessor::new(sinks),
            Duration::from_millis(collectors.realtime.interval_ms),
            grace,
        );

        Self {
            resource,
            network,
            process,
            aggregator,
            loops,
            realtime,
        }
    }

    /// Start every collector and the realtime processor. Idempotent.
    pub fn start_all(&self) {
        for polling in &self.loops {
            polling.start();
        }
        self.realtime.start();
    }

    /// Stop the realtime processor and every collector. Idempotent.
    pub async fn stop_all(&self) {
        self.realtime.stop().await;
        for polling in &self.loops {
            polling.stop().await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.realtime.is_running() || self.loops.iter().any(PollingLoop::is_running)
    }

    /// Latest snapshot assembled from current sampler state
    pub fn snapshot(&self) -> Snapshot {
        self.aggregator.aggregate()
    }

    /// Flat metric map served to dashboards: `cpu`, `memory`, `disk`, `up`, `down`
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        self.snapshot().flatten()
    }

    pub fn processes(&self) -> ProcessReport {
        self.process.report()
    }

    pub fn resource(&self) -> &ResourceSampler {
        &self.resource
    }

    pub fn network(&self) -> &NetworkSampler {
        &self.network
    }

    pub fn realtime(&self) -> &RealtimeProcessor {
        &self.realtime
    }

    pub fn loops(&self) -> &[PollingLoop] {
        &self.loops
    }
}

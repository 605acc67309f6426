pub mod sink;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::aggregator::Aggregator;
use crate::sampler::Sampler;
use crate::scheduler::{PollingLoop, StopOutcome};
use crate::types::Snapshot;

/// Trait for downstream consumers of aggregated snapshots.
///
/// Sinks run inline on the realtime loop and must return promptly.
pub trait SnapshotSink: Send + Sync {
    /// Human-readable name for this sink
    fn name(&self) -> &str;

    /// Handle one snapshot together with every cycle timestamp so far
    fn process(&mut self, timestamps: &[f64], snapshot: &Snapshot) -> Result<()>;
}

/// Stamps each snapshot and fans it out to the sinks
pub struct DataProcessor {
    timestamps: Vec<f64>,
    latest: Option<Snapshot>,
    sinks: Vec<Box<dyn SnapshotSink>>,
}

impl DataProcessor {
    pub fn new(sinks: Vec<Box<dyn SnapshotSink>>) -> Self {
        tracing::info!(sinks = sinks.len(), "Initialized snapshot sinks");
        Self {
            timestamps: Vec::new(),
            latest: None,
            sinks,
        }
    }

    /// Record the current wall-clock time and hand the snapshot downstream.
    ///
    /// A failing sink is logged and does not stop the others.
    pub fn process(&mut self, snapshot: Snapshot) {
        let now = Utc::now();
        let timestamp = now.timestamp_micros() as f64 / 1_000_000.0;
        self.timestamps.push(timestamp);

        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.process(&self.timestamps, &snapshot) {
                tracing::warn!(sink = sink.name(), error = %e, "Snapshot sink failed");
            }
        }

        self.latest = Some(snapshot);
    }

    /// Every processing timestamp so far, in seconds since the epoch
    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.timestamps.last().copied()
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }
}

/// One aggregate-then-process step, driven by the realtime loop
struct ProcessingCycle {
    aggregator: Aggregator,
    processor: Mutex<DataProcessor>,
}

#[async_trait]
impl Sampler for ProcessingCycle {
    fn name(&self) -> &str {
        "realtime"
    }

    async fn update(&self) -> Result<()> {
        let snapshot = self.aggregator.aggregate();
        self.processor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .process(snapshot);
        Ok(())
    }
}

/// Continuously aggregates snapshots and forwards them to the sinks.
///
/// Stopped until [`start`](Self::start); stopping uses the same
/// cancel-then-join discipline as the collectors.
pub struct RealtimeProcessor {
    cycle: Arc<ProcessingCycle>,
    polling: PollingLoop,
}

impl RealtimeProcessor {
    pub fn new(
        aggregator: Aggregator,
        processor: DataProcessor,
        interval: Duration,
        grace: Duration,
    ) -> Self {
        let cycle = Arc::new(ProcessingCycle {
            aggregator,
            processor: Mutex::new(processor),
        });
        let polling = PollingLoop::new(cycle.clone(), interval, grace);
        Self { cycle, polling }
    }

    pub fn start(&self) {
        self.polling.start();
    }

    pub async fn stop(&self) -> StopOutcome {
        self.polling.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.polling.is_running()
    }

    /// Copy of the timestamp history
    pub fn timestamps(&self) -> Vec<f64> {
        self.with_processor(|p| p.timestamps().to_vec())
    }

    pub fn cycles(&self) -> usize {
        self.with_processor(|p| p.timestamps().len())
    }

    /// Most recently processed snapshot
    pub fn latest(&self) -> Option<Snapshot> {
        self.with_processor(|p| p.latest().cloned())
    }

    fn with_processor<T>(&self, f: impl FnOnce(&DataProcessor) -> T) -> T {
        let processor = self
            .cycle
            .processor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&processor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::tests::Fixed;
    use crate::types::MetricFamily;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Recording {
        seen: Arc<Mutex<Vec<(usize, f64)>>>,
    }

    impl SnapshotSink for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn process(&mut self, timestamps: &[f64], snapshot: &Snapshot) -> Result<()> {
            let cpu = snapshot.get(MetricFamily::Cpu, "usage").unwrap_or(f64::NAN);
            self.seen.lock().unwrap().push((timestamps.len(), cpu));
            Ok(())
        }
    }

    struct Failing(Arc<AtomicUsize>);

    impl SnapshotSink for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn process(&mut self, _timestamps: &[f64], _snapshot: &Snapshot) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            bail!("report store unavailable")
        }
    }

    fn aggregator() -> Aggregator {
        Aggregator::new(Arc::new(Fixed([42.0, 10.0, 100.0, 1.0, 2.0])))
    }

    #[test]
    fn history_grows_by_one_per_cycle() {
        let recording = Recording::default();
        let mut processor = DataProcessor::new(vec![Box::new(recording.clone())]);
        for _ in 0..3 {
            processor.process(aggregator().aggregate());
        }

        assert_eq!(processor.timestamps().len(), 3);
        assert!(processor.timestamps().windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*recording.seen.lock().unwrap(), vec![(1, 42.0), (2, 42.0), (3, 42.0)]);
        assert_eq!(processor.latest().unwrap().get(MetricFamily::Network, "download"), Some(2.0));
    }

    #[test]
    fn failing_sink_does_not_starve_the_others() {
        let calls = Arc::new(AtomicUsize::new(0));
        let recording = Recording::default();
        let mut processor = DataProcessor::new(vec![
            Box::new(Failing(calls.clone())),
            Box::new(recording.clone()),
        ]);
        processor.process(aggregator().aggregate());
        processor.process(aggregator().aggregate());

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(recording.seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn timestamps_are_wall_clock_seconds() {
        let mut processor = DataProcessor::new(vec![]);
        processor.process(aggregator().aggregate());
        let now = Utc::now().timestamp() as f64;
        let stamped = processor.last_timestamp().unwrap();
        assert!((now - stamped).abs() < 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn realtime_processor_runs_until_stopped() {
        let recording = Recording::default();
        let realtime = RealtimeProcessor::new(
            aggregator(),
            DataProcessor::new(vec![Box::new(recording.clone())]),
            Duration::from_millis(100),
            Duration::from_secs(1),
        );
        assert!(!realtime.is_running());
        assert_eq!(realtime.cycles(), 0);

        realtime.start();
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(realtime.is_running());
        assert_eq!(realtime.stop().await, StopOutcome::Stopped);

        let cycles = realtime.cycles();
        assert!((4..=6).contains(&cycles), "unexpected cycle count {}", cycles);
        assert_eq!(recording.seen.lock().unwrap().len(), cycles);
        assert_eq!(realtime.timestamps().len(), cycles);
        assert_eq!(realtime.latest().unwrap().get(MetricFamily::Cpu, "usage"), Some(42.0));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(realtime.cycles(), cycles);
    }

    #[tokio::test(start_paused = true)]
    async fn tight_loop_still_stops_promptly() {
        let realtime = RealtimeProcessor::new(
            aggregator(),
            DataProcessor::new(vec![]),
            Duration::ZERO,
            Duration::from_secs(1),
        );
        realtime.start();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(realtime.stop().await, StopOutcome::Stopped);
        assert!(realtime.cycles() > 1);
    }
}

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::source::{CounterSource, NetworkCounters};
use super::{Gauge, Sampler};

/// Converts cumulative interface byte counters into per-interval rates
pub struct NetworkSampler {
    source: Arc<dyn CounterSource>,
    prev_up: AtomicU64,
    prev_down: AtomicU64,
    up: Gauge,
    down: Gauge,
}

impl NetworkSampler {
    pub fn new(source: Arc<dyn CounterSource>) -> Self {
        Self {
            source,
            prev_up: AtomicU64::new(0),
            prev_down: AtomicU64::new(0),
            up: Gauge::default(),
            down: Gauge::default(),
        }
    }

    /// Bytes transmitted during the last sampling interval
    pub fn data_up(&self) -> f64 {
        self.up.get()
    }

    /// Bytes received during the last sampling interval
    pub fn data_down(&self) -> f64 {
        self.down.get()
    }

    /// Raw counters retained as the baseline for the next rate
    pub fn baseline(&self) -> NetworkCounters {
        NetworkCounters {
            tx_bytes: self.prev_up.load(Ordering::Acquire),
            rx_bytes: self.prev_down.load(Ordering::Acquire),
        }
    }

    fn apply(&self, current: NetworkCounters) {
        let prev_up = self.prev_up.load(Ordering::Acquire);
        let prev_down = self.prev_down.load(Ordering::Acquire);

        // No rate until both baselines exist
        if prev_up > 0 && prev_down > 0 {
            self.up.set(delta(prev_up, current.tx_bytes));
            self.down.set(delta(prev_down, current.rx_bytes));
        }

        self.prev_up.store(current.tx_bytes, Ordering::Release);
        self.prev_down.store(current.rx_bytes, Ordering::Release);
    }
}

/// A counter that went backwards was reset; the new value becomes the baseline
fn delta(previous: u64, current: u64) -> f64 {
    if current < previous {
        debug!(previous, current, "Counter went backwards, rebasing");
        0.0
    } else {
        (current - previous) as f64
    }
}

#[async_trait]
impl Sampler for NetworkSampler {
    fn name(&self) -> &str {
        "network"
    }

    async fn update(&self) -> Result<()> {
        match self.source.read_network_counters().await {
            Ok(current) => {
                self.apply(current);
                Ok(())
            }
            // The polling loop logs the error
            Err(e) => {
                self.up.set(0.0);
                self.down.set(0.0);
                Err(e)
            }
        }
    }
}

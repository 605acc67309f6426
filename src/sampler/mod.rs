pub mod disk;
pub mod network;
pub mod process;
pub mod resource;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// Trait for all samplers driven by a polling loop.
///
/// `update` is only ever invoked by the single loop that owns the sampler.
/// Readers on other tasks go through the sampler's accessors, which return
/// the latest fully written value of each field.
#[async_trait]
pub trait Sampler: Send + Sync {
    /// Human-readable name for this sampler (e.g., "network")
    fn name(&self) -> &str;

    /// Refresh the sampler's state. On error the sampler has already left
    /// its readings stale or zeroed; the caller only needs to log.
    async fn update(&self) -> Result<()>;
}

/// An `f64` that can be written by one task and read by others without tearing
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

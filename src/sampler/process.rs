use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};

use crate::source::CounterSource;
use super::Sampler;

/// Answer to the process query interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub processes: Vec<String>,
    pub count: usize,
    pub monitoring: bool,
}

/// Accumulates the names of processes seen among the busiest at each sample.
///
/// Names are deduplicated in first-seen order and never evicted, so the set
/// grows with the number of distinct busy programs observed since start.
pub struct ProcessSampler {
    source: Arc<dyn CounterSource>,
    top_n: usize,
    names: RwLock<Vec<String>>,
}

impl ProcessSampler {
    pub fn new(source: Arc<dyn CounterSource>, top_n: usize) -> Self {
        Self {
            source,
            top_n,
            names: RwLock::new(Vec::new()),
        }
    }

    /// Copy of the accumulated process names
    pub fn top_process_names(&self) -> Vec<String> {
        self.names.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn process_count(&self) -> usize {
        self.names.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True once at least one process has been observed
    pub fn is_monitoring(&self) -> bool {
        self.process_count() > 0
    }

    pub fn report(&self) -> ProcessReport {
        let processes = self.top_process_names();
        ProcessReport {
            count: processes.len(),
            monitoring: !processes.is_empty(),
            processes,
        }
    }

    fn record(&self, observed: Vec<String>) {
        let mut names = self.names.write().unwrap_or_else(PoisonError::into_inner);
        for name in observed {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
}

#[async_trait]
impl Sampler for ProcessSampler {
    fn name(&self) -> &str {
        "process"
    }

    async fn update(&self) -> Result<()> {
        let observed = self.source.list_top_processes(self.top_n).await?;
        tracing::trace!(count = observed.len(), "Observed top processes");
        self.record(observed);
        Ok(())
    }
}

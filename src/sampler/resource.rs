use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use sysinfo::{
    CpuRefreshKind, MemoryRefreshKind, Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind,
    System,
};

use crate::source::Platform;
use super::disk::DiskProbe;
use super::{Gauge, Sampler};

const MB: f64 = 1024.0 * 1024.0;

/// Samples CPU, memory and disk figures for this host
pub struct ResourceSampler {
    sys: Arc<Mutex<System>>,
    pid: Option<Pid>,
    disk: DiskProbe,
    cpu: Gauge,
    memory_percent: Gauge,
    memory_used_mb: Gauge,
    disk_used_mb: Gauge,
}

impl ResourceSampler {
    pub fn new(platform: Platform, disk_timeout: Duration) -> Self {
        // Preload cpu and memory so the first CPU delta has a baseline
        let mut sys = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_cpu_usage();

        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(error = e, "Cannot resolve own pid, using load average for CPU");
                None
            }
        };

        Self {
            sys: Arc::new(Mutex::new(sys)),
            pid,
            disk: DiskProbe::new(platform, disk_timeout),
            cpu: Gauge::default(),
            memory_percent: Gauge::default(),
            memory_used_mb: Gauge::default(),
            disk_used_mb: Gauge::default(),
        }
    }

    /// CPU utilisation in percent of total machine capacity
    pub fn cpu_usage(&self) -> f64 {
        self.cpu.get()
    }

    /// Used memory as a percentage of the effective limit
    pub fn memory_usage_percentage(&self) -> f64 {
        self.memory_percent.get()
    }

    /// Resident memory of the agent process
    pub fn memory_usage_mb(&self) -> f64 {
        self.memory_used_mb.get()
    }

    /// Space in use across counted filesystems
    pub fn disk_usage_mb(&self) -> f64 {
        self.disk_used_mb.get()
    }
}

/// CPU and memory figures from one sysinfo refresh
struct SystemReading {
    cpu: f64,
    memory_percent: f64,
    memory_used_mb: Option<f64>,
}

/// Refresh sysinfo and derive the figures. Blocking; runs off the async workers.
fn read_system(sys: &Mutex<System>, pid: Option<Pid>) -> SystemReading {
    let mut sys = sys.lock().unwrap_or_else(PoisonError::into_inner);
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    if let Some(pid) = pid {
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );
    }
    let process = match pid {
        Some(pid) => sys.process(pid),
        None => None,
    };

    let cpus = sys.cpus().len();
    let process_load = process.map(|p| f64::from(p.cpu_usage()) / cpus.max(1) as f64);
    let limits = sys.cgroup_limits().map(|l| (l.total_memory, l.free_memory));

    SystemReading {
        cpu: cpu_percent(process_load, System::load_average().one, cpus),
        memory_percent: memory_percent(limits, sys.total_memory(), sys.used_memory()),
        memory_used_mb: process.map(|p| p.memory() as f64 / MB),
    }
}

/// Process load as a percentage, falling back to load average per CPU
fn cpu_percent(process_load: Option<f64>, load_average: f64, cpus: usize) -> f64 {
    match process_load {
        Some(load) if load.is_finite() && load >= 0.0 => load.min(100.0),
        _ if load_average >= 0.0 && cpus > 0 => {
            (load_average / cpus as f64 * 100.0).clamp(0.0, 100.0)
        }
        _ => 0.0,
    }
}

/// Percentage of a bounded memory limit, else of physical memory
fn memory_percent(limit: Option<(u64, u64)>, total: u64, used: u64) -> f64 {
    match limit {
        Some((max, free)) if max > 0 && max != u64::MAX => {
            max.saturating_sub(free) as f64 * 100.0 / max as f64
        }
        _ if total > 0 => used as f64 * 100.0 / total as f64,
        _ => 0.0,
    }
}

#[async_trait]
impl Sampler for ResourceSampler {
    fn name(&self) -> &str {
        "resource"
    }

    async fn update(&self) -> Result<()> {
        let sys = self.sys.clone();
        let pid = self.pid;
        let reading = tokio::task::spawn_blocking(move || read_system(&sys, pid))
            .await
            .context("System refresh task failed")?;

        self.cpu.set(reading.cpu);
        self.memory_percent.set(reading.memory_percent);
        if let Some(used) = reading.memory_used_mb {
            self.memory_used_mb.set(used);
        }

        // A failed disk scan keeps the previous figure
        let used = self.disk.used_mb().await.context("Failed to update disk usage")?;
        self.disk_used_mb.set(used);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_prefers_process_load() {
        assert_eq!(cpu_percent(Some(12.5), 3.0, 4), 12.5);
        assert_eq!(cpu_percent(Some(250.0), 3.0, 4), 100.0);
    }

    #[test]
    fn cpu_falls_back_to_load_average() {
        assert_eq!(cpu_percent(None, 2.0, 4), 50.0);
        assert_eq!(cpu_percent(Some(-1.0), 1.0, 4), 25.0);
        assert_eq!(cpu_percent(Some(f64::NAN), 1.0, 2), 50.0);
        assert_eq!(cpu_percent(None, 16.0, 4), 100.0);
    }

    #[test]
    fn cpu_is_zero_without_any_source() {
        assert_eq!(cpu_percent(None, -1.0, 4), 0.0);
        assert_eq!(cpu_percent(None, 1.0, 0), 0.0);
    }

    #[test]
    fn memory_uses_bounded_limit_first() {
        assert_eq!(memory_percent(Some((1000, 250)), 8000, 100), 75.0);
    }

    #[test]
    fn memory_falls_back_to_physical_memory() {
        assert_eq!(memory_percent(None, 8000, 2000), 25.0);
        assert_eq!(memory_percent(Some((u64::MAX, 0)), 4000, 1000), 25.0);
        assert_eq!(memory_percent(Some((0, 0)), 4000, 3000), 75.0);
        assert_eq!(memory_percent(None, 0, 0), 0.0);
    }

    #[tokio::test]
    async fn update_produces_sane_readings() {
        let sampler = ResourceSampler::new(Platform::current(), Duration::from_secs(5));
        sampler.update().await.unwrap();

        let cpu = sampler.cpu_usage();
        assert!((0.0..=100.0).contains(&cpu), "cpu out of range: {}", cpu);
        let memory = sampler.memory_usage_percentage();
        assert!(memory.is_finite() && memory >= 0.0);
        assert!(sampler.disk_usage_mb().is_finite());
        assert!(sampler.memory_usage_mb() > 0.0, "own resident memory not sampled");
    }
}

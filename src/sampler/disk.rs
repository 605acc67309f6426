use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use sysinfo::Disks;
use tracing::debug;

use crate::source::Platform;

/// One mounted filesystem as seen at sample time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub fs_type: String,
    pub mount_point: String,
    pub total_bytes: u64,
    pub usable_bytes: u64,
    pub read_only: bool,
}

/// Virtual, pseudo and removable filesystems that never count towards disk usage
pub fn is_excluded(platform: Platform, fs_type: &str, mount_point: &str) -> bool {
    let fs_type = fs_type.to_lowercase();
    let mount = mount_point.to_lowercase();

    match platform {
        Platform::Linux => {
            const TYPES: [&str; 10] = [
                "tmpfs", "devtmpfs", "proc", "sys", "cgroup", "devpts", "securityfs",
                "squashfs", "overlay", "fuse",
            ];
            const PREFIXES: [&str; 4] = ["/dev", "/proc", "/sys", "/run"];
            TYPES.iter().any(|t| fs_type.contains(t))
                || PREFIXES.iter().any(|p| mount.starts_with(p))
                || mount.contains("snap")
        }
        Platform::MacOs => {
            ["devfs", "map", "autofs", "nullfs"].iter().any(|t| fs_type.contains(t))
                || mount.starts_with("/dev")
                || mount.contains("/volumes/com.apple")
                || mount.contains(".vol")
        }
        Platform::Windows => {
            let drive = mount.trim_end_matches(['\\', '/']);
            fs_type.contains("cdfs")
                || fs_type.contains("udf")
                || drive == "a:"
                || drive == "b:"
        }
        Platform::Other => false,
    }
}

/// Bytes in use across every writable, non-excluded mount
pub fn used_bytes(platform: Platform, mounts: &[MountInfo]) -> u64 {
    mounts
        .iter()
        .filter(|m| !m.read_only && !is_excluded(platform, &m.fs_type, &m.mount_point))
        .filter(|m| m.total_bytes > 0)
        .map(|m| m.total_bytes.saturating_sub(m.usable_bytes))
        .fold(0u64, u64::saturating_add)
}

/// Enumerates mounted filesystems for disk accounting.
///
/// `statvfs` on a dead network mount can block forever, so every scan runs on
/// the blocking pool under a timeout and at most one scan is in flight.
#[derive(Clone)]
pub struct DiskProbe {
    platform: Platform,
    proc_mounts: PathBuf,
    timeout: Duration,
    disks: Arc<Mutex<Disks>>,
    scanning: Arc<AtomicBool>,
}

impl DiskProbe {
    pub fn new(platform: Platform, timeout: Duration) -> Self {
        Self {
            platform,
            proc_mounts: PathBuf::from("/proc/mounts"),
            timeout,
            disks: Arc::new(Mutex::new(Disks::new())),
            scanning: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Total used megabytes across counted mounts
    pub async fn used_mb(&self) -> Result<f64> {
        let probe = self.clone();
        let mounts = self.scan_bounded(move || probe.mounts()).await?;
        Ok(used_bytes(self.platform, &mounts) as f64 / (1024.0 * 1024.0))
    }

    /// Run `scan` on the blocking pool, giving up after the probe timeout.
    ///
    /// A scan that overruns keeps its thread until it returns; later calls
    /// fail fast instead of stacking more threads on the same mount.
    async fn scan_bounded<F>(&self, scan: F) -> Result<Vec<MountInfo>>
    where
        F: FnOnce() -> Result<Vec<MountInfo>> + Send + 'static,
    {
        let Some(guard) = ScanGuard::acquire(&self.scanning) else {
            bail!("Previous disk scan is still running");
        };

        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            scan()
        });

        tokio::time::timeout(self.timeout, task)
            .await
            .with_context(|| format!("Disk scan timed out after {:?}", self.timeout))?
            .context("Disk scan task failed")?
    }

    fn mounts(&self) -> Result<Vec<MountInfo>> {
        if self.platform == Platform::Linux {
            match self.proc_mounts() {
                Ok(mounts) => return Ok(mounts),
                Err(e) => debug!(error = %e, "procfs mounts unavailable, falling back to sysinfo"),
            }
        }
        Ok(self.sysinfo_mounts())
    }

    fn proc_mounts(&self) -> Result<Vec<MountInfo>> {
        let content = std::fs::read_to_string(&self.proc_mounts)
            .with_context(|| format!("Failed to read {}", self.proc_mounts.display()))?;

        let mounts = parse_proc_mounts(&content)
            .into_iter()
            // Skip pseudo filesystems before touching them with statvfs
            .filter(|m| !m.read_only && !is_excluded(self.platform, &m.fs_type, &m.mount_point))
            .filter_map(|mut m| {
                let (total, usable, read_only) = space(&m.mount_point)?;
                m.total_bytes = total;
                m.usable_bytes = usable;
                m.read_only |= read_only;
                Some(m)
            })
            .collect();

        Ok(mounts)
    }

    fn sysinfo_mounts(&self) -> Vec<MountInfo> {
        let mut disks = self.disks.lock().unwrap_or_else(PoisonError::into_inner);
        disks.refresh_list();

        disks
            .list()
            .iter()
            .map(|disk| {
                let mount_point = disk.mount_point().to_string_lossy().into_owned();
                let read_only = space(&mount_point).map(|(_, _, ro)| ro).unwrap_or(false);
                MountInfo {
                    fs_type: disk.file_system().to_string_lossy().into_owned(),
                    total_bytes: disk.total_space(),
                    usable_bytes: disk.available_space(),
                    read_only,
                    mount_point,
                }
            })
            .collect()
    }
}

/// Marks a scan in flight; cleared when the scan finishes or is dropped unrun
struct ScanGuard(Arc<AtomicBool>);

impl ScanGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self(flag.clone()))
        }
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Parse /proc/mounts rows into mounts with unknown sizes
fn parse_proc_mounts(content: &str) -> Vec<MountInfo> {
    content
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 4 {
                return None;
            }
            let read_only = parts[3].split(',').any(|opt| opt == "ro");
            Some(MountInfo {
                fs_type: parts[2].to_string(),
                mount_point: unescape_mount_path(parts[1]),
                total_bytes: 0,
                usable_bytes: 0,
                read_only,
            })
        })
        .collect()
}

/// The kernel writes spaces, tabs and backslashes in paths as octal escapes
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// (total, usable, read-only) for the filesystem holding `path`
#[cfg(unix)]
fn space(path: &str) -> Option<(u64, u64, bool)> {
    use nix::sys::statvfs::{statvfs, FsFlags};

    let stat = statvfs(path).ok()?;
    let fragment = stat.fragment_size() as u64;
    let total = (stat.blocks() as u64).saturating_mul(fragment);
    let usable = (stat.blocks_available() as u64).saturating_mul(fragment);
    Some((total, usable, stat.flags().contains(FsFlags::ST_RDONLY)))
}

#[cfg(not(unix))]
fn space(_path: &str) -> Option<(u64, u64, bool)> {
    None
}

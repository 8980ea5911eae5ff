use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::GateConfig;
use crate::core::download::DownloadManager;
use crate::error::DisabledReason;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateStatus {
    Enabled,
    Disabled(DisabledReason),
}

/// The storage and configuration preconditions for a new transfer.
#[derive(Debug, Clone)]
pub struct GatePolicy {
    storage_dir: PathBuf,
    min_free_bytes: u64,
    enabled: bool,
}

impl GatePolicy {
    pub fn new(storage_dir: &Path, config: &GateConfig) -> Self {
        Self {
            storage_dir: storage_dir.to_path_buf(),
            min_free_bytes: config.min_free_bytes,
            enabled: config.enabled,
        }
    }

    /// Free space first, then the feature flag.
    pub fn check(&self) -> Result<(), DisabledReason> {
        let available = free_space(&self.storage_dir)
            .map_err(|e| DisabledReason::StorageUnavailable(format!("{}: {e}", self.storage_dir.display())))?;
        if available < self.min_free_bytes {
            return Err(DisabledReason::InsufficientSpace { available, required: self.min_free_bytes });
        }
        if !self.enabled {
            return Err(DisabledReason::FeatureDisabled);
        }
        Ok(())
    }
}

/// Read-only answer to "would a download start right now?".
#[derive(Clone)]
pub struct Gate {
    downloads: DownloadManager,
    policy: GatePolicy,
}

impl Gate {
    pub fn new(downloads: DownloadManager, policy: GatePolicy) -> Self {
        Self { downloads, policy }
    }

    pub async fn evaluate(&self) -> GateStatus {
        let status = if let Some(reason) = self.downloads.busy().await {
            GateStatus::Disabled(reason)
        } else {
            match self.policy.check() {
                Ok(()) => GateStatus::Enabled,
                Err(reason) => GateStatus::Disabled(reason),
            }
        };
        debug!(?status, "gate evaluated");
        status
    }
}

#[cfg(unix)]
pub fn free_space(path: &Path) -> std::io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())?;
    // SAFETY: `c_path` is a valid NUL-terminated string and `stat` is a
    // properly sized out-parameter owned by this frame.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
}

#[cfg(not(unix))]
pub fn free_space(_path: &Path) -> std::io::Result<u64> {
    Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "statvfs unavailable"))
}

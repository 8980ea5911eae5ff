use anyhow::Context;
use futures::StreamExt;
use sanitize_filename::sanitize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::Config;
use crate::core::catalog::ImageStore;
use crate::core::gate::GatePolicy;
use crate::core::model::{DownloadJob, DownloadRequest, JobId, JobState};
use crate::core::staging::{self, StagingFile};
use crate::error::{DisabledReason, Result, TransferError, VmediaError};
use crate::plugins::registry::{file_name_from_url, DriverContext, PluginRegistry, TransferDriver};

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub staging_dir: PathBuf,
    pub driver_ctx: DriverContext,
    pub stall_timeout: Duration,
    pub max_duration: Option<Duration>,
}

impl DownloadSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            staging_dir: config.storage.staging_dir.clone(),
            driver_ctx: config.download.driver_context(),
            stall_timeout: Duration::from_secs(config.download.stall_timeout_secs.max(1)),
            max_duration: config.download.max_duration_secs.map(Duration::from_secs),
        }
    }
}

/// Owns the single download slot. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<PluginRegistry>,
    store: ImageStore,
    policy: GatePolicy,
    settings: DownloadSettings,
    slot: RwLock<Slot>,
    // Number of transfer tasks that have not yet exited.
    active_tasks: watch::Sender<usize>,
}

struct Slot {
    job: DownloadJob,
    cancel: Option<CancellationToken>,
}

struct Transfer {
    id: JobId,
    source: Url,
    file_name: String,
    staging_path: PathBuf,
    expected: Option<String>,
    driver: Arc<dyn TransferDriver>,
    token: CancellationToken,
}

impl DownloadManager {
    /// Discards anything an interrupted run left in the staging area.
    pub async fn new(
        registry: PluginRegistry,
        store: ImageStore,
        policy: GatePolicy,
        settings: DownloadSettings,
    ) -> anyhow::Result<Self> {
        let removed = staging::clean_staging_dir(&settings.staging_dir).await?;
        if removed > 0 {
            info!("discarded {} stale staging file(s) in {}", removed, settings.staging_dir.display());
        }

        let (active_tasks, _) = watch::channel(0usize);
        Ok(Self {
            inner: Arc::new(Inner {
                registry: Arc::new(registry),
                store,
                policy,
                settings,
                slot: RwLock::new(Slot { job: DownloadJob::idle(), cancel: None }),
                active_tasks,
            }),
        })
    }

    pub async fn status(&self) -> DownloadJob {
        self.inner.slot.read().await.job.clone()
    }

    /// Why a new transfer cannot start yet: one is running, or a canceled
    /// one has not exited.
    pub async fn busy(&self) -> Option<DisabledReason> {
        let slot = self.inner.slot.read().await;
        self.busy_locked(&slot)
    }

    fn busy_locked(&self, slot: &Slot) -> Option<DisabledReason> {
        if slot.job.is_running() {
            Some(DisabledReason::TransferRunning)
        } else if *self.inner.active_tasks.borrow() > 0 {
            Some(DisabledReason::TransferStopping)
        } else {
            None
        }
    }

    pub async fn start(&self, req: DownloadRequest) -> Result<JobId> {
        let source = Url::parse(req.source.trim())
            .map_err(|e| VmediaError::InvalidRequest(format!("bad source {:?}: {e}", req.source)))?;
        let driver = self
            .inner
            .registry
            .driver_for(&source)
            .ok_or_else(|| VmediaError::InvalidRequest(format!("unsupported scheme: {}", source.scheme())))?;
        let expected = match req.checksum.as_deref().map(str::trim) {
            Some(c) if !c.is_empty() => Some(normalize_checksum(c)?),
            _ => None,
        };
        let file_name = match req.filename.as_deref().map(str::trim) {
            Some(f) if !f.is_empty() => sanitize(f),
            _ => file_name_from_url(&source).unwrap_or_default(),
        };
        if !self.inner.store.accepts(&file_name) {
            return Err(VmediaError::InvalidRequest(format!("not an image file name: {:?}", file_name)));
        }

        let mut slot = self.inner.slot.write().await;
        match self.busy_locked(&slot) {
            Some(DisabledReason::TransferRunning) => return Err(VmediaError::DownloadRunning),
            Some(_) => return Err(VmediaError::TransferStopping),
            None => {}
        }
        self.inner.policy.check().map_err(VmediaError::Disabled)?;
        if self.inner.store.is_taken(&file_name).await {
            return Err(VmediaError::ImageExists(file_name));
        }

        let id = Uuid::new_v4();
        let staging_path = self.inner.settings.staging_dir.join(format!("{id}.part"));
        let token = CancellationToken::new();
        slot.job = DownloadJob::running(id, source.to_string(), file_name.clone(), staging_path.clone());
        slot.cancel = Some(token.clone());
        self.inner.active_tasks.send_modify(|n| *n += 1);
        drop(slot);

        info!(%id, %source, file = %file_name, driver = driver.name(), "download started");

        let transfer = Transfer { id, source, file_name, staging_path, expected, driver, token };
        let manager = self.clone();
        tokio::spawn(async move { manager.run_job(transfer).await });

        Ok(id)
    }

    /// Marks the running job canceled; the task notices at its next I/O step.
    pub async fn cancel(&self) -> Result<()> {
        let mut slot = self.inner.slot.write().await;
        if !slot.job.is_running() {
            return Err(VmediaError::NoActiveJob);
        }
        if let Some(token) = slot.cancel.take() {
            token.cancel();
        }
        slot.job.state = JobState::Canceled;
        info!(id = ?slot.job.id, "download canceled");
        Ok(())
    }

    /// Waits until no transfer task is alive and returns the final snapshot.
    pub async fn wait(&self) -> DownloadJob {
        let mut rx = self.inner.active_tasks.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
        self.status().await
    }

    async fn run_job(&self, t: Transfer) {
        let outcome = match self.inner.settings.max_duration {
            Some(limit) => match tokio::time::timeout(limit, self.stream_to_staging(&t)).await {
                Ok(r) => r,
                Err(_) => Err(TransferError::TimedOut(limit).into()),
            },
            None => self.stream_to_staging(&t).await,
        };

        let (path, size, digest) = match outcome {
            Ok(staged) => staged,
            Err(e) => {
                staging::discard(&t.staging_path).await;
                if t.token.is_cancelled() {
                    debug!(id = %t.id, "transfer stopped after cancel");
                    let _slot = self.inner.slot.write().await;
                    self.release_task();
                } else {
                    self.fail(t.id, format!("{:#}", e)).await;
                }
                return;
            }
        };

        if let Some(expected) = &t.expected {
            if *expected != digest {
                staging::discard(&path).await;
                let err = TransferError::ChecksumMismatch { expected: expected.clone(), actual: digest };
                self.fail(t.id, err.to_string()).await;
                return;
            }
        }

        self.promote(&t, &path, size, digest).await;
    }

    async fn stream_to_staging(&self, t: &Transfer) -> anyhow::Result<(PathBuf, u64, String)> {
        let ctx = &self.inner.settings.driver_ctx;
        let opened = tokio::select! {
            _ = t.token.cancelled() => return Err(TransferError::Canceled.into()),
            r = t.driver.open(&t.source, ctx) => r.with_context(|| format!("open {}", t.source))?,
        };
        self.update(t.id, |job| job.bytes_total = opened.total).await;

        let mut staged = StagingFile::create(&t.staging_path).await?;
        let mut body = opened.body;
        let stall = self.inner.settings.stall_timeout;

        loop {
            let next = tokio::select! {
                _ = t.token.cancelled() => return Err(TransferError::Canceled.into()),
                r = tokio::time::timeout(stall, body.next()) => r.map_err(|_| TransferError::Stalled(stall))?,
            };
            let chunk = match next {
                Some(chunk) => chunk?,
                None => break,
            };
            staged.append(&chunk).await?;
            let written = staged.written();
            self.update(t.id, |job| job.bytes_transferred = written).await;
        }

        if let Some(total) = opened.total {
            if total != staged.written() {
                return Err(TransferError::SizeMismatch { expected: total, actual: staged.written() }.into());
            }
        }
        staged.finish().await
    }

    /// Moves the verified file into the catalog unless the job was canceled meanwhile.
    async fn promote(&self, t: &Transfer, path: &Path, size: u64, digest: String) {
        let mut slot = self.inner.slot.write().await;
        if slot.job.id != Some(t.id) || !slot.job.is_running() || t.token.is_cancelled() {
            staging::discard(path).await;
            self.release_task();
            return;
        }

        let registered = self
            .inner
            .store
            .register(path, &t.file_name, size, Some(digest), Some(t.source.to_string()))
            .await;
        match registered {
            Ok(image) => {
                slot.job.state = JobState::Succeeded;
                slot.job.bytes_transferred = size;
                slot.job.image_id = Some(image.id.clone());
                slot.cancel = None;
                info!(id = %t.id, image = %image.id, size, "download succeeded");
            }
            Err(e) => {
                staging::discard(path).await;
                slot.job.state = JobState::Failed;
                slot.job.error = Some(format!("{:#}", e));
                slot.cancel = None;
                warn!(id = %t.id, "registering image failed: {:#}", e);
            }
        }
        self.release_task();
    }

    async fn fail(&self, id: JobId, error: String) {
        let mut slot = self.inner.slot.write().await;
        if slot.job.id == Some(id) && slot.job.is_running() {
            warn!(%id, "download failed: {}", error);
            slot.job.state = JobState::Failed;
            slot.job.error = Some(error);
            slot.cancel = None;
        }
        self.release_task();
    }

    // Every transfer task calls this exactly once, with the slot write lock
    // held, so the terminal state and the task count change together.
    fn release_task(&self) {
        self.inner.active_tasks.send_modify(|n| *n = n.saturating_sub(1));
    }

    async fn update(&self, id: JobId, f: impl FnOnce(&mut DownloadJob)) {
        let mut slot = self.inner.slot.write().await;
        if slot.job.id == Some(id) && slot.job.is_running() {
            f(&mut slot.job);
        }
    }
}

/// Accepts a hex SHA-256 digest, optionally prefixed with `sha256:`.
pub fn normalize_checksum(raw: &str) -> Result<String> {
    let digest = raw.strip_prefix("sha256:").unwrap_or(raw).to_ascii_lowercase();
    if digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(digest)
    } else {
        Err(VmediaError::InvalidRequest(format!("checksum is not a sha256 hex digest: {raw}")))
    }
}

use anyhow::Context;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Sequential writer for one in-progress download, hashing as it goes.
pub struct StagingFile {
    path: PathBuf,
    file: File,
    hasher: Sha256,
    written: u64,
}

impl StagingFile {
    pub async fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)
            .await
            .with_context(|| format!("open {:?}", path))?;

        Ok(Self { path: path.to_path_buf(), file, hasher: Sha256::new(), written: 0 })
    }

    pub async fn append(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.file
            .write_all(data)
            .await
            .with_context(|| format!("write {:?}", self.path))?;
        self.hasher.update(data);
        self.written += data.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flushes and syncs the file; returns its path, size and hex SHA-256.
    pub async fn finish(mut self) -> anyhow::Result<(PathBuf, u64, String)> {
        self.file.flush().await?;
        self.file.sync_all().await.with_context(|| format!("sync {:?}", self.path))?;
        let digest = hex::encode(self.hasher.finalize());
        Ok((self.path, self.written, digest))
    }
}

pub async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("discarded {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to discard {}: {e}", path.display()),
    }
}

/// Removes everything left in the staging area by an interrupted run.
pub async fn clean_staging_dir(dir: &Path) -> anyhow::Result<usize> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create staging dir {}", dir.display()))?;

    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            discard(&entry.path()).await;
            removed += 1;
        }
    }
    Ok(removed)
}

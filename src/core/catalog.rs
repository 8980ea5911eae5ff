//! Durable catalog of completed images.
//!
//! Each image is a regular file in the storage directory. Metadata lives in a
//! JSON sidecar under `<dir>/.vmedia/`, written with write-then-rename before
//! the image itself is renamed into place, so the catalog never points at a
//! partially written file. The in-memory list is rebuilt from disk on open.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::core::model::Image;
use crate::error::{Result, VmediaError};

const META_DIR: &str = ".vmedia";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sidecar {
    size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ImageStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    dir: PathBuf,
    meta_dir: PathBuf,
    extensions: Vec<String>,
    images: RwLock<Vec<Image>>,
}

impl ImageStore {
    pub async fn open(dir: &Path, extensions: &[String]) -> anyhow::Result<Self> {
        let meta_dir = dir.join(META_DIR);
        tokio::fs::create_dir_all(&meta_dir)
            .await
            .with_context(|| format!("create {}", meta_dir.display()))?;

        let store = Self {
            inner: Arc::new(StoreInner {
                dir: dir.to_path_buf(),
                meta_dir,
                extensions: extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
                images: RwLock::new(vec![]),
            }),
        };
        let count = store.rescan().await?;
        info!("catalog opened at {} with {} image(s)", dir.display(), count);
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Whether `file_name` is a name the catalog would list.
    pub fn accepts(&self, file_name: &str) -> bool {
        if file_name.is_empty() || file_name.starts_with('.') {
            return false;
        }
        Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.inner.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    pub async fn list(&self) -> Vec<Image> {
        self.inner.images.read().await.clone()
    }

    pub async fn resolve(&self, id: &str) -> Result<Image> {
        self.inner
            .images
            .read()
            .await
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or_else(|| VmediaError::NotFound(id.to_string()))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.images.read().await.iter().any(|i| i.id == id)
    }

    /// True when `file_name` is cataloged or a file of that name already sits
    /// in the storage directory (copied in after the last rescan).
    pub async fn is_taken(&self, file_name: &str) -> bool {
        if self.contains(file_name).await {
            return true;
        }
        tokio::fs::try_exists(self.inner.dir.join(file_name)).await.unwrap_or(true)
    }

    pub async fn find_by_path(&self, path: &Path) -> Option<Image> {
        self.inner
            .images
            .read()
            .await
            .iter()
            .find(|i| i.path == path)
            .cloned()
    }

    /// Moves a verified staged file into the catalog and records it.
    pub async fn register(
        &self,
        staged: &Path,
        file_name: &str,
        size_bytes: u64,
        checksum: Option<String>,
        source: Option<String>,
    ) -> anyhow::Result<Image> {
        let mut images = self.inner.images.write().await;
        if images.iter().any(|i| i.id == file_name) {
            anyhow::bail!("image {} already exists", file_name);
        }
        let target = self.inner.dir.join(file_name);
        if tokio::fs::try_exists(&target).await.unwrap_or(true) {
            anyhow::bail!("{} already exists on disk", target.display());
        }

        let sidecar = Sidecar { size_bytes, checksum, source, created_at: Utc::now() };
        let sidecar_path = self.sidecar_path(file_name);
        write_sidecar(&sidecar_path, &sidecar).await?;

        if let Err(e) = move_into_place(staged, &target).await {
            let _ = tokio::fs::remove_file(&sidecar_path).await;
            return Err(e);
        }

        let image = Image {
            id: file_name.to_string(),
            path: target,
            size_bytes: sidecar.size_bytes,
            checksum: sidecar.checksum,
            source: sidecar.source,
            created_at: sidecar.created_at,
        };
        images.push(image.clone());
        info!(id = %image.id, size = image.size_bytes, "image registered");
        Ok(image)
    }

    pub async fn delete(&self, id: &str) -> Result<Image> {
        let mut images = self.inner.images.write().await;
        let pos = images
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| VmediaError::NotFound(id.to_string()))?;

        let path = images[pos].path.clone();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("image file {} already gone", path.display());
            }
            Err(e) => return Err(e.into()),
        }
        let _ = tokio::fs::remove_file(self.sidecar_path(id)).await;

        let image = images.remove(pos);
        info!(id = %image.id, "image deleted");
        Ok(image)
    }

    /// Rebuilds the in-memory catalog from the storage directory.
    pub async fn rescan(&self) -> anyhow::Result<usize> {
        let mut images = self.inner.images.write().await;
        let mut found = vec![];

        let mut entries = tokio::fs::read_dir(&self.inner.dir)
            .await
            .with_context(|| format!("read_dir {}", self.inner.dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !self.accepts(&name) {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            found.push(self.load_image(&name, entry.path(), &meta).await);
        }

        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        self.prune_orphan_sidecars(&found).await?;

        let count = found.len();
        *images = found;
        Ok(count)
    }

    async fn load_image(&self, name: &str, path: PathBuf, meta: &std::fs::Metadata) -> Image {
        let sidecar_path = self.sidecar_path(name);
        let sidecar = match tokio::fs::read(&sidecar_path).await {
            Ok(raw) => match serde_json::from_slice::<Sidecar>(&raw) {
                Ok(s) if s.size_bytes == meta.len() => Some(s),
                Ok(_) => {
                    warn!("sidecar for {} disagrees with file size, ignoring it", name);
                    None
                }
                Err(e) => {
                    warn!("unreadable sidecar {}: {e}", sidecar_path.display());
                    None
                }
            },
            Err(_) => None,
        };

        match sidecar {
            Some(s) => Image {
                id: name.to_string(),
                path,
                size_bytes: s.size_bytes,
                checksum: s.checksum,
                source: s.source,
                created_at: s.created_at,
            },
            None => Image {
                id: name.to_string(),
                path,
                size_bytes: meta.len(),
                checksum: None,
                source: None,
                created_at: meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
            },
        }
    }

    async fn prune_orphan_sidecars(&self, images: &[Image]) -> anyhow::Result<()> {
        let mut entries = tokio::fs::read_dir(&self.inner.meta_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let keep = name
                .strip_suffix(".json")
                .map(|id| images.iter().any(|i| i.id == id))
                .unwrap_or(false);
            if !keep {
                debug!("removing orphan sidecar {}", name);
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
        Ok(())
    }

    fn sidecar_path(&self, id: &str) -> PathBuf {
        self.inner.meta_dir.join(format!("{id}.json"))
    }
}

async fn write_sidecar(path: &Path, sidecar: &Sidecar) -> anyhow::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(sidecar)?;
    {
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        tokio::io::AsyncWriteExt::write_all(&mut f, &body).await?;
        f.sync_all().await?;
    }
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Renames `from` to `to`; across filesystems, copies to a hidden temp name first.
async fn move_into_place(from: &Path, to: &Path) -> anyhow::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }

    let name = to.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    let tmp = to.with_file_name(format!(".{name}.tmp"));
    tokio::fs::copy(from, &tmp)
        .await
        .with_context(|| format!("copy {} -> {}", from.display(), tmp.display()))?;
    tokio::fs::File::open(&tmp).await?.sync_all().await?;
    tokio::fs::rename(&tmp, to)
        .await
        .with_context(|| format!("rename {} -> {}", tmp.display(), to.display()))?;
    let _ = tokio::fs::remove_file(from).await;
    Ok(())
}

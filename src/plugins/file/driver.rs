use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::plugins::registry::{DriverContext, TransferDriver, TransferStream};

/// Reads images from a locally reachable path (USB stick, NFS mount).
pub struct FileDriver;

impl FileDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FileDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferDriver for FileDriver {
    fn name(&self) -> &'static str { "file-driver" }

    fn supports(&self, source: &Url) -> bool {
        source.scheme() == "file"
    }

    async fn open(&self, source: &Url, _ctx: &DriverContext) -> anyhow::Result<TransferStream> {
        let path = source
            .to_file_path()
            .map_err(|_| anyhow::anyhow!("not a local path: {}", source))?;
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("open {}", path.display()))?;
        let total = file.metadata().await.ok().map(|m| m.len());
        let body = ReaderStream::new(file)
            .map(|chunk| chunk.map_err(anyhow::Error::from))
            .boxed();
        Ok(TransferStream { total, body })
    }
}

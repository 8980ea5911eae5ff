use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

pub type JobId = Uuid;
pub type ImageId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Canceled)
    }
}

/// What a client hands to `DownloadManager::start`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadRequest {
    pub source: String,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

impl DownloadRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self { source: source.into(), checksum: None, filename: None }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

/// The single current (or most recent) transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub id: Option<JobId>,
    pub source: Option<String>,
    pub file_name: Option<String>,
    pub destination_path: Option<PathBuf>,
    pub state: JobState,
    pub bytes_transferred: u64,
    pub bytes_total: Option<u64>,
    pub error: Option<String>,
    pub image_id: Option<ImageId>,
}

impl DownloadJob {
    pub fn idle() -> Self {
        Self {
            id: None,
            source: None,
            file_name: None,
            destination_path: None,
            state: JobState::Idle,
            bytes_transferred: 0,
            bytes_total: None,
            error: None,
            image_id: None,
        }
    }

    pub fn running(id: JobId, source: String, file_name: String, destination_path: PathBuf) -> Self {
        Self {
            id: Some(id),
            source: Some(source),
            file_name: Some(file_name),
            destination_path: Some(destination_path),
            state: JobState::Running,
            ..Self::idle()
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }
}

/// A completed, verified image in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub id: ImageId,
    #[serde(skip_serializing)]
    pub path: PathBuf,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Cdrom,
    Generic,
}

impl DeviceMode {
    pub fn is_cdrom(self) -> bool {
        self == DeviceMode::Cdrom
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountState {
    pub mounted_image_id: Option<ImageId>,
    pub device_mode: DeviceMode,
}

use std::fmt;
use std::time::Duration;

/// Why the gate refuses new transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisabledReason {
    TransferRunning,
    /// A canceled transfer has not finished cleaning up yet.
    TransferStopping,
    InsufficientSpace { available: u64, required: u64 },
    StorageUnavailable(String),
    FeatureDisabled,
}

impl fmt::Display for DisabledReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisabledReason::TransferRunning => write!(f, "a download is in progress"),
            DisabledReason::TransferStopping => write!(f, "the previous download is still stopping"),
            DisabledReason::InsufficientSpace { available, required } => {
                write!(f, "insufficient free space: {available} bytes available, {required} required")
            }
            DisabledReason::StorageUnavailable(why) => write!(f, "storage unavailable: {why}"),
            DisabledReason::FeatureDisabled => write!(f, "virtual media is disabled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Conflict,
    NotFound,
    Precondition,
    InvalidRequest,
    Device,
    Io,
}

#[derive(thiserror::Error, Debug)]
pub enum VmediaError {
    #[error("a download is already running")]
    DownloadRunning,

    #[error("the previous download is still stopping")]
    TransferStopping,

    #[error("no active download")]
    NoActiveJob,

    #[error("image already exists: {0}")]
    ImageExists(String),

    #[error("image is mounted: {0}")]
    ImageMounted(String),

    #[error("image not found: {0}")]
    NotFound(String),

    #[error("download unavailable: {0}")]
    Disabled(DisabledReason),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VmediaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmediaError::DownloadRunning
            | VmediaError::TransferStopping
            | VmediaError::NoActiveJob
            | VmediaError::ImageExists(_)
            | VmediaError::ImageMounted(_) => ErrorKind::Conflict,
            VmediaError::NotFound(_) => ErrorKind::NotFound,
            VmediaError::Disabled(_) => ErrorKind::Precondition,
            VmediaError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            VmediaError::MountFailed(_) => ErrorKind::Device,
            VmediaError::Io(_) | VmediaError::Other(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, VmediaError>;

/// Terminal failure of a background transfer, recorded on the job.
#[derive(thiserror::Error, Debug)]
pub enum TransferError {
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("no data received for {0:?}")]
    Stalled(Duration),

    #[error("transfer exceeded {0:?}")]
    TimedOut(Duration),

    #[error("canceled")]
    Canceled,
}

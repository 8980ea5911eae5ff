use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::response::{ok, ApiResult};
use crate::api::AppState;
use crate::core::gate::GateStatus;
use crate::core::model::{DownloadJob, DownloadRequest, ImageId, JobId, JobState};

#[derive(Debug, Serialize)]
pub struct StartRsp {
    pub accepted: bool,
    #[serde(rename = "jobID")]
    pub job_id: JobId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRsp {
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub bytes_transferred: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "imageID", skip_serializing_if = "Option::is_none")]
    pub image_id: Option<ImageId>,
}

impl From<DownloadJob> for StatusRsp {
    fn from(job: DownloadJob) -> Self {
        Self {
            state: job.state,
            source: job.source,
            file: job.file_name,
            bytes_transferred: job.bytes_transferred,
            bytes_total: job.bytes_total,
            error: job.error,
            image_id: job.image_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CancelRsp {
    pub canceled: bool,
}

#[derive(Debug, Serialize)]
pub struct EnabledRsp {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub async fn start(State(state): State<AppState>, Json(req): Json<DownloadRequest>) -> ApiResult<StartRsp> {
    let job_id = state.media.downloads.start(req).await?;
    Ok(ok(StartRsp { accepted: true, job_id }))
}

pub async fn status(State(state): State<AppState>) -> ApiResult<StatusRsp> {
    Ok(ok(state.media.downloads.status().await.into()))
}

pub async fn cancel(State(state): State<AppState>) -> ApiResult<CancelRsp> {
    state.media.downloads.cancel().await?;
    Ok(ok(CancelRsp { canceled: true }))
}

pub async fn enabled(State(state): State<AppState>) -> ApiResult<EnabledRsp> {
    let rsp = match state.media.gate.evaluate().await {
        GateStatus::Enabled => EnabledRsp { enabled: true, reason: None },
        GateStatus::Disabled(reason) => EnabledRsp { enabled: false, reason: Some(reason.to_string()) },
    };
    Ok(ok(rsp))
}

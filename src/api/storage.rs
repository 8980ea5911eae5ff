use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::response::{ok, ApiResult};
use crate::api::AppState;
use crate::core::model::{Image, ImageId};

#[derive(Debug, Default, Deserialize)]
pub struct ImageReq {
    #[serde(rename = "imageID", default)]
    pub image_id: Option<ImageId>,
}

#[derive(Debug, Serialize)]
pub struct ImageIdRsp {
    #[serde(rename = "imageID", skip_serializing_if = "Option::is_none")]
    pub image_id: Option<ImageId>,
}

#[derive(Debug, Serialize)]
pub struct CdromRsp {
    pub cdrom: bool,
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Vec<Image>> {
    Ok(ok(state.media.store.list().await))
}

pub async fn mounted(State(state): State<AppState>) -> ApiResult<ImageIdRsp> {
    let current = state.media.mounts.get_mounted().await;
    Ok(ok(ImageIdRsp { image_id: current.mounted_image_id }))
}

/// An absent or empty `imageID` ejects the current image.
pub async fn mount(State(state): State<AppState>, Json(req): Json<ImageReq>) -> ApiResult<ImageIdRsp> {
    let mounts = &state.media.mounts;
    let current = match req.image_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => mounts.mount(id).await?,
        _ => mounts.unmount().await?,
    };
    Ok(ok(ImageIdRsp { image_id: current.mounted_image_id }))
}

pub async fn delete(State(state): State<AppState>, Json(req): Json<ImageReq>) -> ApiResult<ImageIdRsp> {
    let id = req.image_id.unwrap_or_default();
    let removed = state.media.mounts.remove_image(id.trim()).await?;
    Ok(ok(ImageIdRsp { image_id: Some(removed.id) }))
}

pub async fn cdrom(State(state): State<AppState>) -> ApiResult<CdromRsp> {
    let mode = state.media.mounts.device_mode().await;
    Ok(ok(CdromRsp { cdrom: mode.is_cdrom() }))
}

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::warn;

use crate::error::{ErrorKind, VmediaError};

/// `{"code": 0, "msg": "success", "data": ...}`; errors carry a negative code.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope { code: 0, msg: "success".to_string(), data: Some(data) })
}

pub fn err_response(status: StatusCode, code: i32, msg: impl Into<String>) -> Response {
    let body = Envelope::<()> { code, msg: msg.into(), data: None };
    (status, Json(body)).into_response()
}

pub struct ApiError(pub VmediaError);

impl From<VmediaError> for ApiError {
    fn from(e: VmediaError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match self.0.kind() {
            ErrorKind::InvalidRequest => (StatusCode::BAD_REQUEST, -1),
            ErrorKind::Conflict => (StatusCode::CONFLICT, -2),
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, -3),
            ErrorKind::Precondition => (StatusCode::PRECONDITION_FAILED, -4),
            ErrorKind::Device => (StatusCode::INTERNAL_SERVER_ERROR, -5),
            ErrorKind::Io => (StatusCode::INTERNAL_SERVER_ERROR, -6),
        };
        if status.is_server_error() {
            warn!("request failed: {}", self.0);
        }
        err_response(status, code, self.0.to_string())
    }
}

pub type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

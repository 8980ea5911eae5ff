//! HTTP surface of the virtual media subsystem.

pub mod download;
pub mod response;
pub mod storage;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tracing::debug;

use crate::app::VirtualMedia;

#[derive(Clone)]
pub struct AppState {
    pub media: VirtualMedia,
    pub api_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(media: VirtualMedia, api_token: Option<String>) -> Self {
        Self { media, api_token: api_token.map(Arc::from) }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/download/image", post(download::start))
        .route("/download/image/status", get(download::status))
        .route("/download/image/cancel", post(download::cancel))
        .route("/download/image/enabled", get(download::enabled))
        .route("/storage/image", get(storage::list).delete(storage::delete))
        .route("/storage/image/mounted", get(storage::mounted))
        .route("/storage/image/mount", post(storage::mount))
        .route("/storage/cdrom", get(storage::cdrom))
        .layer(middleware::from_fn_with_state(state.clone(), check_token));

    Router::new().nest("/api", api).with_state(state)
}

/// Boundary hook for the appliance's token check; open when no token is configured.
async fn check_token(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = state.api_token.as_deref() else {
        return next.run(req).await;
    };

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected) {
        next.run(req).await
    } else {
        debug!(path = %req.uri().path(), "rejected request without valid token");
        response::err_response(StatusCode::UNAUTHORIZED, -1, "unauthorized")
    }
}

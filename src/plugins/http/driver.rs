use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::StatusCode;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use crate::plugins::registry::{DriverContext, TransferDriver, TransferStream};

#[derive(thiserror::Error, Debug)]
pub enum HttpDriverError {
    #[error("http status error: {0}")]
    Status(StatusCode),

    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),
}

pub struct HttpDriver {
    client: reqwest::Client,
}

impl HttpDriver {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    fn build_headers(ctx: &DriverContext) -> anyhow::Result<HeaderMap> {
        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, HeaderValue::from_str(&ctx.user_agent)?);
        Ok(h)
    }

    fn should_retry_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
    }

    async fn sleep_backoff(ctx: &DriverContext, attempt: u32) {
        let base = ctx.retry_backoff_ms.max(1);
        let shift = attempt.min(16);
        let mul = 1u64 << shift;
        let ms = base.saturating_mul(mul).min(30_000);
        sleep(Duration::from_millis(ms)).await;
    }
}

impl Default for HttpDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferDriver for HttpDriver {
    fn name(&self) -> &'static str { "http-driver" }

    fn supports(&self, source: &Url) -> bool {
        matches!(source.scheme(), "http" | "https")
    }

    /// Retries only the initial response; once the body is streaming, a failure is final.
    async fn open(&self, source: &Url, ctx: &DriverContext) -> anyhow::Result<TransferStream> {
        let headers = Self::build_headers(ctx)?;
        let wait = Duration::from_secs(ctx.timeout_secs.max(1));

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..=ctx.retries {
            if attempt > 0 {
                Self::sleep_backoff(ctx, attempt - 1).await;
            }

            let send = self.client.get(source.clone()).headers(headers.clone()).send();
            let resp = match tokio::time::timeout(wait, send).await {
                Ok(Ok(r)) => r,
                Ok(Err(e)) => {
                    warn!(%source, attempt, "request failed: {e}");
                    last_err = Some(e.into());
                    continue;
                }
                Err(_) => {
                    warn!(%source, attempt, "no response within {:?}", wait);
                    last_err = Some(HttpDriverError::ResponseTimeout(wait).into());
                    continue;
                }
            };

            let status = resp.status();
            if status.is_success() {
                let total = resp.content_length();
                debug!(%source, ?total, "response accepted");
                let body = resp
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(anyhow::Error::from))
                    .boxed();
                return Ok(TransferStream { total, body });
            }

            if Self::should_retry_status(status) {
                warn!(%source, attempt, %status, "retryable status");
                last_err = Some(HttpDriverError::Status(status).into());
                continue;
            }
            return Err(HttpDriverError::Status(status).into());
        }

        Err(last_err.unwrap_or_else(|| HttpDriverError::Status(StatusCode::REQUEST_TIMEOUT).into()))
    }
}

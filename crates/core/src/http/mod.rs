//! Web frontend: byte-range streaming plus a small JSON API.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::header::{CONTENT_RANGE, RETRY_AFTER};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router, middleware};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::media::MediaRepository;
use crate::pool::WorkerPool;
use crate::{Error, Result};

mod api;
mod auth;
mod stream;

pub use stream::{ByteRange, parse_range};

pub const PAGE_SIZE: u32 = 12;

#[derive(Debug, Clone)]
pub struct WebSettings {
    pub api_token: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub stream_buffer_size: usize,
}

impl WebSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            api_token: config.require_api_token()?.to_string(),
            username: config.web_username.clone(),
            password: config.web_password.clone(),
            stream_buffer_size: config.stream_buffer_size,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<WorkerPool>,
    pub repo: Arc<dyn MediaRepository>,
    pub settings: Arc<WebSettings>,
}

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/media", get(api::list_media))
        .route("/api/media/:media_id", delete(api::delete_media))
        .route("/api/info", get(api::media_info))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_token,
        ));

    Router::new()
        .route("/stream/:media_id", get(stream::stream_media))
        .route("/api/thumb/:media_id", get(api::thumbnail))
        .route("/api/login", post(api::login))
        .route("/api/health", get(api::health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until `shutdown` resolves, then drains in-flight requests.
pub async fn serve<F>(addr: SocketAddr, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        event = "http.listening",
        addr = %listener.local_addr()?,
        "http.listening"
    );
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!(event = "http.stopped", "http.stopped");
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("range not satisfiable")]
    RangeNotSatisfiable { size: u64 },

    #[error(transparent)]
    Core(#[from] Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::Core(e) => match e {
                Error::NotFound { .. } | Error::NoThumbnail => StatusCode::NOT_FOUND,
                Error::InvalidConfig { .. } => StatusCode::BAD_REQUEST,
                Error::Auth { .. } => StatusCode::UNAUTHORIZED,
                Error::FloodWaitTooLong { .. } => StatusCode::SERVICE_UNAVAILABLE,
                Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
                Error::UnexpectedType { .. }
                | Error::Remote { .. }
                | Error::CdnRedirect { .. }
                | Error::FloodWait { .. } => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(event = "http.internal_error", error = %self, "http.internal_error");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        let mut response = (status, Json(json!({ "error": message }))).into_response();
        match &self {
            Self::RangeNotSatisfiable { size } => {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    response.headers_mut().insert(CONTENT_RANGE, value);
                }
            }
            Self::Core(Error::FloodWaitTooLong { requested, .. }) => {
                let secs = requested.as_secs() + u64::from(requested.subsec_nanos() > 0);
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(secs));
            }
            _ => {}
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn core_errors_map_to_statuses() {
        let cases = [
            (Error::not_found("message 1"), StatusCode::NOT_FOUND),
            (Error::NoThumbnail, StatusCode::NOT_FOUND),
            (
                Error::FloodWaitTooLong {
                    requested: Duration::from_secs(10),
                    ceiling: Duration::from_secs(5),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (Error::remote("RPC_CALL_FAIL"), StatusCode::BAD_GATEWAY),
            (Error::Cancelled, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn flood_wait_response_carries_retry_after() {
        let response = ApiError::from(Error::FloodWaitTooLong {
            requested: Duration::from_millis(9_500),
            ceiling: Duration::from_secs(5),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[RETRY_AFTER], "10");
    }

    #[test]
    fn unsatisfiable_range_reports_size() {
        let response = ApiError::RangeNotSatisfiable { size: 100 }.into_response();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes */100");
    }
}

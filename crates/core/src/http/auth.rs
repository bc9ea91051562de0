use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;
use tracing::debug;

use super::{ApiError, AppState};

pub(super) fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Extracts the token from `Authorization: Basic <token>`.
fn presented_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Basic ")
        .map(str::trim)
}

pub async fn require_api_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    match presented_token(&request) {
        Some(token) if constant_time_eq(token, &state.settings.api_token) => {
            Ok(next.run(request).await)
        }
        _ => {
            debug!(
                event = "http.unauthorized",
                path = %request.uri().path(),
                "http.unauthorized"
            );
            Err(ApiError::Unauthorized)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(authorization: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("/api/info");
        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn token_requires_basic_scheme() {
        assert_eq!(presented_token(&request(Some("Basic s3cret"))), Some("s3cret"));
        assert_eq!(presented_token(&request(Some("Bearer s3cret"))), None);
        assert_eq!(presented_token(&request(None)), None);
    }

    #[test]
    fn comparison_is_exact() {
        assert!(constant_time_eq("s3cret", "s3cret"));
        assert!(!constant_time_eq("s3cret", "s3cre"));
        assert!(!constant_time_eq("", "s3cret"));
    }
}

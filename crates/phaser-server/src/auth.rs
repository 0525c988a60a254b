use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;

/// Admin API authentication.
#[derive(Clone, Default)]
pub struct AuthConfig {
    /// Bearer token for REST API access. None = auth disabled.
    pub bearer_token: Option<String>,
}

impl AuthConfig {
    /// Whether an `Authorization` header value grants access.
    pub fn permits(&self, header: Option<&str>) -> bool {
        let Some(expected) = &self.bearer_token else {
            return true;
        };
        header.and_then(|v| v.strip_prefix("Bearer ")) == Some(expected.as_str())
    }
}

/// Axum middleware that validates Bearer token authentication. Expects the
/// `AuthConfig` in request extensions; without one, requests pass.
pub async fn bearer_auth_middleware(
    headers: HeaderMap,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_config = request
        .extensions()
        .get::<AuthConfig>()
        .cloned()
        .unwrap_or_default();

    let provided = headers.get("authorization").and_then(|v| v.to_str().ok());
    if !auth_config.permits(provided) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}

//! 边界错误渲染

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use mcpgw_errors::{AppError, ErrorCategory, SecretMasker, Severity};
use tracing::{error, warn};

/// 将错误渲染为 `{code, message, data}` 响应，消息中的密钥先被掩码
pub fn render_error(err: &AppError, masker: &SecretMasker) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    match err.severity() {
        Severity::Critical | Severity::High if status.is_server_error() => {
            error!(category = %err.category(), message = %masker.mask(err.message()), "Request failed")
        }
        _ if status.is_server_error() => {
            warn!(category = %err.category(), message = %masker.mask(err.message()), "Request failed")
        }
        _ => {}
    }

    let mut response = (status, Json(err.to_boundary(masker))).into_response();
    if err.category() == ErrorCategory::RateLimit {
        if let Some(secs) = err.metadata().get("retryAfter").and_then(|v| v.as_u64()) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use mcpgw_errors::BoundaryError;

    async fn body_of(response: Response) -> BoundaryError {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_boundary_shape_and_status() {
        let masker = SecretMasker::new();
        let response = render_error(&AppError::authentication("Token has expired"), &masker);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = body_of(response).await;
        assert_eq!(body.code, "AUTHENTICATION");
        assert_eq!(body.message, "Token has expired");
        assert_eq!(body.data["retryable"], false);
        assert!(body.data.contains_key("recoveryAction"));
        assert!(body.data.contains_key("timestamp"));
    }

    #[tokio::test]
    async fn test_secrets_masked() {
        let masker = SecretMasker::new().with_secret("client-secret-value-0123456789");
        let err = AppError::network("POST failed: client_secret=client-secret-value-0123456789");
        let body = body_of(render_error(&err, &masker)).await;
        assert!(!body.message.contains("client-secret-value"));
    }

    #[tokio::test]
    async fn test_rate_limit_sets_retry_after() {
        let response = render_error(&AppError::rate_limited("slow down", 42), &SecretMasker::new());
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["Retry-After"], "42");
        let body = body_of(response).await;
        assert_eq!(body.data["retryAfter"], 42);
    }

    #[tokio::test]
    async fn test_circuit_open_is_503() {
        let response = render_error(&AppError::circuit_open("identity", 100), &SecretMasker::new());
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

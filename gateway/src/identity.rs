//! OAuth2 身份提供方客户端
//!
//! `refresh_token` 授权经断路器与身份提供方重试策略保护；
//! 低层失败在这里归类为统一错误。

use std::time::Duration;

use async_trait::async_trait;
use mcpgw_common::{CircuitBreaker, RetryPolicy, with_retry};
use mcpgw_config::IdentityConfig;
use mcpgw_errors::{AppError, AppResult, RawFailure, RetryStrategy, classify_failure};
use mcpgw_ports::{IdentityProvider, TokenGrant};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

/// 身份提供方返回的 OAuth2 错误体
#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// 基于 HTTP 的身份提供方
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Option<SecretString>,
    breaker: CircuitBreaker,
    policy: RetryPolicy,
}

impl std::fmt::Debug for HttpIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpIdentityProvider")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("breaker", &self.breaker.name())
            .finish_non_exhaustive()
    }
}

impl HttpIdentityProvider {
    pub fn new(
        config: &IdentityConfig,
        breaker: CircuitBreaker,
        strategy: RetryStrategy,
    ) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to build HTTP client: {}", e)))?;

        let probe = breaker.clone();
        let policy = RetryPolicy::for_identity_provider(strategy)
            .with_circuit_probe(move || probe.is_rejecting())
            .with_observer(|attempt, err, delay| {
                warn!(
                    attempt,
                    category = %err.category(),
                    delay_ms = delay.as_millis() as u64,
                    "Retrying identity provider call"
                );
            });

        Ok(Self {
            client,
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            breaker,
            policy,
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn request_refresh(&self, refresh_token: &str) -> AppResult<TokenGrant> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.expose_secret().as_str()));
        }

        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(transport_failure)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status_failure(status.as_u16(), &body)));
        }

        response.json::<TokenGrant>().await.map_err(|e| {
            AppError::validation(format!("Malformed token response: {}", e))
                .with_http_status(status.as_u16())
        })
    }
}

/// 传输层失败：超时、连接被拒、连接重置等
fn transport_failure(e: reqwest::Error) -> AppError {
    let mut raw = RawFailure::new(format!("Identity provider request failed: {}", e));
    if e.is_timeout() {
        raw = raw.with_code("ETIMEDOUT");
    } else if e.is_connect() {
        raw = raw.with_code("ECONNREFUSED");
    }
    classify_failure(raw)
}

/// 非 2xx 响应：优先使用 OAuth2 错误码（例如 `invalid_grant`）
fn status_failure(status: u16, body: &str) -> RawFailure {
    match serde_json::from_str::<OAuthErrorBody>(body) {
        Ok(oauth) => {
            let message = match oauth.error_description {
                Some(desc) => format!("Identity provider returned {}: {}", oauth.error, desc),
                None => format!("Identity provider returned {}", oauth.error),
            };
            RawFailure::new(message).with_status(status).with_code(oauth.error)
        }
        Err(_) => RawFailure::new(format!("Identity provider returned HTTP {}", status))
            .with_status(status),
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn refresh_token(&self, refresh_token: &str) -> AppResult<TokenGrant> {
        let grant = with_retry(&self.policy, "identity.refresh_token", || {
            self.breaker.execute(|| self.request_refresh(refresh_token))
        })
        .await?;
        debug!(expires_in = grant.expires_in, "Access token refreshed");
        Ok(grant)
    }

    fn is_available(&self) -> bool {
        !self.breaker.is_rejecting()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpgw_errors::ErrorCategory;

    #[test]
    fn test_invalid_grant_is_authentication() {
        let err = classify_failure(status_failure(
            400,
            r#"{"error":"invalid_grant","error_description":"refresh token revoked"}"#,
        ));
        assert_eq!(err.category(), ErrorCategory::Authentication);
        assert_eq!(err.code(), Some("invalid_grant"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_server_errors_are_retryable() {
        let err = classify_failure(status_failure(503, "<html>down</html>"));
        assert_eq!(err.category(), ErrorCategory::ServiceUnavailable);
        assert!(err.is_retryable());
        assert_eq!(err.http_status(), Some(503));
    }
}

use crate::*;
use secrecy::SecretString;

const SECRET: &str = "0123456789abcdef0123456789abcdef";

fn valid_config() -> AppConfig {
    AppConfig {
        app_env: "test".to_string(),
        server: ServerConfig::default(),
        session: SessionConfig {
            backend: "file".to_string(),
            directory: "/tmp/sessions".into(),
            encryption_secret: SecretString::new(SECRET.to_string()),
            timeout_secs: 3600,
            cleanup_interval_secs: 60,
            max_sessions_per_user: 5,
        },
        auth: AuthConfig {
            token_secret: SecretString::new(format!("{}-token", SECRET)),
            issuer: "mcp-gateway".to_string(),
            audience: "mcp-clients".to_string(),
            blacklist_sweep_secs: 300,
        },
        rate_limit: RateLimitConfig::default(),
        circuit_breaker: CircuitBreakerSettings::default(),
        retry: RetrySettings::default(),
        identity: None,
        telemetry: TelemetryConfig::default(),
    }
}

#[test]
fn test_secret_redaction() {
    let config = valid_config();
    let debug_output = format!("{:?}", config);
    assert!(!debug_output.contains(SECRET));
    assert!(debug_output.contains("REDACTED"));
}

#[test]
fn test_valid_config_passes() {
    let config = valid_config();
    assert!(config.validate().is_ok());
    assert_eq!(config.session.backend_kind().unwrap(), SessionBackend::File);
}

#[test]
fn test_short_secret_rejected() {
    let mut config = valid_config();
    config.session.encryption_secret = SecretString::new("too-short".to_string());
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("session.encryption_secret"));

    let app_err: mcpgw_errors::AppError = err.into();
    assert_eq!(
        app_err.category(),
        mcpgw_errors::ErrorCategory::Configuration
    );
    assert!(!app_err.is_retryable());
}

#[test]
fn test_zero_values_rejected() {
    let mut config = valid_config();
    config.rate_limit.max_requests = 0;
    config.session.max_sessions_per_user = 0;
    config.circuit_breaker.failure_threshold = 0;
    let msg = config.validate().unwrap_err().to_string();
    assert!(msg.contains("rate_limit.max_requests"));
    assert!(msg.contains("session.max_sessions_per_user"));
    assert!(msg.contains("circuit_breaker.failure_threshold"));
}

#[test]
fn test_unknown_backend_rejected() {
    let mut config = valid_config();
    config.session.backend = "redis".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_conversions() {
    let config = valid_config();
    let breaker = config.circuit_breaker.to_breaker_config();
    assert_eq!(breaker.failure_threshold, 5);
    assert_eq!(breaker.failure_window, Duration::from_secs(30));
    assert_eq!(breaker.recovery_timeout, Duration::from_secs(60));
    assert_eq!(breaker.success_threshold, 3);

    let strategy = config.retry.to_strategy();
    assert_eq!(strategy.max_retries, 3);
    assert_eq!(strategy.initial_delay, Duration::from_secs(1));
    assert!(strategy.jitter);
}

#[test]
fn test_secret_masker_covers_configured_secrets() {
    let config = valid_config();
    let masker = config.secret_masker();
    let masked = masker.mask(&format!("key={} token={}-token", SECRET, SECRET));
    assert!(!masked.contains(SECRET));
}

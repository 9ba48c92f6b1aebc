use figment::Jail;
use mcpgw_config::{AppConfig, SessionBackend};
use secrecy::ExposeSecret;

const DEFAULT_TOML: &str = r#"
[session]
backend = "memory"
encryption_secret = "default-encryption-secret-000000000000"
timeout_secs = 3600

[auth]
token_secret = "default-token-secret-0000000000000000000"

[rate_limit]
max_requests = 50
"#;

#[test]
fn test_defaults_and_file_values() {
    Jail::expect_with(|jail| {
        jail.create_file("default.toml", DEFAULT_TOML)?;

        let config = AppConfig::load(".").map_err(|e| e.to_string())?;
        assert_eq!(config.session.backend_kind().ok(), Some(SessionBackend::Memory));
        assert_eq!(config.session.timeout_secs, 3600);
        assert_eq!(config.session.cleanup_interval_secs, 60);
        assert_eq!(config.session.max_sessions_per_user, 5);
        assert_eq!(config.rate_limit.max_requests, 50);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.server.port, 8080);
        assert!(config.identity.is_none());
        Ok(())
    });
}

#[test]
fn test_env_file_and_env_vars_override() {
    Jail::expect_with(|jail| {
        jail.create_file("default.toml", DEFAULT_TOML)?;
        jail.create_file(
            "production.toml",
            r#"
            [server]
            port = 9443

            [session]
            backend = "file"
            "#,
        )?;
        jail.set_env("APP_ENV", "production");
        jail.set_env("MCPGW_APP_ENV", "production");
        jail.set_env(
            "MCPGW_SESSION__ENCRYPTION_SECRET",
            "env-encryption-secret-1111111111111111111",
        );
        jail.set_env("MCPGW_CIRCUIT_BREAKER__FAILURE_THRESHOLD", "7");

        let config = AppConfig::load(".").map_err(|e| e.to_string())?;
        assert!(config.is_production());
        assert_eq!(config.server.port, 9443);
        assert_eq!(config.session.backend_kind().ok(), Some(SessionBackend::File));
        assert_eq!(
            config.session.encryption_secret.expose_secret(),
            "env-encryption-secret-1111111111111111111"
        );
        assert_eq!(config.circuit_breaker.failure_threshold, 7);
        Ok(())
    });
}

#[test]
fn test_invalid_config_is_fatal() {
    Jail::expect_with(|jail| {
        jail.create_file("default.toml", DEFAULT_TOML)?;
        jail.set_env("MCPGW_SESSION__ENCRYPTION_SECRET", "short");

        let err = AppConfig::load(".").unwrap_err();
        assert!(err.to_string().contains("encryption_secret"));
        Ok(())
    });
}

#[test]
fn test_missing_required_secret() {
    Jail::expect_with(|jail| {
        jail.create_file("default.toml", "[session]\nbackend = \"memory\"\n")?;
        assert!(AppConfig::load(".").is_err());
        Ok(())
    });
}

//! mcpgw-config - 配置加载库
//!
//! 加载顺序：内置默认值 → `{dir}/default.toml` → `{dir}/{APP_ENV}.toml` →
//! `MCPGW_` 前缀环境变量（`__` 表示嵌套，例如 `MCPGW_SESSION__ENCRYPTION_SECRET`）。
//! 加载后统一校验一次，校验失败视为致命的配置错误。

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use mcpgw_common::CircuitBreakerConfig;
use mcpgw_errors::{AppError, RetryStrategy, SecretMasker};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

/// 密钥最小长度
pub const MIN_SECRET_LEN: usize = 32;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "MCPGW_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::Load(Box::new(e))
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::configuration(e.to_string())
    }
}

/// 服务器配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// 会话存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBackend {
    Memory,
    File,
}

/// 会话配置
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_session_dir")]
    pub directory: PathBuf,
    pub encryption_secret: SecretString,
    #[serde(default = "default_session_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions_per_user: usize,
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_session_dir() -> PathBuf {
    PathBuf::from("./data/sessions")
}

fn default_session_timeout() -> u64 {
    86400
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_max_sessions() -> usize {
    5
}

impl SessionConfig {
    pub fn backend_kind(&self) -> Result<SessionBackend, ConfigError> {
        match self.backend.to_ascii_lowercase().as_str() {
            "memory" => Ok(SessionBackend::Memory),
            "file" => Ok(SessionBackend::File),
            other => Err(ConfigError::Invalid(format!(
                "session.backend must be 'memory' or 'file', got '{}'",
                other
            ))),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// 会话令牌配置
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub token_secret: SecretString,
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_audience")]
    pub audience: String,
    #[serde(default = "default_blacklist_sweep")]
    pub blacklist_sweep_secs: u64,
}

fn default_issuer() -> String {
    "mcp-gateway".to_string()
}

fn default_audience() -> String {
    "mcp-clients".to_string()
}

fn default_blacklist_sweep() -> u64 {
    300
}

/// 限流配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_requests: 100,
        }
    }
}

/// 断路器配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub failure_window_ms: u64,
    pub recovery_timeout_ms: u64,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_ms: 30_000,
            recovery_timeout_ms: 60_000,
            success_threshold: 3,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            failure_window: Duration::from_millis(self.failure_window_ms),
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            success_threshold: self.success_threshold,
        }
    }
}

/// 重试配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetrySettings {
    pub fn to_strategy(&self) -> RetryStrategy {
        RetryStrategy::new(
            self.max_retries,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_multiplier(self.backoff_multiplier)
        .with_jitter(self.jitter)
    }
}

/// 身份提供方（OAuth2 token 端点）配置
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Option<SecretString>,
    #[serde(default = "default_identity_timeout")]
    pub timeout_ms: u64,
}

fn default_identity_timeout() -> u64 {
    10_000
}

/// 遥测配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_env")]
    pub app_env: String,
    #[serde(default)]
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    pub identity: Option<IdentityConfig>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_app_env() -> String {
    "development".to_string()
}

impl AppConfig {
    /// 从配置文件和环境变量加载并校验配置
    pub fn load(config_dir: &str) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(config_dir).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// 构建分层的 figment（不做校验）
    pub fn figment(config_dir: &str) -> Figment {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| default_app_env());

        Figment::new()
            .merge(Toml::file(format!("{}/default.toml", config_dir)))
            .merge(Toml::file(format!("{}/{}.toml", config_dir, env)))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// 启动时校验
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.session.encryption_secret.expose_secret().chars().count() < MIN_SECRET_LEN {
            problems.push(format!(
                "session.encryption_secret must be at least {} characters",
                MIN_SECRET_LEN
            ));
        }
        if self.auth.token_secret.expose_secret().chars().count() < MIN_SECRET_LEN {
            problems.push(format!(
                "auth.token_secret must be at least {} characters",
                MIN_SECRET_LEN
            ));
        }
        if let Err(ConfigError::Invalid(msg)) = self.session.backend_kind() {
            problems.push(msg);
        }

        let positive = [
            ("session.timeout_secs", self.session.timeout_secs),
            ("session.cleanup_interval_secs", self.session.cleanup_interval_secs),
            ("session.max_sessions_per_user", self.session.max_sessions_per_user as u64),
            ("auth.blacklist_sweep_secs", self.auth.blacklist_sweep_secs),
            ("rate_limit.window_secs", self.rate_limit.window_secs),
            ("rate_limit.max_requests", u64::from(self.rate_limit.max_requests)),
            (
                "circuit_breaker.failure_threshold",
                u64::from(self.circuit_breaker.failure_threshold),
            ),
            ("circuit_breaker.failure_window_ms", self.circuit_breaker.failure_window_ms),
            (
                "circuit_breaker.success_threshold",
                u64::from(self.circuit_breaker.success_threshold),
            ),
        ];
        for (name, value) in positive {
            if value == 0 {
                problems.push(format!("{} must be greater than 0", name));
            }
        }

        if !(self.retry.backoff_multiplier.is_finite() && self.retry.backoff_multiplier >= 1.0) {
            problems.push("retry.backoff_multiplier must be >= 1.0".to_string());
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            problems.push("retry.initial_delay_ms must not exceed retry.max_delay_ms".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join("; ")))
        }
    }

    /// 用所有已配置的密钥构建掩码器
    pub fn secret_masker(&self) -> SecretMasker {
        let mut masker = SecretMasker::new()
            .with_secret(self.session.encryption_secret.expose_secret().as_str())
            .with_secret(self.auth.token_secret.expose_secret().as_str());
        if let Some(secret) = self
            .identity
            .as_ref()
            .and_then(|identity| identity.client_secret.as_ref())
        {
            masker = masker.with_secret(secret.expose_secret().as_str());
        }
        masker
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.app_env == "production"
    }

    /// 是否为开发环境
    pub fn is_development(&self) -> bool {
        self.app_env == "development"
    }
}

#[cfg(test)]
mod tests;

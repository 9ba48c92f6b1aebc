//! mcpgw-telemetry - 可观测性库
//!
//! 审计事件使用 `target: "audit"` 输出，可通过 `RUST_LOG=audit=info` 单独过滤。

use mcpgw_errors::{AppError, AppResult};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// 审计日志的 tracing target
pub const AUDIT_TARGET: &str = "audit";

fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}

/// 初始化 tracing
pub fn init_tracing(log_level: &str) -> AppResult<()> {
    tracing_subscriber::registry()
        .with(env_filter(log_level))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| AppError::configuration(format!("Failed to init tracing: {}", e)))
}

/// 初始化 JSON 格式的 tracing（生产环境）
pub fn init_tracing_json(log_level: &str) -> AppResult<()> {
    tracing_subscriber::registry()
        .with(env_filter(log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .map_err(|e| AppError::configuration(format!("Failed to init tracing: {}", e)))
}

/// 按配置选择输出格式
pub fn init(log_level: &str, json: bool) -> AppResult<()> {
    if json {
        init_tracing_json(log_level)
    } else {
        init_tracing(log_level)
    }
}

/// 初始化 Prometheus metrics
pub fn init_metrics() -> AppResult<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::configuration(format!("Failed to install Prometheus recorder: {}", e)))
}

/// 健康检查状态
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub checks: Vec<HealthCheck>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            healthy: true,
            checks: Vec::new(),
        }
    }

    pub fn add_check(&mut self, name: impl Into<String>, healthy: bool, message: Option<String>) {
        if !healthy {
            self.healthy = false;
        }
        self.checks.push(HealthCheck {
            name: name.into(),
            healthy,
            message,
        });
    }

    /// 对应的 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        if self.healthy { 200 } else { 503 }
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

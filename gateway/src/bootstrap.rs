//! 组装与优雅关闭
//!
//! 所有组件在启动时创建一次，由这里持有并向下注入。

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use mcpgw_adapter_file::{FileSessionStore, FileStoreOptions};
use mcpgw_adapter_memory::{MemorySessionStore, MemoryStoreOptions};
use mcpgw_auth_core::{TokenBlacklist, TokenService, TokenValidator};
use mcpgw_common::{CircuitBreaker, PeriodicTask};
use mcpgw_config::{AppConfig, SessionBackend};
use mcpgw_crypto::CryptoService;
use mcpgw_errors::AppResult;
use mcpgw_ports::SessionStore;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::{error, info, warn};

use crate::identity::HttpIdentityProvider;
use crate::rate_limit::RateLimitRule;
use crate::routing::app;
use crate::state::AppState;

/// 身份提供方断路器名称
pub const IDENTITY_BREAKER: &str = "identity-provider";

/// 组装好的网关及其后台任务
pub struct Gateway {
    state: AppState,
    store: Arc<dyn SessionStore>,
    tasks: Vec<PeriodicTask>,
}

impl Gateway {
    pub async fn build(config: &AppConfig, metrics: Option<PrometheusHandle>) -> AppResult<Self> {
        let store = build_store(config).await?;

        let tokens = TokenService::new(
            &config.auth.token_secret,
            config.auth.issuer.clone(),
            config.auth.audience.clone(),
        );
        let validator = TokenValidator::new(tokens, Arc::new(TokenBlacklist::new()));

        let rule = RateLimitRule {
            max_requests: u64::from(config.rate_limit.max_requests),
            window: Duration::from_secs(config.rate_limit.window_secs),
        };
        let mut state = AppState::new(store.clone(), validator.clone())
            .with_rate_limit(rule)
            .with_masker(config.secret_masker());

        match &config.identity {
            Some(identity) => {
                let breaker = CircuitBreaker::new(
                    IDENTITY_BREAKER,
                    config.circuit_breaker.to_breaker_config(),
                );
                let provider =
                    HttpIdentityProvider::new(identity, breaker.clone(), config.retry.to_strategy())?;
                info!(token_url = %identity.token_url, "Identity provider configured");
                state = state.with_identity(Arc::new(provider), Some(breaker));
            }
            None => warn!("No identity provider configured, access tokens will not be refreshed"),
        }

        if let Some(handle) = metrics {
            state = state.with_metrics(handle);
        }

        let tasks = vec![
            validator.spawn_blacklist_sweeper(Duration::from_secs(config.auth.blacklist_sweep_secs)),
            state.rate_limiter.spawn_sweeper(rule.window),
            state.suspicious.spawn_sweeper(config.session.cleanup_interval()),
        ];

        Ok(Self {
            state,
            store,
            tasks,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        app(self.state.clone())
    }

    /// 取消所有周期任务并停止存储的清理任务
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.shutdown().await;
        }
        self.store.shutdown().await;
        info!(tasks = self.tasks.len(), "Background tasks stopped");
    }
}

async fn build_store(config: &AppConfig) -> AppResult<Arc<dyn SessionStore>> {
    let session = &config.session;
    let store: Arc<dyn SessionStore> = match session.backend_kind()? {
        SessionBackend::Memory => Arc::new(MemorySessionStore::new(MemoryStoreOptions {
            max_sessions_per_user: session.max_sessions_per_user,
            cleanup_interval: session.cleanup_interval(),
        })),
        SessionBackend::File => {
            let crypto = Arc::new(CryptoService::new(&session.encryption_secret)?);
            Arc::new(
                FileSessionStore::open(
                    session.directory.clone(),
                    crypto,
                    FileStoreOptions {
                        max_sessions_per_user: session.max_sessions_per_user,
                        cleanup_interval: session.cleanup_interval(),
                    },
                )
                .await?,
            )
        }
    };
    info!(backend = %session.backend, "Session store ready");
    Ok(store)
}

/// 等待关闭信号（Ctrl+C 或 SIGTERM）
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

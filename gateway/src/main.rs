//! MCP Gateway

use std::net::SocketAddr;

use mcpgw_config::AppConfig;
use mcpgw_gateway::{Gateway, shutdown_signal};
use mcpgw_telemetry::init_metrics;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // 加载配置
    let config_dir = std::env::var("MCPGW_CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
    let config = AppConfig::load(&config_dir)?;

    // 初始化 tracing
    mcpgw_telemetry::init(
        &config.telemetry.log_level,
        config.telemetry.json || config.is_production(),
    )?;

    let metrics = match init_metrics() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder not installed");
            None
        }
    };

    let gateway = Gateway::build(&config, metrics).await?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!(%addr, app_env = %config.app_env, backend = %config.session.backend, "Starting gateway");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        gateway
            .router()
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    gateway.shutdown().await;
    info!("Gateway stopped");
    Ok(())
}

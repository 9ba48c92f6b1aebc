//! mcpgw-gateway - MCP 网关安全中间件
//!
//! 认证、令牌刷新、限流、可疑活动检测与审计，组装为 axum 路由。
//! 限流计数与可疑活动跟踪保存在进程内，只支持单实例部署。

pub mod audit;
pub mod bootstrap;
pub mod context;
pub mod error;
pub mod identity;
pub mod middleware;
pub mod rate_limit;
pub mod routing;
pub mod state;
pub mod suspicious;

pub use bootstrap::{Gateway, shutdown_signal};
pub use routing::app;
pub use state::AppState;

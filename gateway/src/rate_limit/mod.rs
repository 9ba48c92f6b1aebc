//! 固定窗口限流
//!
//! 计数保存在进程内：多实例部署时每个实例各自计数。

pub mod limiter;
pub mod middleware;
pub mod types;

pub use limiter::RateLimiter;
pub use middleware::rate_limit_middleware;
pub use types::{RateLimitEntry, RateLimitResult, RateLimitRule};

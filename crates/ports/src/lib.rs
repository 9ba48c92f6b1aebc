//! ports - 抽象 trait 层
//!
//! 安全中间件只通过这些接口访问会话存储和身份提供方。

mod identity;
mod session_store;

pub use identity::*;
pub use session_store::*;

//! domain-core - 会话领域模型
//!
//! `SessionData` 及其显式的按字段合并规则（`SessionPatch`）。

mod expiry;
mod index;
mod patch;
mod session;

pub use expiry::*;
pub use index::*;
pub use patch::*;
pub use session::*;

// Re-export common types
pub use mcpgw_common::{SessionId, UserId};

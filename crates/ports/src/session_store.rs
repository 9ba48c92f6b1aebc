//! SessionStore trait 定义

use async_trait::async_trait;
use mcpgw_common::{SessionId, UserId};
use mcpgw_domain_core::{SessionData, SessionPatch};
use mcpgw_errors::AppResult;

/// 会话存储 trait
///
/// 过期会话一律视为不存在：`get` 遇到过期会话时删除它并返回 `None`。
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 保存新会话，返回会话 ID
    async fn create(&self, session: SessionData) -> AppResult<SessionId>;

    /// 获取会话
    async fn get(&self, session_id: &SessionId) -> AppResult<Option<SessionData>>;

    /// 部分更新会话，会话不存在时返回 NotFound
    async fn update(&self, session_id: &SessionId, patch: SessionPatch) -> AppResult<()>;

    /// 删除会话（幂等）
    async fn delete(&self, session_id: &SessionId) -> AppResult<()>;

    /// 删除所有过期会话，返回删除数量
    async fn cleanup(&self) -> AppResult<usize>;

    /// 获取用户的所有有效会话
    async fn get_user_sessions(&self, user_id: &UserId) -> AppResult<Vec<SessionData>>;

    /// 当前会话数量
    async fn session_count(&self) -> AppResult<usize>;

    /// 删除用户的所有会话，返回删除数量
    async fn delete_user_sessions(&self, user_id: &UserId) -> AppResult<usize> {
        let sessions = self.get_user_sessions(user_id).await?;
        for session in &sessions {
            self.delete(&session.session_id).await?;
        }
        Ok(sessions.len())
    }

    /// 停止后台清理任务
    async fn shutdown(&self) {}
}

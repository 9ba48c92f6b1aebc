//! 用户 → 会话索引

use std::collections::{HashMap, HashSet};

use mcpgw_common::{SessionId, UserId};

/// 用户到其会话 ID 集合的映射
///
/// 必须与主存储保持一致：创建、用户变更、删除时同步维护。
#[derive(Debug, Clone, Default)]
pub struct UserSessionIndex {
    by_user: HashMap<UserId, HashSet<SessionId>>,
}

impl UserSessionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, user_id: &UserId, session_id: &SessionId) {
        self.by_user
            .entry(user_id.clone())
            .or_default()
            .insert(session_id.clone());
    }

    /// 移除一条记录，用户没有剩余会话时删除该用户条目
    pub fn remove(&mut self, user_id: &UserId, session_id: &SessionId) -> bool {
        let Some(ids) = self.by_user.get_mut(user_id) else {
            return false;
        };
        let removed = ids.remove(session_id);
        if ids.is_empty() {
            self.by_user.remove(user_id);
        }
        removed
    }

    /// 会话从 `from` 用户迁移到 `to` 用户
    pub fn migrate(&mut self, from: &UserId, to: &UserId, session_id: &SessionId) {
        self.remove(from, session_id);
        self.insert(to, session_id);
    }

    pub fn sessions_of(&self, user_id: &UserId) -> Vec<SessionId> {
        self.by_user
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, user_id: &UserId, session_id: &SessionId) -> bool {
        self.by_user
            .get(user_id)
            .is_some_and(|ids| ids.contains(session_id))
    }

    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }
}

//! mcpgw-adapter-memory - 内存会话存储
//!
//! 一把读写锁保护主表与用户索引，锁只在内存变更期间持有。
//! 惰性过期是正确性的依据，周期清理只负责回收内存。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mcpgw_common::{PeriodicTask, SessionId, UserId};
use mcpgw_domain_core::{Expiring, SessionData, SessionPatch, UserSessionIndex};
use mcpgw_errors::{AppError, AppResult};
use mcpgw_ports::SessionStore;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

const BACKEND: &str = "memory";

/// 内存存储选项
#[derive(Debug, Clone)]
pub struct MemoryStoreOptions {
    pub max_sessions_per_user: usize,
    pub cleanup_interval: Duration,
}

impl Default for MemoryStoreOptions {
    fn default() -> Self {
        Self {
            max_sessions_per_user: 5,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<SessionId, SessionData>,
    index: UserSessionIndex,
}

impl Inner {
    /// 先移除索引，再移除记录
    fn remove(&mut self, session_id: &SessionId) -> Option<SessionData> {
        let user_id = self.sessions.get(session_id)?.user_context.user_id.clone();
        self.index.remove(&user_id, session_id);
        self.sessions.remove(session_id)
    }

    fn remove_if_expired(&mut self, session_id: &SessionId, now: DateTime<Utc>) -> bool {
        let expired = self
            .sessions
            .get(session_id)
            .is_some_and(|s| s.is_expired_at(now));
        if expired {
            self.remove(session_id);
        }
        expired
    }

    /// 为新会话腾出位置：用户会话数达到上限时删除最早创建的会话
    fn evict_for(&mut self, user_id: &UserId, cap: usize, now: DateTime<Utc>) -> Vec<SessionId> {
        let mut live: Vec<(DateTime<Utc>, SessionId)> = Vec::new();
        for id in self.index.sessions_of(user_id) {
            if self.remove_if_expired(&id, now) {
                continue;
            }
            if let Some(session) = self.sessions.get(&id) {
                live.push((session.created_at, id));
            }
        }

        live.sort();
        let excess = (live.len() + 1).saturating_sub(cap);
        let evicted: Vec<SessionId> = live.into_iter().take(excess).map(|(_, id)| id).collect();
        for id in &evicted {
            self.remove(id);
        }
        evicted
    }
}

/// 内存会话存储
#[derive(Debug)]
pub struct MemorySessionStore {
    inner: Arc<RwLock<Inner>>,
    options: MemoryStoreOptions,
    sweeper: Mutex<Option<PeriodicTask>>,
}

impl MemorySessionStore {
    /// 创建存储并启动周期清理，必须在 tokio 运行时内调用
    pub fn new(options: MemoryStoreOptions) -> Self {
        let inner = Arc::new(RwLock::new(Inner::default()));

        let sweep_target = inner.clone();
        let sweeper = PeriodicTask::spawn("memory-session-sweep", options.cleanup_interval, move || {
            let inner = sweep_target.clone();
            async move {
                let removed = sweep(&inner, Utc::now());
                if removed > 0 {
                    info!(backend = BACKEND, removed, "Expired sessions swept");
                }
            }
        });

        Self {
            inner,
            options,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    pub fn options(&self) -> &MemoryStoreOptions {
        &self.options
    }
}

/// 删除所有过期会话
///
/// 先在读锁下收集候选，再在写锁下逐个复核删除，读写请求不会被长时间阻塞。
fn sweep(inner: &RwLock<Inner>, now: DateTime<Utc>) -> usize {
    let candidates: Vec<SessionId> = inner
        .read()
        .sessions
        .values()
        .filter(|s| s.is_expired_at(now))
        .map(|s| s.session_id.clone())
        .collect();
    if candidates.is_empty() {
        return 0;
    }

    let mut guard = inner.write();
    let removed = candidates
        .iter()
        .filter(|id| guard.remove_if_expired(id, now))
        .count();
    drop(guard);

    metrics::counter!("sessions_expired_total", "backend" => BACKEND).increment(removed as u64);
    removed
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: SessionData) -> AppResult<SessionId> {
        session.validate()?;
        let session_id = session.session_id.clone();
        let user_id = session.user_context.user_id.clone();

        let evicted = {
            let mut inner = self.inner.write();
            if inner.sessions.contains_key(&session_id) {
                return Err(AppError::validation(format!(
                    "Session {} already exists",
                    session_id
                )));
            }
            let evicted = inner.evict_for(&user_id, self.options.max_sessions_per_user, Utc::now());
            inner.index.insert(&user_id, &session_id);
            inner.sessions.insert(session_id.clone(), session);
            evicted
        };

        for id in &evicted {
            info!(backend = BACKEND, user_id = %user_id, session_id = %id, "Evicted oldest session for user");
        }
        metrics::counter!("sessions_created_total", "backend" => BACKEND).increment(1);
        debug!(backend = BACKEND, session_id = %session_id, user_id = %user_id, "Session created");
        Ok(session_id)
    }

    async fn get(&self, session_id: &SessionId) -> AppResult<Option<SessionData>> {
        let now = Utc::now();
        {
            let inner = self.inner.read();
            match inner.sessions.get(session_id) {
                None => return Ok(None),
                Some(session) if !session.is_expired_at(now) => return Ok(Some(session.clone())),
                Some(_) => {}
            }
        }

        if self.inner.write().remove_if_expired(session_id, now) {
            metrics::counter!("sessions_expired_total", "backend" => BACKEND).increment(1);
            debug!(backend = BACKEND, session_id = %session_id, "Expired session removed on access");
        }
        Ok(None)
    }

    async fn update(&self, session_id: &SessionId, patch: SessionPatch) -> AppResult<()> {
        let now = Utc::now();
        let mut inner = self.inner.write();

        if inner.remove_if_expired(session_id, now) {
            return Err(AppError::not_found(format!("Session {} has expired", session_id)));
        }
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AppError::not_found(format!("Session {} not found", session_id)))?;

        let outcome = patch.apply(session)?;
        if let Some(previous_user) = outcome.previous_user {
            let new_user = session.user_context.user_id.clone();
            inner.index.migrate(&previous_user, &new_user, session_id);
            debug!(
                backend = BACKEND,
                session_id = %session_id,
                from = %previous_user,
                to = %new_user,
                "Session moved to another user"
            );
        }
        Ok(())
    }

    async fn delete(&self, session_id: &SessionId) -> AppResult<()> {
        if self.inner.write().remove(session_id).is_some() {
            metrics::counter!("sessions_deleted_total", "backend" => BACKEND).increment(1);
            debug!(backend = BACKEND, session_id = %session_id, "Session deleted");
        }
        Ok(())
    }

    async fn cleanup(&self) -> AppResult<usize> {
        Ok(sweep(&self.inner, Utc::now()))
    }

    async fn get_user_sessions(&self, user_id: &UserId) -> AppResult<Vec<SessionData>> {
        let now = Utc::now();
        let inner = self.inner.read();
        let mut sessions: Vec<SessionData> = inner
            .index
            .sessions_of(user_id)
            .iter()
            .filter_map(|id| inner.sessions.get(id))
            .filter(|s| !s.is_expired_at(now))
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn session_count(&self) -> AppResult<usize> {
        Ok(self.inner.read().sessions.len())
    }

    async fn delete_user_sessions(&self, user_id: &UserId) -> AppResult<usize> {
        let mut inner = self.inner.write();
        let ids = inner.index.sessions_of(user_id);
        let removed = ids.iter().filter(|id| inner.remove(id).is_some()).count();
        drop(inner);

        metrics::counter!("sessions_deleted_total", "backend" => BACKEND).increment(removed as u64);
        info!(backend = BACKEND, user_id = %user_id, removed, "User sessions deleted");
        Ok(removed)
    }

    async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.shutdown().await;
        }
    }
}

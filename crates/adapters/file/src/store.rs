//! 加密文件会话存储

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mcpgw_common::{PeriodicTask, SessionId, UserId};
use mcpgw_crypto::{CryptoService, is_integrity_failure};
use mcpgw_domain_core::{Expiring, SessionData, SessionPatch, UserSessionIndex};
use mcpgw_errors::{AppError, AppResult};
use mcpgw_ports::SessionStore;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::layout::{self, Entry};

const BACKEND: &str = "file";

/// 文件存储选项
#[derive(Debug, Clone)]
pub struct FileStoreOptions {
    pub max_sessions_per_user: usize,
    pub cleanup_interval: Duration,
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        Self {
            max_sessions_per_user: 5,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// 启动恢复的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub loaded: usize,
    pub expired_removed: usize,
    pub temp_removed: usize,
    pub unreadable: usize,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    user_id: UserId,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl IndexEntry {
    fn of(session: &SessionData) -> Self {
        Self {
            user_id: session.user_context.user_id.clone(),
            created_at: session.created_at,
            expires_at: session.expires_at,
        }
    }
}

/// 内存索引：热路径上的成员查询不需要扫描目录
#[derive(Debug, Default)]
struct Index {
    entries: HashMap<SessionId, IndexEntry>,
    users: UserSessionIndex,
}

impl Index {
    fn insert(&mut self, session_id: SessionId, entry: IndexEntry) {
        self.users.insert(&entry.user_id, &session_id);
        self.entries.insert(session_id, entry);
    }

    fn remove(&mut self, session_id: &SessionId) -> Option<IndexEntry> {
        let entry = self.entries.remove(session_id)?;
        self.users.remove(&entry.user_id, session_id);
        Some(entry)
    }

    fn expired(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        self.entries
            .iter()
            .filter(|(_, e)| now >= e.expires_at)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// 从索引中摘除为新会话腾位置需要删除的会话（过期的和最早的）
    fn evict_for(&mut self, user_id: &UserId, cap: usize, now: DateTime<Utc>) -> Vec<SessionId> {
        let mut evicted = Vec::new();
        let mut live = Vec::new();
        for id in self.users.sessions_of(user_id) {
            match self.entries.get(&id) {
                Some(e) if now >= e.expires_at => evicted.push(id),
                Some(e) => live.push((e.created_at, id)),
                None => {}
            }
        }

        live.sort();
        let excess = (live.len() + 1).saturating_sub(cap);
        evicted.extend(live.into_iter().take(excess).map(|(_, id)| id));
        for id in &evicted {
            self.remove(id);
        }
        evicted
    }
}

/// 加密文件会话存储
#[derive(Debug)]
pub struct FileSessionStore {
    dir: PathBuf,
    crypto: Arc<CryptoService>,
    index: Arc<RwLock<Index>>,
    options: FileStoreOptions,
    /// 串行化 update 的 读取 → 合并 → 写入 → 更新索引，避免并发更新互相覆盖
    update_lock: tokio::sync::Mutex<()>,
    sweeper: Mutex<Option<PeriodicTask>>,
}

impl FileSessionStore {
    /// 打开存储目录，重建索引并启动周期清理
    ///
    /// 遗留的临时文件被删除；过期的会话文件被删除；
    /// 无法解密或校验失败的文件记录错误日志后跳过，保留原文件以便排查。
    pub async fn open(
        dir: impl Into<PathBuf>,
        crypto: Arc<CryptoService>,
        options: FileStoreOptions,
    ) -> AppResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| layout::io_error("create directory", &dir, e))?;

        let (index, report) = rebuild_index(&dir, &crypto).await?;
        info!(
            backend = BACKEND,
            dir = %dir.display(),
            loaded = report.loaded,
            expired_removed = report.expired_removed,
            temp_removed = report.temp_removed,
            unreadable = report.unreadable,
            "Session store recovered"
        );

        let index = Arc::new(RwLock::new(index));
        let sweeper = spawn_sweeper(dir.clone(), index.clone(), options.cleanup_interval);

        Ok(Self {
            dir,
            crypto,
            index,
            options,
            update_lock: tokio::sync::Mutex::new(()),
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_session(&self, session_id: &SessionId) -> AppResult<Option<SessionData>> {
        let Some(contents) = layout::read(&self.dir, session_id).await? else {
            return Ok(None);
        };
        let session: SessionData = self.crypto.decrypt_json(&contents).map_err(|e| {
            if is_integrity_failure(&e) {
                error!(
                    backend = BACKEND,
                    session_id = %session_id,
                    "Session file failed integrity check"
                );
                metrics::counter!("session_integrity_failures_total").increment(1);
            }
            e.with_metadata("sessionId", session_id.to_string())
        })?;

        if session.session_id != *session_id {
            return Err(AppError::storage(format!(
                "Session file {} contains session {}",
                session_id, session.session_id
            )));
        }
        Ok(Some(session))
    }

    async fn write_session(&self, session: &SessionData) -> AppResult<()> {
        let contents = self.crypto.encrypt_json(session)?;
        layout::write_atomic(&self.dir, &session.session_id, &contents).await
    }

    /// 先摘除索引，再删除文件
    async fn remove_session(&self, session_id: &SessionId) -> AppResult<bool> {
        let indexed = self.index.write().remove(session_id).is_some();
        let removed = layout::remove(&layout::session_path(&self.dir, session_id)).await?;
        Ok(indexed || removed)
    }

    async fn remove_files(&self, ids: &[SessionId]) -> AppResult<()> {
        for id in ids {
            layout::remove(&layout::session_path(&self.dir, id)).await?;
        }
        Ok(())
    }
}

async fn rebuild_index(dir: &Path, crypto: &CryptoService) -> AppResult<(Index, RecoveryReport)> {
    let mut index = Index::default();
    let mut report = RecoveryReport::default();
    let now = Utc::now();

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| layout::io_error("scan", dir, e))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| layout::io_error("scan", dir, e))?
    {
        let path = entry.path();
        match layout::classify(&path) {
            Entry::Other => {}
            Entry::Temp => {
                warn!(backend = BACKEND, path = %path.display(), "Removing incomplete write");
                layout::remove(&path).await?;
                report.temp_removed += 1;
            }
            Entry::Session(session_id) => {
                let contents = match tokio::fs::read_to_string(&path).await {
                    Ok(contents) => contents,
                    Err(e) => {
                        error!(backend = BACKEND, path = %path.display(), error = %e, "Unreadable session file");
                        report.unreadable += 1;
                        continue;
                    }
                };
                let session = match crypto.decrypt_json::<SessionData>(&contents) {
                    Ok(session) if session.session_id == session_id => session,
                    Ok(session) => {
                        error!(
                            backend = BACKEND,
                            path = %path.display(),
                            contained = %session.session_id,
                            "Session file name does not match its contents"
                        );
                        report.unreadable += 1;
                        continue;
                    }
                    Err(e) => {
                        error!(
                            backend = BACKEND,
                            path = %path.display(),
                            integrity = is_integrity_failure(&e),
                            error = %e,
                            "Session file could not be decrypted, leaving it out of the index"
                        );
                        report.unreadable += 1;
                        continue;
                    }
                };

                if session.is_expired_at(now) {
                    layout::remove(&path).await?;
                    report.expired_removed += 1;
                    continue;
                }
                index.insert(session_id, IndexEntry::of(&session));
                report.loaded += 1;
            }
        }
    }

    Ok((index, report))
}

fn spawn_sweeper(dir: PathBuf, index: Arc<RwLock<Index>>, period: Duration) -> PeriodicTask {
    PeriodicTask::spawn("file-session-sweep", period, move || {
        let dir = dir.clone();
        let index = index.clone();
        async move {
            match sweep(&dir, &index, Utc::now()).await {
                Ok(0) => {}
                Ok(removed) => info!(backend = BACKEND, removed, "Expired sessions swept"),
                Err(e) => warn!(backend = BACKEND, error = %e, "Session sweep failed"),
            }
        }
    })
}

/// 删除所有过期会话：先从索引摘除，再删除文件
async fn sweep(dir: &Path, index: &RwLock<Index>, now: DateTime<Utc>) -> AppResult<usize> {
    let expired: Vec<SessionId> = {
        let mut index = index.write();
        index
            .expired(now)
            .into_iter()
            .filter(|id| index.remove(id).is_some())
            .collect()
    };

    for id in &expired {
        layout::remove(&layout::session_path(dir, id)).await?;
    }
    metrics::counter!("sessions_expired_total", "backend" => BACKEND).increment(expired.len() as u64);
    Ok(expired.len())
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create(&self, session: SessionData) -> AppResult<SessionId> {
        session.validate()?;
        let session_id = session.session_id.clone();
        let user_id = session.user_context.user_id.clone();

        if self.index.read().entries.contains_key(&session_id) {
            return Err(AppError::validation(format!(
                "Session {} already exists",
                session_id
            )));
        }

        self.write_session(&session).await?;

        let evicted = {
            let mut index = self.index.write();
            let evicted = index.evict_for(&user_id, self.options.max_sessions_per_user, Utc::now());
            index.insert(session_id.clone(), IndexEntry::of(&session));
            evicted
        };
        self.remove_files(&evicted).await?;

        for id in &evicted {
            info!(backend = BACKEND, user_id = %user_id, session_id = %id, "Evicted session for user");
        }
        metrics::counter!("sessions_created_total", "backend" => BACKEND).increment(1);
        debug!(backend = BACKEND, session_id = %session_id, user_id = %user_id, "Session created");
        Ok(session_id)
    }

    async fn get(&self, session_id: &SessionId) -> AppResult<Option<SessionData>> {
        let now = Utc::now();
        let expired = match self.index.read().entries.get(session_id) {
            None => return Ok(None),
            Some(entry) => now >= entry.expires_at,
        };

        if !expired {
            match self.read_session(session_id).await? {
                Some(session) if !session.is_expired_at(now) => return Ok(Some(session)),
                Some(_) => {}
                None => {
                    // 文件已被删除：与索引对齐
                    self.index.write().remove(session_id);
                    return Ok(None);
                }
            }
        }

        self.remove_session(session_id).await?;
        metrics::counter!("sessions_expired_total", "backend" => BACKEND).increment(1);
        debug!(backend = BACKEND, session_id = %session_id, "Expired session removed on access");
        Ok(None)
    }

    async fn update(&self, session_id: &SessionId, patch: SessionPatch) -> AppResult<()> {
        let _guard = self.update_lock.lock().await;

        let Some(mut session) = self.get(session_id).await? else {
            return Err(AppError::not_found(format!("Session {} not found", session_id)));
        };

        let outcome = patch.apply(&mut session)?;
        self.write_session(&session).await?;

        let still_indexed = {
            let mut index = self.index.write();
            if index.entries.contains_key(session_id) {
                index.remove(session_id);
                index.insert(session_id.clone(), IndexEntry::of(&session));
                true
            } else {
                false
            }
        };

        if !still_indexed {
            // 更新期间会话被并发删除：不能让写入把它复活
            layout::remove(&layout::session_path(&self.dir, session_id)).await?;
            return Err(AppError::not_found(format!(
                "Session {} was deleted during update",
                session_id
            )));
        }

        if let Some(previous_user) = outcome.previous_user {
            debug!(
                backend = BACKEND,
                session_id = %session_id,
                from = %previous_user,
                to = %session.user_context.user_id,
                "Session moved to another user"
            );
        }
        Ok(())
    }

    async fn delete(&self, session_id: &SessionId) -> AppResult<()> {
        if self.remove_session(session_id).await? {
            metrics::counter!("sessions_deleted_total", "backend" => BACKEND).increment(1);
            debug!(backend = BACKEND, session_id = %session_id, "Session deleted");
        }
        Ok(())
    }

    async fn cleanup(&self) -> AppResult<usize> {
        sweep(&self.dir, &self.index, Utc::now()).await
    }

    async fn get_user_sessions(&self, user_id: &UserId) -> AppResult<Vec<SessionData>> {
        let now = Utc::now();
        let ids: Vec<SessionId> = {
            let index = self.index.read();
            index
                .users
                .sessions_of(user_id)
                .into_iter()
                .filter(|id| index.entries.get(id).is_some_and(|e| now < e.expires_at))
                .collect()
        };

        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = self.read_session(&id).await? {
                if !session.is_expired_at(now) {
                    sessions.push(session);
                }
            }
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn session_count(&self) -> AppResult<usize> {
        Ok(self.index.read().entries.len())
    }

    async fn delete_user_sessions(&self, user_id: &UserId) -> AppResult<usize> {
        let removed: Vec<SessionId> = {
            let mut index = self.index.write();
            index
                .users
                .sessions_of(user_id)
                .into_iter()
                .filter(|id| index.remove(id).is_some())
                .collect()
        };
        self.remove_files(&removed).await?;

        metrics::counter!("sessions_deleted_total", "backend" => BACKEND).increment(removed.len() as u64);
        info!(backend = BACKEND, user_id = %user_id, removed = removed.len(), "User sessions deleted");
        Ok(removed.len())
    }

    async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.shutdown().await;
        }
    }
}

//! 目录布局与原子写入
//!
//! 每个会话一个文件：`{session_id}.session`。
//! 写入先落到 `{session_id}.session.{nonce}.tmp`，fsync 后 rename 覆盖正式文件。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use mcpgw_common::SessionId;
use mcpgw_errors::{AppError, AppResult};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub const SESSION_EXTENSION: &str = "session";
pub const TMP_EXTENSION: &str = "tmp";

/// 目录中一个条目的类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// 已提交的会话文件
    Session(SessionId),
    /// 未完成写入留下的临时文件
    Temp,
    /// 其它文件，忽略
    Other,
}

pub fn classify(path: &Path) -> Entry {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Entry::Other;
    };
    if name.ends_with(&format!(".{}", TMP_EXTENSION)) {
        return Entry::Temp;
    }
    match name.strip_suffix(&format!(".{}", SESSION_EXTENSION)) {
        Some(stem) => SessionId::parse(stem).map_or(Entry::Other, Entry::Session),
        None => Entry::Other,
    }
}

pub fn session_path(dir: &Path, session_id: &SessionId) -> PathBuf {
    dir.join(format!("{}.{}", session_id, SESSION_EXTENSION))
}

fn temp_path(dir: &Path, session_id: &SessionId) -> PathBuf {
    dir.join(format!(
        "{}.{}.{}.{}",
        session_id,
        SESSION_EXTENSION,
        Uuid::new_v4().simple(),
        TMP_EXTENSION
    ))
}

pub fn io_error(action: &str, path: &Path, e: std::io::Error) -> AppError {
    AppError::storage(format!("Failed to {} {}: {}", action, path.display(), e)).with_source(e)
}

/// 原子写入：读者要么看到旧版本，要么看到完整的新版本
pub async fn write_atomic(dir: &Path, session_id: &SessionId, contents: &str) -> AppResult<()> {
    let final_path = session_path(dir, session_id);
    let tmp_path = temp_path(dir, session_id);

    let result = async {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options
            .open(&tmp_path)
            .await
            .map_err(|e| io_error("create", &tmp_path, e))?;
        file.write_all(contents.as_bytes())
            .await
            .map_err(|e| io_error("write", &tmp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| io_error("sync", &tmp_path, e))?;
        drop(file);

        // Atomic rename
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| io_error("rename", &tmp_path, e))
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
    result
}

/// 读取会话文件，文件不存在时返回 `None`
pub async fn read(dir: &Path, session_id: &SessionId) -> AppResult<Option<String>> {
    let path = session_path(dir, session_id);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error("read", &path, e)),
    }
}

/// 删除文件，不存在视为已删除
pub async fn remove(path: &Path) -> AppResult<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error("remove", path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_entries() {
        let id = SessionId::new();
        let dir = Path::new("/data");

        assert_eq!(classify(&session_path(dir, &id)), Entry::Session(id.clone()));
        assert_eq!(classify(&temp_path(dir, &id)), Entry::Temp);
        assert_eq!(classify(Path::new("/data/notes.txt")), Entry::Other);
        assert_eq!(classify(Path::new("/data/bad id!.session")), Entry::Other);
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let id = SessionId::new();

        write_atomic(dir.path(), &id, "first").await.unwrap();
        write_atomic(dir.path(), &id, "second").await.unwrap();
        assert_eq!(read(dir.path(), &id).await.unwrap().as_deref(), Some("second"));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| classify(&e.path()) == Entry::Temp)
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let id = SessionId::new();
        assert!(read(dir.path(), &id).await.unwrap().is_none());
        assert!(!remove(&session_path(dir.path(), &id)).await.unwrap());
    }
}

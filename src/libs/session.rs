//! Ownership of the single active working copy.
//!
//! An upload is written to a fresh file under the scratch directory, opened
//! and checked, and only then swapped in as the current session. The session
//! it replaces is retired: its pool is closed and its file removed. Every
//! operation goes through [`SessionStore::checkout`], which holds the working
//! copy's lock for as long as the returned guard lives.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::libs::catalog::SchemaCatalog;
use crate::libs::config::EngineConfig;
use crate::libs::error::{Result, TablesmithError};

/// Every database file in the supported format starts with these bytes.
pub const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(Uuid);

impl SessionHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub handle: SessionHandle,
    pub created_at: SystemTime,
}

/// The private, mutable duplicate of an upload.
pub struct WorkingCopy {
    handle: SessionHandle,
    path: PathBuf,
    pool: SqlitePool,
    last_used: Instant,
    retired: bool,
}

impl WorkingCopy {
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// A verified working copy that is not yet the current session.
pub struct StagedSession {
    handle: SessionHandle,
    path: PathBuf,
    pool: SqlitePool,
    size: usize,
}

impl StagedSession {
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes the pool and deletes the file.
    pub async fn discard(self) {
        self.pool.close().await;
        remove_files(&self.path).await;
    }
}

struct Session {
    handle: SessionHandle,
    created_at: SystemTime,
    copy: Arc<Mutex<WorkingCopy>>,
}

pub struct SessionStore {
    config: EngineConfig,
    current: RwLock<Option<Arc<Session>>>,
}

impl SessionStore {
    pub fn new(config: EngineConfig) -> Self {
        Self { config, current: RwLock::new(None) }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Installs `bytes` as the new current session.
    ///
    /// On any failure the previous session, if there is one, is left as it
    /// was.
    pub async fn create(&self, bytes: &[u8]) -> Result<SessionHandle> {
        let staged = self.stage(bytes).await?;
        Ok(self.commit(staged).await)
    }

    /// Writes `bytes` to a fresh working copy and opens it, without touching
    /// the current session. The result is either committed or discarded.
    pub async fn stage(&self, bytes: &[u8]) -> Result<StagedSession> {
        if bytes.is_empty() {
            return Err(TablesmithError::CorruptUpload("file is empty".into()));
        }
        if bytes.len() > self.config.max_upload_bytes {
            return Err(TablesmithError::CorruptUpload(format!(
                "file is {} bytes, the limit is {}",
                bytes.len(),
                self.config.max_upload_bytes
            )));
        }
        if !bytes.starts_with(SQLITE_HEADER) {
            return Err(TablesmithError::CorruptUpload("missing database header".into()));
        }

        tokio::fs::create_dir_all(&self.config.scratch_dir).await?;
        let handle = SessionHandle::new();
        let path = self.config.scratch_dir.join(format!("{handle}.db"));
        write_working_copy(&path, bytes).await?;

        let pool = match open_verified(&path, &self.config).await {
            Ok(pool) => pool,
            Err(err) => {
                remove_files(&path).await;
                return Err(err);
            }
        };
        Ok(StagedSession { handle, path, pool, size: bytes.len() })
    }

    /// Makes `staged` the current session and retires the one it replaces.
    pub async fn commit(&self, staged: StagedSession) -> SessionHandle {
        let StagedSession { handle, path, pool, size } = staged;
        let session = Arc::new(Session {
            handle,
            created_at: SystemTime::now(),
            copy: Arc::new(Mutex::new(WorkingCopy {
                handle,
                path,
                pool,
                last_used: Instant::now(),
                retired: false,
            })),
        });

        let previous = self.current.write().await.replace(session);
        info!(session = %handle, bytes = size, "working copy created");
        if let Some(previous) = previous {
            info!(session = %previous.handle, "superseded by new upload");
            retire(previous).await;
        }
        handle
    }

    pub async fn current_handle(&self) -> Result<SessionHandle> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|s| s.handle)
            .ok_or(TablesmithError::NoActiveSession)
    }

    pub async fn current_info(&self) -> Option<SessionInfo> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|s| SessionInfo { handle: s.handle, created_at: s.created_at })
    }

    /// Locks the working copy behind `handle`.
    ///
    /// Fails with `NoActiveSession` when `handle` is not the current session,
    /// including when it was replaced while the caller waited for the lock.
    pub async fn checkout(&self, handle: SessionHandle) -> Result<OwnedMutexGuard<WorkingCopy>> {
        let copy = {
            let current = self.current.read().await;
            match current.as_ref() {
                Some(session) if session.handle == handle => Arc::clone(&session.copy),
                _ => return Err(TablesmithError::NoActiveSession),
            }
        };
        let mut guard = copy.lock_owned().await;
        if guard.retired {
            return Err(TablesmithError::NoActiveSession);
        }
        guard.last_used = Instant::now();
        Ok(guard)
    }

    /// Current bytes of the working copy, exactly as stored.
    pub async fn export(&self, handle: SessionHandle) -> Result<Vec<u8>> {
        let copy = self.checkout(handle).await?;
        let bytes = tokio::fs::read(copy.path()).await?;
        info!(session = %handle, bytes = bytes.len(), "working copy exported");
        Ok(bytes)
    }

    /// Retires the current session if it has been idle for longer than the
    /// configured TTL. A session that is locked by an operation is never
    /// idle.
    pub async fn expire_idle(&self) -> Option<SessionHandle> {
        let mut current = self.current.write().await;
        let idle = match current.as_ref() {
            Some(session) => match session.copy.try_lock() {
                Ok(copy) => copy.last_used.elapsed() >= self.config.session_idle_ttl,
                Err(_) => false,
            },
            None => false,
        };
        if !idle {
            return None;
        }
        let session = current.take()?;
        drop(current);

        let handle = session.handle;
        info!(session = %handle, "session expired");
        retire(session).await;
        Some(handle)
    }

    /// Retires the current session, if any.
    pub async fn close(&self) {
        let session = self.current.write().await.take();
        if let Some(session) = session {
            info!(session = %session.handle, "session closed");
            retire(session).await;
        }
    }
}

async fn open_verified(path: &Path, config: &EngineConfig) -> Result<SqlitePool> {
    // Rollback journal keeps every committed change in the main file, so an
    // export is a plain read of that file.
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(false)
        .journal_mode(SqliteJournalMode::Delete)
        .foreign_keys(config.enforce_foreign_keys)
        .busy_timeout(config.busy_timeout);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| TablesmithError::CorruptUpload(e.to_string()))?;

    if let Err(err) = verify(&pool).await {
        pool.close().await;
        return Err(err);
    }
    Ok(pool)
}

async fn verify(pool: &SqlitePool) -> Result<()> {
    let status = sqlx::query_scalar::<_, String>("PRAGMA quick_check")
        .fetch_one(pool)
        .await
        .map_err(|e| TablesmithError::CorruptUpload(e.to_string()))?;
    if status != "ok" {
        return Err(TablesmithError::CorruptUpload(status));
    }
    pool.introspect().await.map_err(|e| match e {
        TablesmithError::StorageUnreadable(msg) => TablesmithError::CorruptUpload(msg),
        other => other,
    })?;
    Ok(())
}

async fn retire(session: Arc<Session>) {
    let mut copy = session.copy.lock().await;
    copy.retired = true;
    copy.pool.close().await;
    remove_files(&copy.path).await;
}

/// Writes the upload, removing whatever part of it reached the disk if the
/// write fails.
async fn write_working_copy(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Err(err) = tokio::fs::write(path, bytes).await {
        remove_files(path).await;
        return Err(err.into());
    }
    Ok(())
}

async fn remove_files(path: &Path) {
    let mut journal = OsString::from(path.as_os_str());
    journal.push("-journal");
    for candidate in [path.to_path_buf(), PathBuf::from(journal)] {
        match tokio::fs::remove_file(&candidate).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %candidate.display(), error = %e, "failed to remove working copy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> SessionStore {
        SessionStore::new(EngineConfig::default().with_scratch_dir(dir))
    }

    #[tokio::test]
    async fn rejects_bad_uploads_without_a_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let empty = store.create(&[]).await.unwrap_err();
        assert!(matches!(empty, TablesmithError::CorruptUpload(_)));
        let text = store.create(b"name,age\nEve,3\n").await.unwrap_err();
        assert!(matches!(text, TablesmithError::CorruptUpload(_)));

        let mut truncated = SQLITE_HEADER.to_vec();
        truncated.extend_from_slice(&[0u8; 84]);
        assert!(store.create(&truncated).await.is_err());

        assert!(matches!(store.current_handle().await, Err(TablesmithError::NoActiveSession)));
        assert!(store.current_info().await.is_none());
    }

    #[tokio::test]
    async fn failed_writes_leave_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let path = blocker.join("copy.db");

        let err = write_working_copy(&path, SQLITE_HEADER).await.unwrap_err();
        assert!(matches!(err, TablesmithError::Io(_)));
        assert!(!path.exists());
        assert_eq!(std::fs::read(&blocker).unwrap(), b"x");
    }

    #[tokio::test]
    async fn discarded_stages_leave_the_current_session_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let source = dir.path().join("source.db");
        let options = SqliteConnectOptions::new().filename(&source).create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await.unwrap();
        sqlx::query("CREATE TABLE t (v TEXT)").execute(&pool).await.unwrap();
        pool.close().await;
        let bytes = std::fs::read(&source).unwrap();

        let first = store.create(&bytes).await.unwrap();
        let staged = store.stage(&bytes).await.unwrap();
        let staged_path = dir.path().join(format!("{}.db", staged.handle()));
        assert!(staged_path.exists());
        staged.discard().await;

        assert!(!staged_path.exists());
        assert_eq!(store.current_handle().await.unwrap(), first);
        assert!(store.checkout(first).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_handles_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let stray = SessionHandle::new();
        assert!(matches!(store.checkout(stray).await, Err(TablesmithError::NoActiveSession)));
        assert!(matches!(store.export(stray).await, Err(TablesmithError::NoActiveSession)));
        assert!(store.expire_idle().await.is_none());
    }
}

//! Durable backlog of records awaiting confirmed delivery.

pub mod file;
pub mod sqlite;

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use thiserror::Error;
use tokio::sync::Mutex;

use crate::{record::LogRecord, types::RowCount};

/// Failure of a backlog operation.
#[derive(Debug, Error)]
pub enum BacklogError {
    /// Filesystem failure.
    #[error("backlog i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// SQLite failure.
    #[error("backlog sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Entry could not be encoded.
    #[error("backlog encoding error: {0}")]
    Serde(#[from] serde_json::Error),
    /// The backlog has been closed.
    #[error("backlog is closed")]
    Closed,
    /// Anything else, e.g. a failed blocking task.
    #[error("{0}")]
    Message(String),
}

/// Result alias for backlog operations.
pub type BacklogResult<T> = Result<T, BacklogError>;

/// Durable, ordered store of pending records.
///
/// Every mutation is durable before it returns `Ok`.
pub trait Backlog: Send {
    /// Appends `record`. Identical payloads may be stored more than once.
    fn add(&mut self, record: &LogRecord) -> BacklogResult<()>;

    /// Removes every entry equal to `record` and returns how many went.
    /// Removing an absent record returns `Ok(0)`.
    fn remove(&mut self, record: &LogRecord) -> BacklogResult<RowCount>;

    /// Current contents in stable (insertion) order.
    fn list(&self) -> BacklogResult<Vec<LogRecord>>;

    /// Number of stored entries.
    fn len(&self) -> BacklogResult<usize> {
        Ok(self.list()?.len())
    }

    /// True when nothing is pending.
    fn is_empty(&self) -> BacklogResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Releases the underlying storage. Later calls fail with [`BacklogError::Closed`].
    fn close(&mut self) -> BacklogResult<()>;
}

/// Backlog handle shared between the runtime stages.
pub type SharedBacklog = Arc<Mutex<Box<dyn Backlog>>>;

/// Wraps a backlog for use by the runtime.
pub fn shared(backlog: Box<dyn Backlog>) -> SharedBacklog {
    Arc::new(Mutex::new(backlog))
}

/// Runs `f` against the shared backlog on the blocking pool.
pub async fn run_blocking<T, F>(backlog: &SharedBacklog, f: F) -> BacklogResult<T>
where
    F: FnOnce(&mut Box<dyn Backlog>) -> BacklogResult<T> + Send + 'static,
    T: Send + 'static,
{
    let backlog = Arc::clone(backlog);
    tokio::task::spawn_blocking(move || {
        let mut guard = backlog.blocking_lock();
        f(&mut guard)
    })
    .await
    .map_err(|e| BacklogError::Message(format!("join error: {e}")))?
}

/// Storage variant behind a backlog path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogKind {
    /// Append-only text log, see [`file::FileBacklog`].
    File,
    /// Embedded table, see [`sqlite::SqliteBacklog`].
    Sqlite,
}

impl BacklogKind {
    /// Picks a variant from the file extension: ADIF-ish text names get
    /// [`BacklogKind::File`], anything else [`BacklogKind::Sqlite`].
    pub fn infer(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext)
                if ext.eq_ignore_ascii_case("adi")
                    || ext.eq_ignore_ascii_case("adif")
                    || ext.eq_ignore_ascii_case("log") =>
            {
                Self::File
            }
            _ => Self::Sqlite,
        }
    }
}

impl FromStr for BacklogKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            other => Err(format!("unknown backlog kind `{other}`")),
        }
    }
}

impl fmt::Display for BacklogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => f.write_str("file"),
            Self::Sqlite => f.write_str("sqlite"),
        }
    }
}

/// Opens (creating if needed) the backlog of `kind` at `path`.
pub fn open_backlog(kind: BacklogKind, path: impl AsRef<Path>) -> BacklogResult<Box<dyn Backlog>> {
    let path = path.as_ref();
    Ok(match kind {
        BacklogKind::File => Box::new(file::FileBacklog::open(path)?),
        BacklogKind::Sqlite => Box::new(sqlite::SqliteBacklog::open(path)?),
    })
}

/// Creates the parent directories of `path`.
pub(crate) fn ensure_parent(path: &Path) -> BacklogResult<PathBuf> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(path.to_path_buf())
}

//! SQLite-backed backlog table.

use std::path::Path;

use rusqlite::{Connection, params};
use tracing::{debug, info};

use crate::{record::LogRecord, types::RowCount};

use super::{Backlog, BacklogError, BacklogResult, ensure_parent};

/// SQLite implementation of [`crate::backlog::Backlog`].
///
/// Uses the single-column `entries` table of earlier releases, so an existing
/// store opens unchanged. Order follows `rowid`, which tracks insertion order.
pub struct SqliteBacklog {
    conn: Option<Connection>,
}

impl SqliteBacklog {
    /// Opens or creates a SQLite backlog at `path`, creating parent directories.
    ///
    /// Enables WAL mode and sets `synchronous=FULL` so a committed insert
    /// survives power loss.
    pub fn open(path: impl AsRef<Path>) -> BacklogResult<Self> {
        let path = ensure_parent(path.as_ref())?;
        let conn = Connection::open(&path)?;
        let backlog = Self::init_connection(conn)?;
        info!(path = %path.display(), pending = backlog.len()?, "opened sqlite backlog");
        Ok(backlog)
    }

    /// Opens an in-memory backlog.
    pub fn open_in_memory() -> BacklogResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> BacklogResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Ok(Self { conn: Some(conn) })
    }

    fn conn(&self) -> BacklogResult<&Connection> {
        self.conn.as_ref().ok_or(BacklogError::Closed)
    }
}

impl Backlog for SqliteBacklog {
    fn add(&mut self, record: &LogRecord) -> BacklogResult<()> {
        self.conn()?.execute(
            "INSERT INTO entries(adif) VALUES (?1)",
            params![record.payload()],
        )?;
        Ok(())
    }

    fn remove(&mut self, record: &LogRecord) -> BacklogResult<RowCount> {
        let removed = self
            .conn()?
            .execute("DELETE FROM entries WHERE adif = ?1", params![record.payload()])?;
        debug!(removed, "purged backlog rows");
        Ok(removed)
    }

    fn list(&self) -> BacklogResult<Vec<LogRecord>> {
        let mut stmt = self
            .conn()?
            .prepare("SELECT adif FROM entries WHERE adif IS NOT NULL ORDER BY rowid ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(LogRecord::new(row?));
        }
        Ok(out)
    }

    fn len(&self) -> BacklogResult<usize> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM entries WHERE adif IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn close(&mut self) -> BacklogResult<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, err)| BacklogError::Sqlite(err))
    }
}

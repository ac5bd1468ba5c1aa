//! Append-log file backlog.
//!
//! Each entry is one line holding a JSON envelope, so records containing
//! newlines round-trip exactly. Files written by earlier releases, where a
//! record starts on a line beginning `<adif_ver` and continues on the
//! following lines, are still readable; continuation lines are concatenated
//! without a separator, as the earlier releases loaded them. The first
//! rewrite converts the file.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{record::LogRecord, types::RowCount};

use super::{Backlog, BacklogError, BacklogResult, ensure_parent};

/// Version number for serialized [`EntryEnvelope`] lines.
const ENTRY_FORMAT_VERSION: u16 = 1;

const LEGACY_RECORD_START: &str = "<adif_ver";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryEnvelope {
    format_version: u16,
    adif: String,
}

/// File implementation of [`crate::backlog::Backlog`].
///
/// Contents are cached in memory; the file is appended on `add` and
/// atomically replaced on `remove`.
pub struct FileBacklog {
    path: PathBuf,
    file: Option<File>,
    committed_len: u64,
    entries: Vec<LogRecord>,
    closed: bool,
}

impl FileBacklog {
    /// Opens or creates the backlog file at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> BacklogResult<Self> {
        let path = ensure_parent(path.as_ref())?;
        let mut file = open_append(&path)?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        let entries = parse_entries(&String::from_utf8_lossy(&raw));

        // Appends must start on a fresh line.
        let mut committed_len = raw.len() as u64;
        if let Some(start) = torn_tail(&raw) {
            file.set_len(start as u64)?;
            file.sync_data()?;
            committed_len = start as u64;
            info!(dropped = raw.len() - start, "truncated torn backlog tail");
        } else if !raw.is_empty() && !raw.ends_with(b"\n") {
            file.write_all(b"\n")?;
            file.sync_data()?;
            committed_len += 1;
        }

        info!(path = %path.display(), pending = entries.len(), "opened file backlog");
        Ok(Self {
            path,
            file: Some(file),
            committed_len,
            entries,
            closed: false,
        })
    }

    /// Location of the backlog file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn handle(&mut self) -> BacklogResult<&mut File> {
        if self.closed {
            return Err(BacklogError::Closed);
        }
        if self.file.is_none() {
            let file = open_append(&self.path)?;
            self.committed_len = file.metadata()?.len();
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| BacklogError::Message("backlog file unavailable".to_string()))
    }

    fn rewrite(&mut self, keep: &[LogRecord]) -> BacklogResult<()> {
        let tmp = tmp_path(&self.path);
        let mut body = String::new();
        for record in keep {
            body.push_str(&encode_line(record)?);
        }

        {
            let mut out = File::create(&tmp)?;
            out.write_all(body.as_bytes())?;
            out.sync_all()?;
        }

        // The old handle points at the replaced inode after the rename.
        self.file = None;
        std::fs::rename(&tmp, &self.path)?;
        sync_parent(&self.path);

        self.file = Some(open_append(&self.path)?);
        self.committed_len = body.len() as u64;
        Ok(())
    }
}

impl Backlog for FileBacklog {
    fn add(&mut self, record: &LogRecord) -> BacklogResult<()> {
        let line = encode_line(record)?;
        let committed_len = self.committed_len;
        let file = self.handle()?;

        let written = file
            .write_all(line.as_bytes())
            .and_then(|()| file.sync_data());
        if let Err(err) = written {
            // Drop any partial line so later appends stay parseable.
            if let Err(trim) = file.set_len(committed_len) {
                error!(error = %trim, "could not trim partial backlog write");
            }
            return Err(err.into());
        }

        self.committed_len += line.len() as u64;
        self.entries.push(record.clone());
        Ok(())
    }

    fn remove(&mut self, record: &LogRecord) -> BacklogResult<RowCount> {
        if self.closed {
            return Err(BacklogError::Closed);
        }
        let keep: Vec<LogRecord> = self
            .entries
            .iter()
            .filter(|e| *e != record)
            .cloned()
            .collect();
        let removed = self.entries.len() - keep.len();
        if removed == 0 {
            return Ok(0);
        }

        self.rewrite(&keep)?;
        self.entries = keep;
        debug!(removed, "purged backlog entries");
        Ok(removed)
    }

    fn list(&self) -> BacklogResult<Vec<LogRecord>> {
        if self.closed {
            return Err(BacklogError::Closed);
        }
        Ok(self.entries.clone())
    }

    fn len(&self) -> BacklogResult<usize> {
        if self.closed {
            return Err(BacklogError::Closed);
        }
        Ok(self.entries.len())
    }

    fn close(&mut self) -> BacklogResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.entries.clear();
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn sync_parent(path: &Path) {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return;
    };
    if let Err(err) = File::open(parent).and_then(|d| d.sync_all()) {
        debug!(error = %err, "directory sync not supported");
    }
}

fn encode_line(record: &LogRecord) -> BacklogResult<String> {
    let env = EntryEnvelope {
        format_version: ENTRY_FORMAT_VERSION,
        adif: record.payload().to_string(),
    };
    let mut line = serde_json::to_string(&env)?;
    line.push('\n');
    Ok(line)
}

fn parse_entries(raw: &str) -> Vec<LogRecord> {
    let lines: Vec<&str> = raw.split('\n').collect();
    let last = lines.len().saturating_sub(1);
    let mut out = Vec::new();
    let mut legacy: Option<String> = None;

    for (idx, line) in lines.iter().enumerate() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }

        if line.starts_with('{') {
            if let Some(rec) = legacy.take() {
                out.push(LogRecord::new(rec));
            }
            match decode_line(line) {
                Ok(record) => out.push(record),
                Err(err) if idx == last => {
                    warn!(error = %err, "skipping torn final backlog line");
                }
                Err(err) => {
                    error!(error = %err, line, "skipping unreadable backlog line");
                }
            }
            continue;
        }

        if line.starts_with(LEGACY_RECORD_START) {
            if let Some(rec) = legacy.replace(line.to_string()) {
                out.push(LogRecord::new(rec));
            }
        } else if let Some(rec) = legacy.as_mut() {
            rec.push_str(line);
        } else {
            warn!(line, "skipping backlog text outside any record");
        }
    }

    if let Some(rec) = legacy {
        out.push(LogRecord::new(rec));
    }
    out
}

/// Offset of an unterminated, undecodable envelope at the end of `raw`.
fn torn_tail(raw: &[u8]) -> Option<usize> {
    let start = raw.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
    let tail = &raw[start..];
    let torn = tail.first() == Some(&b'{') && decode_line(&String::from_utf8_lossy(tail)).is_err();
    torn.then_some(start)
}

fn decode_line(line: &str) -> Result<LogRecord, String> {
    let env: EntryEnvelope =
        serde_json::from_str(line).map_err(|e| format!("entry decode failed: {e}"))?;
    if env.format_version != ENTRY_FORMAT_VERSION {
        return Err(format!(
            "unsupported entry format version: {}",
            env.format_version
        ));
    }
    Ok(LogRecord::new(env.adif))
}

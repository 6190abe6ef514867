// Append-only log of relayed chat and private messages.
//
// The log is an ordered `Vec<ChatLogEntry>` in memory, mirrored to disk as a
// single JSON array. Every `append` rewrites the whole snapshot (to a
// temporary file, then renamed over the old one) so the file on disk is
// always a complete, ordered copy of the log. Cost is O(n) per entry, fine
// for the chat volumes one relay sees.
//
// Persistence is best-effort: a failed save is logged and the entry stays in
// memory. At startup a missing file means an empty log and a corrupt one is
// logged and replaced on the next save; only other I/O errors (permissions,
// path is a directory) stop the relay from starting.
//
// The log has its own mutex, separate from the registry's, and the router
// appends only after delivery, so a slow disk never delays messages.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ChatLogError;
use crate::session::SessionId;

/// One relayed broadcast or private message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatLogEntry {
    pub session_id: SessionId,
    pub identity: String,
    /// Target identity for private messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

/// In-memory chat log with optional snapshot file.
pub struct ChatLog {
    path: Option<PathBuf>,
    entries: Mutex<Vec<ChatLogEntry>>,
}

impl ChatLog {
    /// A log that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Open the log at `path`, loading any existing snapshot.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ChatLogError> {
        let path = path.into();
        let entries = match load_snapshot(&path) {
            Ok(entries) => entries,
            Err(ChatLogError::Format(e)) => {
                warn!(path = %path.display(), error = %e, "Chat log is corrupt, starting empty");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        info!(path = %path.display(), entries = entries.len(), "Loaded chat log");
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ChatLogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an entry and rewrite the snapshot. Save failures are logged,
    /// never returned.
    pub fn append(&self, entry: ChatLogEntry) {
        let mut entries = self.lock();
        entries.push(entry);
        if let Some(path) = &self.path {
            match save_snapshot(path, &entries) {
                Ok(()) => debug!(path = %path.display(), entries = entries.len(), "Saved chat log"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to save chat log"),
            }
        }
    }

    /// Copy of all entries, oldest first.
    pub fn entries(&self) -> Vec<ChatLogEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Read a snapshot file. A missing file is an empty log.
pub fn load_snapshot(path: &Path) -> Result<Vec<ChatLogEntry>, ChatLogError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(&bytes)?)
}

/// Write the full snapshot via a temporary file and rename.
pub fn save_snapshot(path: &Path, entries: &[ChatLogEntry]) -> Result<(), ChatLogError> {
    let json = serde_json::to_vec_pretty(entries)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

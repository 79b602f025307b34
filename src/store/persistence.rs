//! Append-only log persistence for the offline store.
//!
//! Each mutation (`put`, `remove`) is appended as one JSON line to
//! `cache_file_path`. On startup the log is replayed in order to rebuild the
//! in-memory table, which is how a row that survived `put` survives an
//! ungraceful process exit. `compact()` rewrites the log to contain only
//! live rows once the garbage-to-live ratio crosses a threshold, bounding
//! disk usage and startup replay time.

use super::PersistedItem;
use crate::error::{TelemetryError, TelemetryResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const COMPACTION_GARBAGE_FACTOR: u64 = 4;

#[derive(Serialize, Deserialize)]
#[serde(tag = "op")]
enum LogEntry {
    #[serde(rename = "put")]
    Put {
        id: u64,
        priority: crate::event::Priority,
        tenant_token: String,
        bytes: Vec<u8>,
        insertion_seq: u64,
        retry_count: u32,
    },
    #[serde(rename = "del")]
    Del { id: u64 },
}

/// Handle to the on-disk log backing one [`super::OfflineStore`]. `None`
/// path means "in-memory only", used by tests that do not want filesystem
/// side effects.
pub struct AppendLog {
    path: Option<PathBuf>,
    garbage_ops: u64,
}

impl AppendLog {
    pub fn open(path: &Path) -> TelemetryResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| TelemetryError::Io(e.to_string()))?;
            }
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TelemetryError::Io(e.to_string()))?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            garbage_ops: 0,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            garbage_ops: 0,
        }
    }

    /// Replays the log into an in-memory table, returning the live items
    /// and their total byte size. Tombstoned ids never appear in the result.
    pub fn replay(&self) -> (BTreeMap<u64, PersistedItem>, u64) {
        let mut items = BTreeMap::new();
        let mut total_bytes = 0u64;

        let Some(path) = &self.path else {
            return (items, total_bytes);
        };
        let Ok(file) = File::open(path) else {
            return (items, total_bytes);
        };

        for line in BufReader::new(file).lines().map_while(Result::ok) {
            if line.is_empty() {
                continue;
            }
            let Ok(entry) = serde_json::from_str::<LogEntry>(&line) else {
                continue;
            };
            match entry {
                LogEntry::Put {
                    id,
                    priority,
                    tenant_token,
                    bytes,
                    insertion_seq,
                    retry_count,
                } => {
                    total_bytes += bytes.len() as u64;
                    items.insert(
                        id,
                        PersistedItem {
                            id,
                            priority,
                            tenant_token,
                            bytes,
                            insertion_seq,
                            retry_count,
                            reserved: false,
                        },
                    );
                }
                LogEntry::Del { id } => {
                    if let Some(removed) = items.remove(&id) {
                        total_bytes -= removed.len() as u64;
                    }
                }
            }
        }

        (items, total_bytes)
    }

    pub fn append(&mut self, item: &PersistedItem) -> TelemetryResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let entry = LogEntry::Put {
            id: item.id,
            priority: item.priority,
            tenant_token: item.tenant_token.clone(),
            bytes: item.bytes.clone(),
            insertion_seq: item.insertion_seq,
            retry_count: item.retry_count,
        };
        self.append_entry(path, &entry)
    }

    pub fn remove(&mut self, id: u64) -> TelemetryResult<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        self.append_entry(&path, &LogEntry::Del { id })?;
        self.garbage_ops += 1;
        self.maybe_compact(&path)
    }

    fn append_entry(&self, path: &Path, entry: &LogEntry) -> TelemetryResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TelemetryError::Io(e.to_string()))?;
        let line = serde_json::to_string(entry).map_err(|e| TelemetryError::Io(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| TelemetryError::Io(e.to_string()))?;
        Ok(())
    }

    fn maybe_compact(&mut self, path: &Path) -> TelemetryResult<()> {
        let (live, _) = self.replay();
        if (self.garbage_ops) < live.len() as u64 * COMPACTION_GARBAGE_FACTOR {
            return Ok(());
        }

        let tmp_path = path.with_extension("compact.tmp");
        {
            let mut tmp = File::create(&tmp_path).map_err(|e| TelemetryError::Io(e.to_string()))?;
            for item in live.values() {
                let entry = LogEntry::Put {
                    id: item.id,
                    priority: item.priority,
                    tenant_token: item.tenant_token.clone(),
                    bytes: item.bytes.clone(),
                    insertion_seq: item.insertion_seq,
                    retry_count: item.retry_count,
                };
                let line = serde_json::to_string(&entry).map_err(|e| TelemetryError::Io(e.to_string()))?;
                writeln!(tmp, "{line}").map_err(|e| TelemetryError::Io(e.to_string()))?;
            }
        }
        std::fs::rename(&tmp_path, path).map_err(|e| TelemetryError::Io(e.to_string()))?;
        self.garbage_ops = 0;
        Ok(())
    }
}

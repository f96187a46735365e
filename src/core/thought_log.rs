//! Append-only, SHA-256 hash-chained audit trail.
//!
//! [`ThoughtLog`] is the durable record of resolutions the core is required to
//! keep without a real transactional store: approval decisions (ยง4.8), and any
//! other single-owner component that wants a tamper-evident history. Each
//! [`LogEntry`] is hash-chained to the previous entry, so a log file that has
//! been edited out-of-band fails [`ThoughtLog::verify_integrity`].
//!
//! Entries are persisted as newline-delimited JSON (`.jsonl`), one [`LogEntry`]
//! per line, append-only.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentcore::core::thought_log::ThoughtLog;
//! use std::path::PathBuf;
//!
//! # fn main() -> std::io::Result<()> {
//! let mut log = ThoughtLog::open(&PathBuf::from("audit_logs"), "approvals")?;
//! log.append("approval_manager", "auto_approve", "{\"id\":\"a1\"}")?;
//! assert!(log.verify_integrity());
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;

/// A single hash-chained audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Zero-based position in the log.
    pub index: u64,
    /// When this entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Which component produced the entry (e.g. `"approval_manager"`).
    pub source: String,
    /// A short tag classifying the entry (e.g. `"auto_approve"`, `"rejected"`).
    pub kind: String,
    /// Free-form JSON-serialized detail, opaque to the log itself.
    pub detail: String,
    /// SHA-256 hex digest of the previous entry (empty string for the first entry).
    pub prev_hash: String,
    /// SHA-256 hex digest of this entry's canonical representation.
    pub hash: String,
}

/// Append-only, SHA-256 hash-chained, disk-persisted audit log.
///
/// A `ThoughtLog` owns an in-memory `Vec<LogEntry>` mirrored to a `.jsonl`
/// file on disk. New entries are appended immediately (one JSON line per
/// entry) unless [`ThoughtLog::set_auto_flush`] disables it. Persistence is
/// best-effort: a write failure is returned as an `io::Result`, never
/// silently swallowed, and absence of a log file is never taken as evidence
/// that nothing happened.
pub struct ThoughtLog {
    entries: Vec<LogEntry>,
    file_path: PathBuf,
    auto_flush: bool,
}

impl ThoughtLog {
    /// Open an existing log or create a new one named `name` under `log_dir`.
    ///
    /// If `{name}.jsonl` already exists, previously persisted entries are
    /// loaded back into memory so the hash chain can continue.
    pub fn open(log_dir: &PathBuf, name: &str) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let safe_name: String = name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let file_path = log_dir.join(format!("{}.jsonl", safe_name));

        let entries = if file_path.exists() {
            let file = fs::File::open(&file_path)?;
            let reader = BufReader::new(file);
            let mut out = Vec::new();
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: LogEntry = serde_json::from_str(&line).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("corrupt log entry: {}", e))
                })?;
                out.push(entry);
            }
            out
        } else {
            Vec::new()
        };

        Ok(Self { entries, file_path, auto_flush: true })
    }

    /// Append a new entry, hash-chained to the last one, and (if `auto_flush`)
    /// persist it immediately.
    pub fn append(&mut self, source: &str, kind: &str, detail: &str) -> io::Result<&LogEntry> {
        let index = self.entries.len() as u64;
        let prev_hash = self.entries.last().map(|e| e.hash.clone()).unwrap_or_default();
        let timestamp = Utc::now();
        let hash = compute_entry_hash(index, &timestamp, source, kind, detail, &prev_hash);

        let entry = LogEntry {
            index,
            timestamp,
            source: source.to_string(),
            kind: kind.to_string(),
            detail: detail.to_string(),
            prev_hash,
            hash,
        };

        if self.auto_flush {
            let mut file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;
            let json = serde_json::to_string(&entry)
                .map_err(|e| io::Error::other(format!("failed to serialize log entry: {}", e)))?;
            writeln!(file, "{}", json)?;
        }

        self.entries.push(entry);
        Ok(self.entries.last().unwrap())
    }

    /// Verify that every entry's hash chains correctly from the first entry.
    pub fn verify_integrity(&self) -> bool {
        let mut prev_hash = String::new();
        for entry in &self.entries {
            if entry.prev_hash != prev_hash {
                return false;
            }
            let expected = compute_entry_hash(
                entry.index,
                &entry.timestamp,
                &entry.source,
                &entry.kind,
                &entry.detail,
                &entry.prev_hash,
            );
            if entry.hash != expected {
                return false;
            }
            prev_hash = entry.hash.clone();
        }
        true
    }

    /// All entries in chronological order.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// The on-disk path backing this log.
    pub fn file_path(&self) -> &PathBuf {
        &self.file_path
    }

    /// Control whether appended entries are flushed to disk immediately.
    pub fn set_auto_flush(&mut self, auto_flush: bool) {
        self.auto_flush = auto_flush;
    }
}

fn compute_entry_hash(
    index: u64,
    timestamp: &DateTime<Utc>,
    source: &str,
    kind: &str,
    detail: &str,
    prev_hash: &str,
) -> String {
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}",
        index,
        timestamp.to_rfc3339(),
        source,
        kind,
        detail,
        prev_hash
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_verify_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = ThoughtLog::open(&dir.path().to_path_buf(), "test").unwrap();
        log.append("approval_manager", "auto_approve", "{}").unwrap();
        log.append("approval_manager", "rejected", "{}").unwrap();
        assert_eq!(log.entries().len(), 2);
        assert!(log.verify_integrity());
    }

    #[test]
    fn detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = ThoughtLog::open(&dir.path().to_path_buf(), "test").unwrap();
        log.append("a", "k", "d1").unwrap();
        log.append("a", "k", "d2").unwrap();
        log.entries[0].detail = "tampered".to_string();
        assert!(!log.verify_integrity());
    }

    #[test]
    fn reopen_reloads_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        {
            let mut log = ThoughtLog::open(&path, "persisted").unwrap();
            log.append("a", "k", "d1").unwrap();
        }
        let log = ThoughtLog::open(&path, "persisted").unwrap();
        assert_eq!(log.entries().len(), 1);
        assert!(log.verify_integrity());
    }
}

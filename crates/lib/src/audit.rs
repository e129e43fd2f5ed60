//! Append-only audit log of inbound messages and outbound replies.
//!
//! On disk the log is a pretty-printed JSON array of
//! `{timestamp, from, message}` and `{timestamp, to, response}` objects, the
//! format the monitoring dashboards read. Appends are a read-modify-write of the
//! whole array, so they run under an in-process mutex and an exclusive advisory
//! lock on a `<log>.lock` sibling, and the new array replaces the old one atomically.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::persist;

/// One audit entry. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogRecord {
    Received {
        #[serde(with = "timestamp")]
        timestamp: DateTime<Utc>,
        from: String,
        message: String,
    },
    Replied {
        #[serde(with = "timestamp")]
        timestamp: DateTime<Utc>,
        to: String,
        response: String,
    },
}

impl LogRecord {
    /// Inbound message from `sender_id`, stamped now.
    pub fn received(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        LogRecord::Received {
            timestamp: Utc::now(),
            from: sender_id.into(),
            message: text.into(),
        }
    }

    /// Reply sent to `recipient_id`, stamped now.
    pub fn replied(recipient_id: impl Into<String>, text: impl Into<String>) -> Self {
        LogRecord::Replied {
            timestamp: Utc::now(),
            to: recipient_id.into(),
            response: text.into(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LogRecord::Received { timestamp, .. } | LogRecord::Replied { timestamp, .. } => {
                *timestamp
            }
        }
    }

    fn set_timestamp(&mut self, ts: DateTime<Utc>) {
        match self {
            LogRecord::Received { timestamp, .. } | LogRecord::Replied { timestamp, .. } => {
                *timestamp = ts
            }
        }
    }

    /// The party the record is about: sender for inbound, recipient for outbound.
    pub fn party(&self) -> &str {
        match self {
            LogRecord::Received { from, .. } => from,
            LogRecord::Replied { to, .. } => to,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            LogRecord::Received { message, .. } => message,
            LogRecord::Replied { response, .. } => response,
        }
    }
}

/// RFC 3339 UTC with millisecond precision, e.g. `2024-05-01T08:30:00.123Z`.
mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit log io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("audit log {path} is not a valid record array: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("audit log serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("audit log task failed: {0}")]
    Task(String),
}

/// Single-writer audit log backed by one JSON file.
pub struct AuditLog {
    path: PathBuf,
    lock_path: PathBuf,
    /// Timestamp of the last successful append; guards ordering too.
    last: Mutex<Option<DateTime<Utc>>>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        Self {
            path,
            lock_path,
            last: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Records land in the order `append` calls acquire the lock;
    /// a record stamped earlier than its predecessor is moved up to the predecessor's time.
    pub async fn append(&self, mut record: LogRecord) -> Result<(), AuditError> {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            if record.timestamp() < prev {
                record.set_timestamp(prev);
            }
        }
        let ts = record.timestamp();
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        tokio::task::spawn_blocking(move || append_blocking(&path, &lock_path, record))
            .await
            .map_err(|e| AuditError::Task(e.to_string()))??;
        *last = Some(ts);
        Ok(())
    }

    /// All records in append order. A missing or empty file is an empty log.
    pub async fn read_all(&self) -> Result<Vec<LogRecord>, AuditError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_records(&path))
            .await
            .map_err(|e| AuditError::Task(e.to_string()))?
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> AuditError + '_ {
    move |source| AuditError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_records(path: &Path) -> Result<Vec<LogRecord>, AuditError> {
    let s = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(path)(e)),
    };
    if s.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&s).map_err(|source| AuditError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn append_blocking(path: &Path, lock_path: &Path, record: LogRecord) -> Result<(), AuditError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
        .map_err(io_err(lock_path))?;
    lock_file.lock_exclusive().map_err(io_err(lock_path))?;

    let result = (|| {
        let mut records = read_records(path)?;
        records.push(record);
        let json = serde_json::to_string_pretty(&records)?;
        persist::write_atomic(path, json.as_bytes()).map_err(io_err(path))
    })();

    if let Err(e) = lock_file.unlock() {
        log::debug!("audit log unlock {}: {}", lock_path.display(), e);
    }
    result
}

//! Lifecycle status publisher: the current connection state and the latest
//! pairing payload, each kept in a single overwritten file for external readers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::Mutex;

use crate::persist;

/// Connection state of the transport. Exactly one is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
    PairingPending,
    Ready,
    Disconnected,
}

impl LifecycleStatus {
    /// Token written to the status file.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStatus::PairingPending => "pairing",
            LifecycleStatus::Ready => "ready",
            LifecycleStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleStatus {
    type Err = StatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pairing" => Ok(LifecycleStatus::PairingPending),
            "ready" => Ok(LifecycleStatus::Ready),
            "disconnected" => Ok(LifecycleStatus::Disconnected),
            other => Err(StatusError::Unknown(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown lifecycle status: {0:?}")]
    Unknown(String),
}

/// Publishes lifecycle status and pairing payloads. Writes are serialized and atomic.
pub struct StatusPublisher {
    status_path: PathBuf,
    pairing_path: PathBuf,
    write_lock: Mutex<()>,
}

impl StatusPublisher {
    pub fn new(status_path: impl Into<PathBuf>, pairing_path: impl Into<PathBuf>) -> Self {
        Self {
            status_path: status_path.into(),
            pairing_path: pairing_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn status_path(&self) -> &Path {
        &self.status_path
    }

    pub fn pairing_path(&self) -> &Path {
        &self.pairing_path
    }

    /// Overwrite the current status. Last write wins.
    pub async fn publish(&self, status: LifecycleStatus) -> Result<(), StatusError> {
        let _guard = self.write_lock.lock().await;
        persist::write_atomic_async(&self.status_path, status.as_str().as_bytes())
            .await
            .map_err(|source| StatusError::Write {
                path: self.status_path.clone(),
                source,
            })?;
        log::debug!("lifecycle status -> {}", status);
        Ok(())
    }

    /// Overwrite the pairing payload (e.g. QR code contents) for the presentation layer.
    pub async fn publish_pairing_code(&self, payload: &str) -> Result<(), StatusError> {
        let _guard = self.write_lock.lock().await;
        persist::write_atomic_async(&self.pairing_path, payload.as_bytes())
            .await
            .map_err(|source| StatusError::Write {
                path: self.pairing_path.clone(),
                source,
            })
    }

    /// Read back the current status. None when nothing has been published yet.
    pub async fn current(&self) -> Result<Option<LifecycleStatus>, StatusError> {
        read_status(&self.status_path).await
    }
}

/// Read a status file written by [`StatusPublisher::publish`]. Missing file => None.
pub async fn read_status(path: &Path) -> Result<Option<LifecycleStatus>, StatusError> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => s.parse().map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StatusError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// The pairing payload, but only while the status is `pairing`; a stale code
/// left over from an earlier session is not reported.
pub async fn read_pending_pairing(
    status: Option<LifecycleStatus>,
    pairing_path: &Path,
) -> Option<String> {
    if status != Some(LifecycleStatus::PairingPending) {
        return None;
    }
    tokio::fs::read_to_string(pairing_path)
        .await
        .ok()
        .filter(|code| !code.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher() -> StatusPublisher {
        let dir = std::env::temp_dir().join(format!("wabridge-status-{}", uuid::Uuid::new_v4()));
        StatusPublisher::new(dir.join("bot_status.txt"), dir.join("qr_code.txt"))
    }

    #[tokio::test]
    async fn publish_overwrites_previous_status() {
        let p = publisher();
        assert_eq!(p.current().await.unwrap(), None);
        p.publish(LifecycleStatus::PairingPending).await.unwrap();
        p.publish(LifecycleStatus::Ready).await.unwrap();
        assert_eq!(
            tokio::fs::read_to_string(p.status_path()).await.unwrap(),
            "ready"
        );
        p.publish(LifecycleStatus::Disconnected).await.unwrap();
        assert_eq!(p.current().await.unwrap(), Some(LifecycleStatus::Disconnected));
    }

    #[tokio::test]
    async fn pairing_code_is_overwritten() {
        let p = publisher();
        p.publish_pairing_code("2@abc").await.unwrap();
        p.publish_pairing_code("2@def").await.unwrap();
        assert_eq!(
            tokio::fs::read_to_string(p.pairing_path()).await.unwrap(),
            "2@def"
        );
    }

    #[tokio::test]
    async fn pairing_code_reported_only_while_pairing() {
        let p = publisher();
        p.publish_pairing_code("2@abc").await.unwrap();
        p.publish(LifecycleStatus::PairingPending).await.unwrap();
        let status = p.current().await.unwrap();
        assert_eq!(
            read_pending_pairing(status, p.pairing_path()).await.as_deref(),
            Some("2@abc")
        );

        p.publish(LifecycleStatus::Ready).await.unwrap();
        let status = p.current().await.unwrap();
        assert_eq!(read_pending_pairing(status, p.pairing_path()).await, None);
        assert_eq!(read_pending_pairing(None, p.pairing_path()).await, None);
    }

    #[test]
    fn status_tokens_round_trip() {
        for s in [
            LifecycleStatus::PairingPending,
            LifecycleStatus::Ready,
            LifecycleStatus::Disconnected,
        ] {
            assert_eq!(s.as_str().parse::<LifecycleStatus>().unwrap(), s);
        }
        assert!("online".parse::<LifecycleStatus>().is_err());
    }

    #[tokio::test]
    async fn unwritable_path_reports_error() {
        let dir = std::env::temp_dir().join(format!("wabridge-status-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let blocker = dir.join("file");
        std::fs::write(&blocker, "x").unwrap();
        let p = StatusPublisher::new(blocker.join("bot_status.txt"), dir.join("qr.txt"));
        let err = p.publish(LifecycleStatus::Ready).await.unwrap_err();
        assert!(matches!(err, StatusError::Write { .. }));
    }
}

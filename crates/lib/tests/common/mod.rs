//! Shared doubles for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use wabridge::channels::{Transport, TransportError, TransportEvent};
use wabridge::responder::ProcessResponder;

/// Transport that records every send instead of delivering it.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    fn id(&self) -> &str {
        "recording"
    }

    fn start(self: Arc<Self>, events: mpsc::Sender<TransportEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let _ = events.send(TransportEvent::Ready).await;
        })
    }

    fn stop(&self) {}

    async fn send_message(&self, recipient_id: &str, text: &str) -> Result<(), TransportError> {
        self.sent
            .lock()
            .await
            .push((recipient_id.to_string(), text.to_string()));
        Ok(())
    }
}

/// Responder running `sh -c <script>`; the script sees the text as $1 and the sender as $2.
pub fn sh_responder(script: &str) -> ProcessResponder {
    ProcessResponder::new(
        "sh",
        vec!["-c".to_string(), script.to_string(), "responder".to_string()],
    )
}

pub fn temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

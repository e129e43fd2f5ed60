//! Transport trait: the send capability plus start/stop of event delivery.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::inbound::TransportEvent;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("transport api error: {0}")]
    Api(String),
    #[error("transport not configured: {0}")]
    NotConfigured(&'static str),
    #[error("transport stopped")]
    Stopped,
}

/// Handle to a running transport (start, stop, send message).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport id (e.g. "twilio").
    fn id(&self) -> &str;

    /// Begin delivering events on `events`. Returns the task to await on shutdown.
    fn start(self: Arc<Self>, events: mpsc::Sender<TransportEvent>) -> JoinHandle<()>;

    /// Stop delivering events. Sends after stop fail with [`TransportError::Stopped`].
    fn stop(&self);

    /// Send a text message to a recipient (e.g. a phone number).
    async fn send_message(&self, recipient_id: &str, text: &str) -> Result<(), TransportError>;
}

//! Sidecar channel: a separate WhatsApp Web session process owns pairing and
//! connectivity, POSTs its events to `/sidecar/events`, and accepts outbound
//! messages on its own `sendUrl`.

use crate::channels::inbound::{classify_whatsapp_address, InboundMessage, TransportEvent};
use crate::channels::transport::{Transport, TransportError};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Header carrying the shared secret, both directions.
pub const SIDECAR_SECRET_HEADER: &str = "X-Sidecar-Secret";

/// True when `provided` matches `expected`, or no secret is configured.
pub fn secret_matches(expected: Option<&str>, provided: Option<&str>) -> bool {
    match expected.filter(|s| !s.is_empty()) {
        Some(expected) => provided == Some(expected),
        None => true,
    }
}

/// Event payload posted by the sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SidecarEvent {
    /// New pairing QR payload.
    Qr { qr: String },
    Ready,
    Disconnected {
        #[serde(default)]
        reason: Option<String>,
    },
    Message {
        /// Chat address, e.g. `628123@c.us`.
        from: String,
        #[serde(default)]
        body: String,
        #[serde(default, rename = "fromMe")]
        from_me: bool,
    },
}

impl From<SidecarEvent> for TransportEvent {
    fn from(ev: SidecarEvent) -> Self {
        match ev {
            SidecarEvent::Qr { qr } => TransportEvent::PairingCode(qr),
            SidecarEvent::Ready => TransportEvent::Ready,
            SidecarEvent::Disconnected { reason } => {
                TransportEvent::Disconnected(reason.unwrap_or_default())
            }
            SidecarEvent::Message {
                from,
                body,
                from_me,
            } => {
                let (sender_id, origin) = classify_whatsapp_address(&from);
                TransportEvent::Message(InboundMessage {
                    sender_id,
                    text: body,
                    origin,
                    is_self_origin: from_me,
                })
            }
        }
    }
}

/// Sidecar connector. Inbound traffic arrives through the gateway; this type only sends.
pub struct SidecarChannel {
    id: String,
    send_url: Option<String>,
    secret: Option<String>,
    running: AtomicBool,
    client: reqwest::Client,
}

impl SidecarChannel {
    pub fn new(send_url: Option<String>, secret: Option<String>) -> Self {
        Self {
            id: "sidecar".to_string(),
            send_url: send_url.filter(|s| !s.trim().is_empty()),
            secret: secret.filter(|s| !s.is_empty()),
            running: AtomicBool::new(false),
            client: reqwest::Client::new(),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// POST `{to, message}` to the sidecar's send endpoint.
    pub async fn send_message(&self, to: &str, text: &str) -> Result<(), TransportError> {
        if !self.running() {
            return Err(TransportError::Stopped);
        }
        let url = self
            .send_url
            .as_ref()
            .ok_or(TransportError::NotConfigured("sidecar sendUrl"))?;
        let body = serde_json::json!({ "to": to, "message": text });
        let mut req = self.client.post(url).json(&body);
        if let Some(ref s) = self.secret {
            req = req.header(SIDECAR_SECRET_HEADER, s);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(TransportError::Api(format!("send failed: {} {}", status, body)));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SidecarChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(self: Arc<Self>, _events: mpsc::Sender<TransportEvent>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        tokio::spawn(async move {
            log::info!(
                "sidecar channel: waiting for events on POST /sidecar/events (send url: {})",
                self.send_url.as_deref().unwrap_or("<unset>")
            );
        })
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn send_message(&self, recipient_id: &str, text: &str) -> Result<(), TransportError> {
        SidecarChannel::send_message(self, recipient_id, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::OriginKind;
    use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
    use tokio::sync::Mutex;

    #[test]
    fn parses_lifecycle_events() {
        let ev: SidecarEvent = serde_json::from_str(r#"{"type":"qr","qr":"2@abc"}"#).unwrap();
        assert_eq!(
            TransportEvent::from(ev),
            TransportEvent::PairingCode("2@abc".to_string())
        );
        let ev: SidecarEvent = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert_eq!(TransportEvent::from(ev), TransportEvent::Ready);
        let ev: SidecarEvent =
            serde_json::from_str(r#"{"type":"disconnected","reason":"LOGOUT"}"#).unwrap();
        assert_eq!(
            TransportEvent::from(ev),
            TransportEvent::Disconnected("LOGOUT".to_string())
        );
    }

    #[test]
    fn parses_message_events() {
        let ev: SidecarEvent = serde_json::from_str(
            r#"{"type":"message","from":"628123@c.us","body":"halo","fromMe":false}"#,
        )
        .unwrap();
        assert_eq!(
            TransportEvent::from(ev),
            TransportEvent::Message(InboundMessage::direct("628123", "halo"))
        );
        let ev: SidecarEvent =
            serde_json::from_str(r#"{"type":"message","from":"1203@g.us","body":"hi"}"#).unwrap();
        match TransportEvent::from(ev) {
            TransportEvent::Message(m) => assert_eq!(m.origin, OriginKind::Group),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn secret_verification() {
        assert!(secret_matches(None, None));
        assert!(secret_matches(Some(""), Some("anything")));
        assert!(!secret_matches(Some("s3cret"), None));
        assert!(!secret_matches(Some("s3cret"), Some("nope")));
        assert!(secret_matches(Some("s3cret"), Some("s3cret")));
    }

    #[tokio::test]
    async fn send_posts_json_with_secret() {
        type Seen = Arc<Mutex<Vec<(serde_json::Value, Option<String>)>>>;
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        async fn capture(
            State(seen): State<Seen>,
            headers: HeaderMap,
            Json(body): Json<serde_json::Value>,
        ) -> &'static str {
            let secret = headers
                .get(SIDECAR_SECRET_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            seen.lock().await.push((body, secret));
            "ok"
        }
        let app = Router::new()
            .route("/send", post(capture))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let channel = Arc::new(SidecarChannel::new(
            Some(format!("http://{}/send", addr)),
            Some("s3cret".to_string()),
        ));
        let (tx, _rx) = mpsc::channel(1);
        channel.clone().start(tx).await.unwrap();
        channel.send_message("628123", "Hai!").await.unwrap();

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0["to"], "628123");
        assert_eq!(seen[0].0["message"], "Hai!");
        assert_eq!(seen[0].1.as_deref(), Some("s3cret"));
    }

    #[tokio::test]
    async fn send_without_url_fails() {
        let channel = Arc::new(SidecarChannel::new(None, None));
        let (tx, _rx) = mpsc::channel(1);
        channel.clone().start(tx).await.unwrap();
        assert!(matches!(
            channel.send_message("1", "x").await.unwrap_err(),
            TransportError::NotConfigured(_)
        ));
    }
}

//! Twilio WhatsApp channel: inbound via webhook form posts, outbound via the Messages API.

use crate::channels::inbound::{InboundMessage, TransportEvent};
use crate::channels::transport::{Transport, TransportError};
use crate::config::TwilioCredentials;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const TWILIO_API_BASE: &str = "https://api.twilio.com";
const WHATSAPP_PREFIX: &str = "whatsapp:";

/// Form body Twilio POSTs to the webhook for each inbound message.
#[derive(Debug, Default, Deserialize)]
pub struct TwilioWebhookForm {
    #[serde(rename = "From", default)]
    pub from: String,
    #[serde(rename = "Body", default)]
    pub body: String,
}

impl TwilioWebhookForm {
    /// Convert to an inbound event. Empty sender or body yields None (acknowledged, not handled).
    pub fn into_event(self) -> Option<TransportEvent> {
        let sender = normalize_twilio_sender(&self.from);
        if sender.is_empty() || self.body.trim().is_empty() {
            return None;
        }
        Some(TransportEvent::Message(InboundMessage::direct(sender, self.body)))
    }
}

/// `whatsapp:+628123` -> `+628123`.
pub fn normalize_twilio_sender(from: &str) -> String {
    let from = from.trim();
    from.strip_prefix(WHATSAPP_PREFIX).unwrap_or(from).to_string()
}

/// `+628123` -> `whatsapp:+628123`; already prefixed addresses are kept.
fn whatsapp_address(number: &str) -> String {
    let number = number.trim();
    if number.starts_with(WHATSAPP_PREFIX) {
        number.to_string()
    } else {
        format!("{}{}", WHATSAPP_PREFIX, number)
    }
}

#[derive(Debug, Deserialize)]
struct TwilioErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Twilio channel connector: readiness on start, sends replies via the Messages API.
pub struct TwilioChannel {
    id: String,
    credentials: Option<TwilioCredentials>,
    api_base: String,
    running: AtomicBool,
    client: reqwest::Client,
}

impl TwilioChannel {
    pub fn new(credentials: Option<TwilioCredentials>) -> Self {
        Self::with_api_base(credentials, twilio_api_base())
    }

    /// Use a custom API base (tests or regional endpoints).
    pub fn with_api_base(credentials: Option<TwilioCredentials>, api_base: impl Into<String>) -> Self {
        Self {
            id: "twilio".to_string(),
            credentials,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            running: AtomicBool::new(false),
            client: reqwest::Client::new(),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Send a WhatsApp message through the Messages API.
    pub async fn send_message(&self, to: &str, text: &str) -> Result<(), TransportError> {
        if !self.running() {
            return Err(TransportError::Stopped);
        }
        let creds = self
            .credentials
            .as_ref()
            .ok_or(TransportError::NotConfigured("twilio credentials"))?;
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, creds.account_sid
        );
        let from = whatsapp_address(&creds.from_number);
        let to = whatsapp_address(to);
        let form = [
            ("From", from.as_str()),
            ("To", to.as_str()),
            ("Body", text),
        ];
        let res = self
            .client
            .post(&url)
            .basic_auth(&creds.account_sid, Some(&creds.auth_token))
            .form(&form)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<TwilioErrorBody>(&body)
                .ok()
                .and_then(|b| b.message)
                .unwrap_or(body);
            return Err(TransportError::Api(format!(
                "Messages.json failed: {} {}",
                status, detail
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for TwilioChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(self: Arc<Self>, events: mpsc::Sender<TransportEvent>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        log::info!("twilio channel: webhook mode, waiting for POST /twilio/webhook");
        tokio::spawn(async move {
            if self.credentials.is_none() {
                log::warn!("twilio channel: credentials missing, replies will fail");
            }
            if events.send(TransportEvent::Ready).await.is_err() {
                log::debug!("twilio: event channel closed before ready");
            }
        })
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn send_message(&self, recipient_id: &str, text: &str) -> Result<(), TransportError> {
        TwilioChannel::send_message(self, recipient_id, text).await
    }
}

/// Resolve the Twilio API base URL: TWILIO_API_BASE env overrides the public endpoint.
pub fn twilio_api_base() -> String {
    std::env::var("TWILIO_API_BASE").unwrap_or_else(|_| TWILIO_API_BASE.to_string())
}

//! Gateway HTTP request and response bodies.

use serde::{Deserialize, Serialize};

/// `GET /` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub service: String,
    pub transport: String,
    /// Last published lifecycle status; None before the transport reported anything.
    pub lifecycle: Option<String>,
}

/// `POST /send` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendParams {
    pub to: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResult {
    pub ok: bool,
}

/// `POST /send-broadcast` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastParams {
    pub message: String,
    #[serde(default, alias = "phone_numbers")]
    pub phone_numbers: Vec<String>,
}

/// Per-recipient outcome: status is "sent" or "failed".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastEntry {
    pub phone: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastResult {
    pub status: String,
    pub results: Vec<BroadcastEntry>,
}

impl BroadcastEntry {
    pub fn new(phone: impl Into<String>, sent: bool) -> Self {
        Self {
            phone: phone.into(),
            status: if sent { "sent" } else { "failed" }.to_string(),
        }
    }
}

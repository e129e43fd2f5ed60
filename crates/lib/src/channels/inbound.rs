//! Inbound events from a transport: lifecycle changes and chat messages.

/// Where a message came from. Only direct chats are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginKind {
    Direct,
    Group,
    BroadcastStatus,
}

/// A chat message delivered by the transport. Consumed once by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Opaque sender id (a phone number for WhatsApp), also the reply address.
    pub sender_id: String,
    pub text: String,
    pub origin: OriginKind,
    /// Sent by the bot's own account.
    pub is_self_origin: bool,
}

impl InboundMessage {
    /// A direct message from someone else.
    pub fn direct(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            text: text.into(),
            origin: OriginKind::Direct,
            is_self_origin: false,
        }
    }
}

/// Everything a transport reports to the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A new pairing code (QR payload) was issued and must be shown to the operator.
    PairingCode(String),
    Ready,
    Disconnected(String),
    Message(InboundMessage),
}

/// Split a WhatsApp Web chat address into a sender id and origin.
/// `628123@c.us` is a direct chat with sender `628123`; `...@g.us` is a group;
/// `status@broadcast` is the status feed.
pub fn classify_whatsapp_address(address: &str) -> (String, OriginKind) {
    let address = address.trim();
    if address.contains("status@broadcast") {
        (address.to_string(), OriginKind::BroadcastStatus)
    } else if address.ends_with("@g.us") {
        (address.to_string(), OriginKind::Group)
    } else {
        let sender = address.strip_suffix("@c.us").unwrap_or(address);
        (sender.to_string(), OriginKind::Direct)
    }
}

//! Messaging transports (Twilio WhatsApp API, WhatsApp Web sidecar).
//!
//! A transport delivers lifecycle and inbound-message events to the bridge and
//! exposes a send capability. Webhook-style transports receive their traffic
//! through the HTTP gateway, which turns requests into [`TransportEvent`]s.

mod inbound;
mod sidecar;
mod transport;
mod twilio;

pub use inbound::{classify_whatsapp_address, InboundMessage, OriginKind, TransportEvent};
pub use sidecar::{secret_matches, SidecarChannel, SidecarEvent, SIDECAR_SECRET_HEADER};
pub use transport::{Transport, TransportError};
pub use twilio::{normalize_twilio_sender, TwilioChannel, TwilioWebhookForm};

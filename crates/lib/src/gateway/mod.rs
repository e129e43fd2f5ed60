//! Gateway: HTTP surface on a single port.
//!
//! Serves the health probe, the transport webhooks (Twilio form posts, sidecar
//! JSON events) and the proactive send endpoints used by embedders.

mod protocol;
mod server;

pub use protocol::{BroadcastEntry, BroadcastParams, BroadcastResult, Health, SendParams, SendResult};
pub use server::{router, run_gateway, GatewayState};

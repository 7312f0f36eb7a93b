//! Notifications surfaced to the rest of the application. The sink is
//! injected; this layer never touches a global bus.

use baselink_core::protocol::BaseStatus;

/// Typed payloads published to the application. Each topic carries exactly
/// one payload kind, with replace semantics.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The pairing code to show the user. An empty string clears it.
    PairingCode(String),
    /// Latest status snapshot from the base.
    Status(BaseStatus),
}

/// Where notifications go. Implemented by the application layer; the client
/// only publishes.
pub trait EventSink: Send + Sync {
    fn publish(&self, topic: &str, event: Event);
}

pub fn pairing_code_topic(base_id: &str) -> String {
    format!("/devices/{base_id}/pairingcode")
}

pub fn status_topic(base_id: &str) -> String {
    format!("/devices/{base_id}/status")
}

//! MQTT-over-WebSocket ingress.
//!
//! Clients open a WebSocket to the bridge and speak MQTT 3.1/3.1.1 inside
//! binary frames. Each upgrade request is first checked by the
//! [`AuthGate`]; admitted connections get a [`Session`] that acknowledges
//! what an MQTT client expects and forwards every PUBLISH to the event bus.
//!
//! # Architecture
//!
//! ```text
//! Client  <--WS/MQTT-->  Ingress  --[AuthGate]-->  OAuth /validate
//!                           |
//!                        Session  --[EventSink]-->  Event bus
//! ```
//!
//! A PUBACK is sent only after the event bus confirmed the event, so a QoS 1
//! client that sees no acknowledgement knows to redeliver.

pub mod auth;
pub mod listener;
pub mod session;

// Re-export the primary public types at the crate root for convenience.
pub use auth::{AuthGate, AuthRejection, AuthSetupError};
pub use listener::{Ingress, IngressConfig};
pub use session::{ConnectionContext, Session, SessionConfig, SessionState, Step};

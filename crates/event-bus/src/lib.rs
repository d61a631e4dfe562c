//! Event bus side of the bridge.
//!
//! MQTT clients publish a small JSON envelope (`eventType`, `eventTime`,
//! `data`). This crate decodes that envelope, maps it onto the event shape
//! the event bus expects, and posts it.
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use event_bus::{ClientEnvelope, EventForwarder, EventSink, EventTransformer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transformer = EventTransformer::new("commerce-mock");
//! let forwarder = EventForwarder::new(
//!     "http://event-bus-publish:8080/v1/events".parse()?,
//!     Duration::from_secs(10),
//! )?;
//!
//! let envelope = ClientEnvelope::from_payload(
//!     br#"{"eventType":"User.Registered","eventTime":"2024-01-01T00:00:00Z","data":{}}"#,
//! )?;
//! let receipt = forwarder.publish(&transformer.transform(envelope)).await?;
//! println!("accepted as {}", receipt.event_id);
//! # Ok(())
//! # }
//! ```

pub mod event;
pub mod forwarder;

// Re-export primary public types at the crate root for convenience.
pub use event::{
    ClientEnvelope, EventTransformer, OutboundEvent, PayloadError, DEFAULT_EVENT_TYPE_VERSION,
};
pub use forwarder::{EventForwarder, EventReceipt, EventSink, ForwardError, EVENT_ID_FIELD};

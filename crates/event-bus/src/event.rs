use serde::{Deserialize, Serialize};
use serde_json::error::Category;
use thiserror::Error;

/// `event-type-version` used when the client envelope does not name one.
pub const DEFAULT_EVENT_TYPE_VERSION: &str = "v1";

/// The JSON envelope MQTT clients publish.
///
/// Fields beyond the ones below (`cloudEventsVersion`, `source`,
/// `contentType`, ...) are accepted and ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvelope {
    pub event_type: String,
    pub event_time: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub event_version: Option<String>,
}

/// Why a PUBLISH payload could not be read as a [`ClientEnvelope`].
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid JSON: {0}")]
    Syntax(#[source] serde_json::Error),

    #[error("payload does not match the event envelope: {0}")]
    Shape(#[source] serde_json::Error),

    #[error("eventType must not be empty")]
    EmptyEventType,
}

impl ClientEnvelope {
    /// Decode a raw PUBLISH payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self, PayloadError> {
        let envelope: Self = serde_json::from_slice(payload).map_err(|err| match err.classify() {
            Category::Data => PayloadError::Shape(err),
            Category::Io | Category::Syntax | Category::Eof => PayloadError::Syntax(err),
        })?;

        if envelope.event_type.trim().is_empty() {
            return Err(PayloadError::EmptyEventType);
        }

        Ok(envelope)
    }
}

/// The event shape accepted by the event bus publish endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutboundEvent {
    pub source_id: String,
    pub event_type: String,
    pub event_type_version: String,
    pub event_time: String,
    pub data: serde_json::Value,
}

/// Maps client envelopes onto [`OutboundEvent`]s on behalf of one
/// application identity.
///
/// The source id comes from configuration and is never taken from client
/// input.
#[derive(Debug, Clone)]
pub struct EventTransformer {
    source_id: String,
}

impl EventTransformer {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Build the outbound event. `event-type` is lower-cased; time and data
    /// pass through untouched.
    pub fn transform(&self, envelope: ClientEnvelope) -> OutboundEvent {
        OutboundEvent {
            source_id: self.source_id.clone(),
            event_type: envelope.event_type.to_lowercase(),
            event_type_version: envelope
                .event_version
                .filter(|version| !version.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT_TYPE_VERSION.to_string()),
            event_time: envelope.event_time,
            data: envelope.data,
        }
    }
}

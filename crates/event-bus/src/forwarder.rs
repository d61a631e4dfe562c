use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use thiserror::Error;

use crate::event::OutboundEvent;

/// Maximum number of response body bytes kept in a [`ForwardError::Status`].
const BODY_EXCERPT_LIMIT: usize = 256;

/// Response field the event bus uses to report the identifier it assigned.
pub const EVENT_ID_FIELD: &str = "event-id";

/// Proof that the event bus accepted an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventReceipt {
    pub event_id: String,
}

/// Why an event could not be delivered to the event bus.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("event bus request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("event bus responded with {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("event bus response is not JSON: {0}")]
    MalformedResponse(#[source] serde_json::Error),

    #[error("event bus response carries no event-id")]
    MissingEventId,
}

/// Destination for outbound events.
///
/// Implementations deliver exactly one attempt per call and never retry;
/// redelivery is the publishing client's responsibility.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &OutboundEvent) -> Result<EventReceipt, ForwardError>;
}

/// HTTP client for the event bus publish endpoint.
///
/// An event counts as delivered only when the bus answers with a 2xx status
/// *and* a JSON body carrying a non-empty `event-id`.
#[derive(Debug, Clone)]
pub struct EventForwarder {
    client: reqwest::Client,
    url: Url,
}

impl EventForwarder {
    /// Build a forwarder whose requests are bounded by `timeout`.
    pub fn new(url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl EventSink for EventForwarder {
    async fn publish(&self, event: &OutboundEvent) -> Result<EventReceipt, ForwardError> {
        tracing::debug!(
            url = %self.url,
            event_type = %event.event_type,
            "posting event to event bus"
        );

        let response = self
            .client
            .post(self.url.clone())
            .json(event)
            .send()
            .await
            .map_err(ForwardError::Transport)?;

        let status = response.status();
        let body = response.bytes().await.map_err(ForwardError::Transport)?;

        if !status.is_success() {
            return Err(ForwardError::Status {
                status,
                body: excerpt(&body),
            });
        }

        interpret_response(&body)
    }
}

/// Extract the receipt from a successful publish response body.
fn interpret_response(body: &[u8]) -> Result<EventReceipt, ForwardError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(ForwardError::MalformedResponse)?;

    value
        .get(EVENT_ID_FIELD)
        .and_then(|id| id.as_str())
        .filter(|id| !id.is_empty())
        .map(|id| EventReceipt {
            event_id: id.to_string(),
        })
        .ok_or(ForwardError::MissingEventId)
}

fn excerpt(body: &[u8]) -> String {
    let end = body.len().min(BODY_EXCERPT_LIMIT);
    let mut text = String::from_utf8_lossy(&body[..end]).into_owned();
    if body.len() > BODY_EXCERPT_LIMIT {
        text.push_str("...");
    }
    text
}

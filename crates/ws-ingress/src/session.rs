use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bytes::BytesMut;
use event_bus::{ClientEnvelope, EventSink, EventTransformer};
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesOrdered, StreamExt};
use mqtt_wire::{CodecError, ConnectReturnCode, MqttCodec, Packet, Publish, Reply};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Per-connection metadata carried into every log line of a session.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Unique identifier for this WebSocket connection.
    pub connection_id: uuid::Uuid,
    /// The TCP address of the connecting client.
    pub remote_addr: SocketAddr,
}

/// Collaborators and limits shared by every session. Built once at startup.
#[derive(Clone)]
pub struct SessionConfig {
    pub transformer: EventTransformer,
    pub sink: Arc<dyn EventSink>,
    /// Largest MQTT packet accepted from a client, in bytes.
    pub max_packet_size: usize,
    /// Forwards a single connection may have outstanding at once. While the
    /// bound is reached the session stops reading from the client.
    pub max_inflight: usize,
}

/// Lifecycle of one MQTT session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Upgraded, no CONNECT seen yet.
    Open,
    /// CONNACK sent.
    Connected,
    Closed,
}

/// A forward in progress. Resolves to the PUBACK to send, if any.
pub type PendingForward = BoxFuture<'static, Option<Reply>>;

/// What the connection loop must do after a packet was handled.
pub enum Step {
    Reply(Reply),
    Forward(PendingForward),
    Close,
    Nothing,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Reply(reply) => f.debug_tuple("Reply").field(reply).finish(),
            Step::Forward(_) => f.write_str("Forward(..)"),
            Step::Close => f.write_str("Close"),
            Step::Nothing => f.write_str("Nothing"),
        }
    }
}

/// Broker-side MQTT session for one accepted connection.
///
/// Authentication already happened at upgrade time, so the session trusts
/// every packet and keeps no state beyond its lifecycle. Packets other than
/// CONNECT are handled even before CONNECT arrives.
pub struct Session {
    ctx: Arc<ConnectionContext>,
    state: SessionState,
    transformer: EventTransformer,
    sink: Arc<dyn EventSink>,
}

impl Session {
    pub fn new(
        ctx: Arc<ConnectionContext>,
        transformer: EventTransformer,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            ctx,
            state: SessionState::Open,
            transformer,
            sink,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// React to one decoded packet.
    pub fn on_packet(&mut self, packet: Packet) -> Step {
        match packet {
            Packet::Connect(connect) => {
                tracing::info!(
                    connection_id = %self.ctx.connection_id,
                    client_id = %connect.client_id,
                    protocol_level = connect.protocol_level,
                    "client connecting"
                );
                self.state = SessionState::Connected;
                Step::Reply(Reply::ConnAck {
                    session_present: false,
                    return_code: ConnectReturnCode::Accepted,
                })
            }
            Packet::Publish(publish) => self.on_publish(publish),
            Packet::Subscribe(subscribe) => {
                tracing::info!(
                    connection_id = %self.ctx.connection_id,
                    message_id = subscribe.message_id,
                    filters = subscribe.filters.len(),
                    "client subscribing"
                );
                Step::Reply(Reply::SubAck {
                    message_id: subscribe.message_id,
                    granted: subscribe.filters.iter().map(|filter| filter.qos).collect(),
                })
            }
            Packet::Unsubscribe(unsubscribe) => Step::Reply(Reply::UnsubAck {
                message_id: unsubscribe.message_id,
            }),
            Packet::PingReq => Step::Reply(Reply::PingResp),
            Packet::Disconnect => {
                tracing::info!(connection_id = %self.ctx.connection_id, "client disconnecting");
                self.state = SessionState::Closed;
                Step::Close
            }
            Packet::PubAck(message_id)
            | Packet::PubRec(message_id)
            | Packet::PubRel(message_id)
            | Packet::PubComp(message_id) => {
                tracing::debug!(
                    connection_id = %self.ctx.connection_id,
                    packet = packet.name(),
                    message_id,
                    "ignoring acknowledgement from client"
                );
                Step::Nothing
            }
        }
    }

    fn on_publish(&self, publish: Publish) -> Step {
        let Publish {
            topic,
            message_id,
            payload,
            ..
        } = publish;

        let envelope = match ClientEnvelope::from_payload(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(
                    connection_id = %self.ctx.connection_id,
                    %topic,
                    ?message_id,
                    %err,
                    "dropping PUBLISH with malformed payload"
                );
                return Step::Nothing;
            }
        };

        let event = self.transformer.transform(envelope);
        tracing::info!(
            connection_id = %self.ctx.connection_id,
            %topic,
            ?message_id,
            source_id = %self.transformer.source_id(),
            event_type = %event.event_type,
            "publishing packet to event bus"
        );

        let sink = Arc::clone(&self.sink);
        let ctx = Arc::clone(&self.ctx);
        Step::Forward(Box::pin(async move {
            match sink.publish(&event).await {
                Ok(receipt) => {
                    let message_id = message_id?;
                    tracing::info!(
                        connection_id = %ctx.connection_id,
                        message_id,
                        event_id = %receipt.event_id,
                        "sending back PUBACK"
                    );
                    Some(Reply::PubAck { message_id })
                }
                Err(err) => {
                    tracing::error!(
                        connection_id = %ctx.connection_id,
                        %topic,
                        ?message_id,
                        %err,
                        "error while forwarding packet"
                    );
                    None
                }
            }
        }))
    }
}

#[derive(Debug, Error)]
enum SendError {
    #[error("failed to encode {0}: {1}")]
    Encode(&'static str, #[source] CodecError),

    #[error("failed to write to socket: {0}")]
    Socket(#[from] axum::Error),
}

/// Something the connection loop woke up for.
enum Wake {
    Frame(Option<Result<Message, axum::Error>>),
    Forwarded(Option<Option<Reply>>),
}

/// Drive one upgraded connection until the client goes away.
///
/// Buffered bytes are decoded whenever fewer than `max_inflight` forwards
/// are outstanding. Forward completions are taken in submission order, so
/// PUBACKs leave in the order their PUBLISHes arrived and never before the
/// forward resolved.
pub async fn run(mut socket: WebSocket, ctx: Arc<ConnectionContext>, config: Arc<SessionConfig>) {
    let mut session = Session::new(
        Arc::clone(&ctx),
        config.transformer.clone(),
        Arc::clone(&config.sink),
    );
    let mut codec = MqttCodec::new(config.max_packet_size);
    let mut inbound = BytesMut::new();
    let mut inflight: FuturesOrdered<PendingForward> = FuturesOrdered::new();
    let max_inflight = config.max_inflight.max(1);

    'session: loop {
        while inflight.len() < max_inflight {
            let packet = match codec.decode(&mut inbound) {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(
                        connection_id = %ctx.connection_id,
                        %err,
                        "failed to decode MQTT packet; closing connection"
                    );
                    let frame = CloseFrame {
                        code: close_code::PROTOCOL,
                        reason: err.to_string().into(),
                    };
                    let _ = socket.send(Message::Close(Some(frame))).await;
                    break 'session;
                }
            };

            tracing::debug!(
                connection_id = %ctx.connection_id,
                packet = packet.name(),
                "packet received"
            );

            match session.on_packet(packet) {
                Step::Reply(reply) => {
                    if let Err(err) = send_reply(&mut socket, &mut codec, reply).await {
                        tracing::debug!(connection_id = %ctx.connection_id, %err, "reply failed");
                        break 'session;
                    }
                }
                Step::Forward(pending) => inflight.push_back(pending),
                Step::Close => break 'session,
                Step::Nothing => {}
            }
        }

        let wake = tokio::select! {
            frame = socket.recv(), if inflight.len() < max_inflight => Wake::Frame(frame),
            reply = inflight.next(), if !inflight.is_empty() => Wake::Forwarded(reply),
        };

        match wake {
            Wake::Frame(Some(Ok(Message::Binary(data)))) => inbound.extend_from_slice(&data),
            Wake::Frame(Some(Ok(Message::Text(_)))) => {
                tracing::debug!(connection_id = %ctx.connection_id, "ignoring text frame");
            }
            Wake::Frame(Some(Ok(Message::Close(_)))) | Wake::Frame(None) => {
                tracing::debug!(connection_id = %ctx.connection_id, "client closed the stream");
                break;
            }
            // Ping/pong are answered by the transport.
            Wake::Frame(Some(Ok(_))) => {}
            Wake::Frame(Some(Err(err))) => {
                tracing::warn!(connection_id = %ctx.connection_id, %err, "read error");
                break;
            }
            Wake::Forwarded(Some(Some(reply))) => {
                if let Err(err) = send_reply(&mut socket, &mut codec, reply).await {
                    tracing::debug!(connection_id = %ctx.connection_id, %err, "reply failed");
                    break;
                }
            }
            Wake::Forwarded(_) => {}
        }
    }

    session.close();

    // Forwards already issued run to completion; their acknowledgements have
    // nowhere to go.
    if !inflight.is_empty() {
        tracing::debug!(
            connection_id = %ctx.connection_id,
            pending = inflight.len(),
            "draining in-flight forwards of closed connection"
        );
        while let Some(reply) = inflight.next().await {
            if let Some(reply) = reply {
                tracing::debug!(
                    connection_id = %ctx.connection_id,
                    reply = reply.name(),
                    "discarding reply for closed connection"
                );
            }
        }
    }

    tracing::info!(
        connection_id = %ctx.connection_id,
        remote_addr = %ctx.remote_addr,
        "connection closed"
    );
}

async fn send_reply(
    socket: &mut WebSocket,
    codec: &mut MqttCodec,
    reply: Reply,
) -> Result<(), SendError> {
    let name = reply.name();
    let mut buf = BytesMut::new();
    codec
        .encode(reply, &mut buf)
        .map_err(|err| SendError::Encode(name, err))?;
    socket.send(Message::Binary(buf.freeze())).await?;
    Ok(())
}

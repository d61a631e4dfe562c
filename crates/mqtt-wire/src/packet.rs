use bytes::Bytes;

use crate::codec::CodecError;

/// MQTT delivery guarantee requested by a PUBLISH or SUBSCRIBE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for QoS {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(CodecError::InvalidQos(other)),
        }
    }
}

/// A decoded CONNECT packet.
///
/// Will message and password are consumed from the wire but not retained;
/// the bridge never acts on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub username: Option<String>,
}

/// A decoded PUBLISH packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: QoS,
    /// Present only when `qos` is above [`QoS::AtMostOnce`].
    pub message_id: Option<u16>,
    pub dup: bool,
    pub retain: bool,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub topic_filter: String,
    pub qos: QoS,
}

/// A decoded SUBSCRIBE packet. Always carries at least one filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub message_id: u16,
    pub filters: Vec<SubscribeFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub message_id: u16,
    pub topic_filters: Vec<String>,
}

/// Packets a client may send to the broker side of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
    PingReq,
    Disconnect,
}

impl Packet {
    /// Upper-case packet name, as used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::PingReq => "PINGREQ",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

/// CONNACK return codes defined by MQTT 3.1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

/// Packets the broker side sends back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    ConnAck {
        session_present: bool,
        return_code: ConnectReturnCode,
    },
    PubAck {
        message_id: u16,
    },
    SubAck {
        message_id: u16,
        granted: Vec<QoS>,
    },
    UnsubAck {
        message_id: u16,
    },
    PingResp,
}

impl Reply {
    pub fn name(&self) -> &'static str {
        match self {
            Reply::ConnAck { .. } => "CONNACK",
            Reply::PubAck { .. } => "PUBACK",
            Reply::SubAck { .. } => "SUBACK",
            Reply::UnsubAck { .. } => "UNSUBACK",
            Reply::PingResp => "PINGRESP",
        }
    }
}

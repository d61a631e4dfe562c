use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::packet::{
    Connect, Packet, Publish, QoS, Reply, Subscribe, SubscribeFilter, Unsubscribe,
};

/// Default upper bound on a single packet's remaining length.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 256 * 1024;

/// Largest value the variable-length remaining-length field can carry.
const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Errors produced while decoding client packets or encoding replies.
///
/// Every variant is fatal for the connection: once framing is lost the
/// byte stream cannot be resynchronised.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed remaining length")]
    MalformedRemainingLength,

    #[error("packet of {size} bytes exceeds the {max} byte limit")]
    PacketTooLarge { size: usize, max: usize },

    #[error("unsupported packet type {0}")]
    UnsupportedPacketType(u8),

    #[error("invalid flags {flags:#06b} for {packet} packet")]
    InvalidFlags { packet: &'static str, flags: u8 },

    #[error("invalid QoS level {0}")]
    InvalidQos(u8),

    #[error("unsupported protocol level {0}")]
    UnsupportedProtocolLevel(u8),

    #[error("packet truncated")]
    Truncated,

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed {0} packet")]
    Malformed(&'static str),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broker-side MQTT 3.1 / 3.1.1 codec: decodes [`Packet`]s sent by clients
/// and encodes [`Reply`] packets.
///
/// The decoder is fed from an accumulating buffer, so packets may be split
/// across transport frames and one frame may carry several packets.
#[derive(Debug, Clone)]
pub struct MqttCodec {
    max_packet_size: usize,
}

impl MqttCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

}

impl Default for MqttCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl Decoder for MqttCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        let Some((header_len, remaining_len)) = parse_fixed_header(src)? else {
            return Ok(None);
        };

        if remaining_len > self.max_packet_size {
            return Err(CodecError::PacketTooLarge {
                size: remaining_len,
                max: self.max_packet_size,
            });
        }

        let frame_len = header_len + remaining_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let first = src[0];
        let mut body = src.split_to(frame_len).freeze();
        body.advance(header_len);

        decode_packet(first, body).map(Some)
    }
}

impl Encoder<Reply> for MqttCodec {
    type Error = CodecError;

    fn encode(&mut self, reply: Reply, dst: &mut BytesMut) -> Result<(), CodecError> {
        match reply {
            Reply::ConnAck {
                session_present,
                return_code,
            } => {
                dst.reserve(4);
                dst.put_u8(0x20);
                dst.put_u8(0x02);
                dst.put_u8(u8::from(session_present));
                dst.put_u8(return_code as u8);
            }
            Reply::PubAck { message_id } => {
                dst.reserve(4);
                dst.put_u8(0x40);
                dst.put_u8(0x02);
                dst.put_u16(message_id);
            }
            Reply::SubAck {
                message_id,
                granted,
            } => {
                let remaining = 2 + granted.len();
                dst.reserve(5 + remaining);
                dst.put_u8(0x90);
                write_remaining_length(remaining, dst)?;
                dst.put_u16(message_id);
                for qos in granted {
                    dst.put_u8(qos.as_u8());
                }
            }
            Reply::UnsubAck { message_id } => {
                dst.reserve(4);
                dst.put_u8(0xB0);
                dst.put_u8(0x02);
                dst.put_u16(message_id);
            }
            Reply::PingResp => {
                dst.reserve(2);
                dst.put_u8(0xD0);
                dst.put_u8(0x00);
            }
        }
        Ok(())
    }
}

/// Parse the fixed header at the front of `src` without consuming it.
///
/// Returns `(header_len, remaining_len)` once the whole remaining-length
/// field is buffered, or `None` if more bytes are needed.
fn parse_fixed_header(src: &[u8]) -> Result<Option<(usize, usize)>, CodecError> {
    let mut value = 0usize;
    let mut shift = 0u32;

    for (index, byte) in src.iter().skip(1).enumerate() {
        if index == 4 {
            return Err(CodecError::MalformedRemainingLength);
        }
        value |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some((index + 2, value)));
        }
        shift += 7;
    }

    Ok(None)
}

fn write_remaining_length(mut len: usize, dst: &mut BytesMut) -> Result<(), CodecError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(CodecError::PacketTooLarge {
            size: len,
            max: MAX_REMAINING_LENGTH,
        });
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

fn decode_packet(first: u8, mut body: Bytes) -> Result<Packet, CodecError> {
    let packet_type = first >> 4;
    let flags = first & 0x0F;

    match packet_type {
        1 => decode_connect(&mut body).map(Packet::Connect),
        3 => decode_publish(flags, &mut body).map(Packet::Publish),
        4 => read_u16(&mut body).map(Packet::PubAck),
        5 => read_u16(&mut body).map(Packet::PubRec),
        6 => read_u16(&mut body).map(Packet::PubRel),
        7 => read_u16(&mut body).map(Packet::PubComp),
        8 => {
            expect_flags("SUBSCRIBE", flags, 0b0010)?;
            decode_subscribe(&mut body).map(Packet::Subscribe)
        }
        10 => {
            expect_flags("UNSUBSCRIBE", flags, 0b0010)?;
            decode_unsubscribe(&mut body).map(Packet::Unsubscribe)
        }
        12 => Ok(Packet::PingReq),
        14 => Ok(Packet::Disconnect),
        other => Err(CodecError::UnsupportedPacketType(other)),
    }
}

fn decode_connect(body: &mut Bytes) -> Result<Connect, CodecError> {
    let protocol_name = read_string(body)?;
    let protocol_level = read_u8(body)?;
    // 3 = MQTT 3.1 ("MQIsdp"), 4 = MQTT 3.1.1 ("MQTT"). MQTT 5 adds a
    // property block this codec does not parse.
    if !matches!(protocol_level, 3 | 4) {
        return Err(CodecError::UnsupportedProtocolLevel(protocol_level));
    }

    let connect_flags = read_u8(body)?;
    if connect_flags & 0x01 != 0 {
        return Err(CodecError::Malformed("CONNECT"));
    }
    let keep_alive = read_u16(body)?;
    let client_id = read_string(body)?;

    if connect_flags & 0x04 != 0 {
        let _will_topic = read_string(body)?;
        let _will_message = read_binary(body)?;
    }
    let username = if connect_flags & 0x80 != 0 {
        Some(read_string(body)?)
    } else {
        None
    };
    if connect_flags & 0x40 != 0 {
        let _password = read_binary(body)?;
    }

    Ok(Connect {
        protocol_name,
        protocol_level,
        clean_session: connect_flags & 0x02 != 0,
        keep_alive,
        client_id,
        username,
    })
}

fn decode_publish(flags: u8, body: &mut Bytes) -> Result<Publish, CodecError> {
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let topic = read_string(body)?;
    let message_id = match qos {
        QoS::AtMostOnce => None,
        QoS::AtLeastOnce | QoS::ExactlyOnce => match read_u16(body)? {
            0 => return Err(CodecError::Malformed("PUBLISH")),
            id => Some(id),
        },
    };

    Ok(Publish {
        topic,
        qos,
        message_id,
        dup: flags & 0x08 != 0,
        retain: flags & 0x01 != 0,
        payload: body.split_off(0),
    })
}

fn decode_subscribe(body: &mut Bytes) -> Result<Subscribe, CodecError> {
    let message_id = read_u16(body)?;
    let mut filters = Vec::new();
    while body.has_remaining() {
        let topic_filter = read_string(body)?;
        let qos = QoS::try_from(read_u8(body)? & 0x03)?;
        filters.push(SubscribeFilter { topic_filter, qos });
    }
    if filters.is_empty() {
        return Err(CodecError::Malformed("SUBSCRIBE"));
    }
    Ok(Subscribe {
        message_id,
        filters,
    })
}

fn decode_unsubscribe(body: &mut Bytes) -> Result<Unsubscribe, CodecError> {
    let message_id = read_u16(body)?;
    let mut topic_filters = Vec::new();
    while body.has_remaining() {
        topic_filters.push(read_string(body)?);
    }
    if topic_filters.is_empty() {
        return Err(CodecError::Malformed("UNSUBSCRIBE"));
    }
    Ok(Unsubscribe {
        message_id,
        topic_filters,
    })
}

fn expect_flags(packet: &'static str, flags: u8, expected: u8) -> Result<(), CodecError> {
    if flags == expected {
        Ok(())
    } else {
        Err(CodecError::InvalidFlags { packet, flags })
    }
}

fn read_u8(body: &mut Bytes) -> Result<u8, CodecError> {
    if body.remaining() < 1 {
        return Err(CodecError::Truncated);
    }
    Ok(body.get_u8())
}

fn read_u16(body: &mut Bytes) -> Result<u16, CodecError> {
    if body.remaining() < 2 {
        return Err(CodecError::Truncated);
    }
    Ok(body.get_u16())
}

fn read_binary(body: &mut Bytes) -> Result<Bytes, CodecError> {
    let len = usize::from(read_u16(body)?);
    if body.remaining() < len {
        return Err(CodecError::Truncated);
    }
    Ok(body.split_to(len))
}

fn read_string(body: &mut Bytes) -> Result<String, CodecError> {
    let raw = read_binary(body)?;
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ConnectReturnCode;

    fn decode_all(bytes: &[u8]) -> Vec<Packet> {
        let mut codec = MqttCodec::default();
        let mut buf = BytesMut::from(bytes);
        let mut packets = Vec::new();
        while let Some(packet) = codec.decode(&mut buf).unwrap() {
            packets.push(packet);
        }
        assert!(buf.is_empty(), "leftover bytes: {buf:?}");
        packets
    }

    fn encode(reply: Reply) -> Vec<u8> {
        let mut buf = BytesMut::new();
        MqttCodec::default().encode(reply, &mut buf).unwrap();
        buf.to_vec()
    }

    /// CONNECT from client "c1", MQTT 3.1.1, clean session, keep-alive 60.
    const CONNECT: &[u8] = &[
        0x10, 0x0E, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x02, b'c',
        b'1',
    ];

    // -----------------------------------------------------------------------
    // decoding
    // -----------------------------------------------------------------------

    #[test]
    fn decodes_connect() {
        let packets = decode_all(CONNECT);
        match &packets[..] {
            [Packet::Connect(connect)] => {
                assert_eq!(connect.protocol_name, "MQTT");
                assert_eq!(connect.protocol_level, 4);
                assert!(connect.clean_session);
                assert_eq!(connect.keep_alive, 60);
                assert_eq!(connect.client_id, "c1");
                assert!(connect.username.is_none());
            }
            other => panic!("expected CONNECT, got {other:?}"),
        }
    }

    #[test]
    fn decodes_connect_with_will_and_credentials() {
        let bytes = [
            0x10, 0x19, // fixed header
            0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, // protocol
            0xC6, // username, password, will, clean session
            0x00, 0x0A, // keep-alive
            0x00, 0x01, b'c', // client id
            0x00, 0x01, b'w', // will topic
            0x00, 0x01, b'x', // will message
            0x00, 0x01, b'u', // username
            0x00, 0x01, b'p', // password
        ];
        let packets = decode_all(&bytes);
        match &packets[..] {
            [Packet::Connect(connect)] => {
                assert_eq!(connect.client_id, "c");
                assert_eq!(connect.username.as_deref(), Some("u"));
            }
            other => panic!("expected CONNECT, got {other:?}"),
        }
    }

    #[test]
    fn rejects_mqtt5_connect() {
        let mut bytes = CONNECT.to_vec();
        bytes[8] = 0x05;
        let mut buf = BytesMut::from(&bytes[..]);
        let err = MqttCodec::default().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedProtocolLevel(5)));
    }

    #[test]
    fn decodes_qos0_publish_without_message_id() {
        let bytes = [0x30, 0x06, 0x00, 0x01, b'X', b'{', b'}', b'\n'];
        let packets = decode_all(&bytes);
        match &packets[..] {
            [Packet::Publish(publish)] => {
                assert_eq!(publish.topic, "X");
                assert_eq!(publish.qos, QoS::AtMostOnce);
                assert_eq!(publish.message_id, None);
                assert_eq!(&publish.payload[..], b"{}\n");
            }
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    #[test]
    fn decodes_qos1_publish_with_message_id_and_flags() {
        let bytes = [0x3B, 0x07, 0x00, 0x01, b'X', 0x00, 0x07, b'h', b'i'];
        let packets = decode_all(&bytes);
        match &packets[..] {
            [Packet::Publish(publish)] => {
                assert_eq!(publish.qos, QoS::AtLeastOnce);
                assert_eq!(publish.message_id, Some(7));
                assert!(publish.dup);
                assert!(publish.retain);
                assert_eq!(&publish.payload[..], b"hi");
            }
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    #[test]
    fn qos1_publish_with_zero_message_id_is_rejected() {
        let mut buf = BytesMut::from(&[0x32, 0x07, 0x00, 0x01, b'X', 0x00, 0x00, b'h', b'i'][..]);
        let err = MqttCodec::default().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Malformed("PUBLISH")), "got {err:?}");
    }

    #[test]
    fn publish_with_qos3_is_rejected() {
        let mut buf = BytesMut::from(&[0x36, 0x03, 0x00, 0x01, b'X'][..]);
        let err = MqttCodec::default().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::InvalidQos(3)));
    }

    #[test]
    fn decodes_subscribe_with_multiple_filters() {
        let bytes = [
            0x82, 0x0C, 0x00, 0x09, 0x00, 0x02, b'a', b'/', 0x01, 0x00, 0x02, b'b', b'#', 0x02,
        ];
        let packets = decode_all(&bytes);
        match &packets[..] {
            [Packet::Subscribe(subscribe)] => {
                assert_eq!(subscribe.message_id, 9);
                assert_eq!(subscribe.filters.len(), 2);
                assert_eq!(subscribe.filters[0].topic_filter, "a/");
                assert_eq!(subscribe.filters[0].qos, QoS::AtLeastOnce);
                assert_eq!(subscribe.filters[1].qos, QoS::ExactlyOnce);
            }
            other => panic!("expected SUBSCRIBE, got {other:?}"),
        }
    }

    #[test]
    fn subscribe_with_wrong_flags_is_rejected() {
        let mut buf = BytesMut::from(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x00][..]);
        let err = MqttCodec::default().decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            CodecError::InvalidFlags {
                packet: "SUBSCRIBE",
                flags: 0
            }
        ));
    }

    #[test]
    fn subscribe_without_filters_is_malformed() {
        let mut buf = BytesMut::from(&[0x82, 0x02, 0x00, 0x01][..]);
        let err = MqttCodec::default().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Malformed("SUBSCRIBE")));
    }

    #[test]
    fn decodes_unsubscribe() {
        let bytes = [0xA2, 0x05, 0x00, 0x03, 0x00, 0x01, b't'];
        let packets = decode_all(&bytes);
        assert_eq!(
            packets,
            vec![Packet::Unsubscribe(Unsubscribe {
                message_id: 3,
                topic_filters: vec!["t".to_string()],
            })]
        );
    }

    #[test]
    fn decodes_control_packets_back_to_back() {
        let bytes = [0xC0, 0x00, 0x40, 0x02, 0x00, 0x05, 0xE0, 0x00];
        let packets = decode_all(&bytes);
        assert_eq!(
            packets,
            vec![Packet::PingReq, Packet::PubAck(5), Packet::Disconnect]
        );
    }

    #[test]
    fn partial_packet_waits_for_more_bytes() {
        let mut codec = MqttCodec::default();
        let mut buf = BytesMut::from(&CONNECT[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 5, "partial input must not be consumed");

        buf.extend_from_slice(&CONNECT[5..]);
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Packet::Connect(_))
        ));
    }

    #[test]
    fn lone_type_byte_waits_for_length() {
        let mut buf = BytesMut::from(&[0x30][..]);
        assert!(MqttCodec::default().decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn multi_byte_remaining_length() {
        // 200-byte payload: remaining length 205 encodes as 0xCD 0x01.
        let mut bytes = vec![0x30, 0xCD, 0x01, 0x00, 0x03, b'a', b'/', b'b'];
        bytes.extend(std::iter::repeat(b'z').take(200));
        let packets = decode_all(&bytes);
        match &packets[..] {
            [Packet::Publish(publish)] => assert_eq!(publish.payload.len(), 200),
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    #[test]
    fn five_byte_remaining_length_is_malformed() {
        let mut buf = BytesMut::from(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01][..]);
        let err = MqttCodec::default().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::MalformedRemainingLength));
    }

    #[test]
    fn oversized_packet_is_rejected_before_buffering() {
        let mut codec = MqttCodec::new(16);
        let mut buf = BytesMut::from(&[0x30, 0x20][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            CodecError::PacketTooLarge { size: 32, max: 16 }
        ));
    }

    #[test]
    fn truncated_topic_is_rejected() {
        let mut buf = BytesMut::from(&[0x30, 0x03, 0x00, 0x05, b'a'][..]);
        let err = MqttCodec::default().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Truncated));
    }

    #[test]
    fn invalid_utf8_topic_is_rejected() {
        let mut buf = BytesMut::from(&[0x30, 0x03, 0x00, 0x01, 0xFF][..]);
        let err = MqttCodec::default().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::InvalidUtf8));
    }

    #[test]
    fn server_only_packet_types_are_rejected() {
        let mut buf = BytesMut::from(&[0x20, 0x02, 0x00, 0x00][..]);
        let err = MqttCodec::default().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedPacketType(2)));
    }

    // -----------------------------------------------------------------------
    // encoding
    // -----------------------------------------------------------------------

    #[test]
    fn encodes_connack() {
        let bytes = encode(Reply::ConnAck {
            session_present: false,
            return_code: ConnectReturnCode::Accepted,
        });
        assert_eq!(bytes, vec![0x20, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn encodes_puback() {
        assert_eq!(
            encode(Reply::PubAck { message_id: 7 }),
            vec![0x40, 0x02, 0x00, 0x07]
        );
    }

    #[test]
    fn encodes_suback_with_granted_levels() {
        let bytes = encode(Reply::SubAck {
            message_id: 0x0102,
            granted: vec![QoS::AtLeastOnce, QoS::AtMostOnce],
        });
        assert_eq!(bytes, vec![0x90, 0x04, 0x01, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn encodes_unsuback_and_pingresp() {
        assert_eq!(
            encode(Reply::UnsubAck { message_id: 3 }),
            vec![0xB0, 0x02, 0x00, 0x03]
        );
        assert_eq!(encode(Reply::PingResp), vec![0xD0, 0x00]);
    }

    #[test]
    fn remaining_length_encoding_spans_bytes() {
        let mut buf = BytesMut::new();
        write_remaining_length(321, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0xC1, 0x02]);
    }
}

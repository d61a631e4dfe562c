//! Broker-side MQTT 3.1 / 3.1.1 wire codec.
//!
//! Only the packets an ingress-only broker needs are modelled: everything a
//! client can send is decoded into [`Packet`], and the acknowledgements the
//! bridge sends back are encoded from [`Reply`]. The codec implements the
//! `tokio_util` [`Decoder`](tokio_util::codec::Decoder) and
//! [`Encoder`](tokio_util::codec::Encoder) traits so it can sit behind a
//! `Framed` stream or be driven by hand from an accumulating buffer, which is
//! how the WebSocket session uses it.

pub mod codec;
pub mod packet;

pub use codec::{CodecError, MqttCodec, DEFAULT_MAX_PACKET_SIZE};
pub use packet::{
    Connect, ConnectReturnCode, Packet, Publish, QoS, Reply, Subscribe, SubscribeFilter,
    Unsubscribe,
};

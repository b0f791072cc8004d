//! Optional unreliable downstream broadcast.
//!
//! When enabled, the relay duplicates every `REL_CLI_DOWNSTREAM_DATA`
//! over UDP so clients on a shared medium can pick it up without waiting
//! on TCP delivery. Datagrams carry the LLD protocol prefix
//! `u32 version | u32 key-size | bytes`; clients fall back to the TCP
//! copy whenever a datagram is lost, so delivery here is best-effort.

use std::net::SocketAddr;

use bytes::{Buf, BufMut, BytesMut};
use tokio::net::UdpSocket;
use tracing::debug;

use super::Error;
use crate::message::{Downstream, Message};

/// LLD protocol version spoken on the broadcast channel.
pub const LLD_PROTOCOL_VERSION: u32 = 3;

/// Relay-side UDP fan-out.
pub struct Broadcaster {
    socket: UdpSocket,
    targets: Vec<SocketAddr>,
}

impl Broadcaster {
    pub async fn bind() -> Result<Self, Error> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            socket,
            targets: Vec::new(),
        })
    }

    /// Replaces the target set (one entry per client).
    pub fn set_targets(&mut self, targets: Vec<SocketAddr>) {
        self.targets = targets;
    }

    /// Broadcasts one downstream cell; losses are logged, never fatal.
    pub async fn send(&self, downstream: &Downstream) {
        let message = Message::DownstreamUdp(downstream.clone());
        let payload = message.encode_payload();
        let mut datagram = BytesMut::with_capacity(8 + 2 + payload.len());
        datagram.put_u32(LLD_PROTOCOL_VERSION);
        datagram.put_u32((2 + payload.len()) as u32);
        datagram.put_u16(message.tag());
        datagram.extend_from_slice(&payload);
        for target in &self.targets {
            if let Err(e) = self.socket.send_to(&datagram, target).await {
                debug!(%target, error = %e, "udp broadcast failed");
            }
        }
    }
}

/// Parses one received datagram into a downstream message.
pub fn parse_datagram(datagram: &[u8]) -> Result<Downstream, Error> {
    let mut buf = datagram;
    if buf.remaining() < 10 {
        return Err(crate::codec::Error::EndOfBuffer.into());
    }
    let version = buf.get_u32();
    if version != LLD_PROTOCOL_VERSION {
        return Err(crate::codec::Error::UnknownMessage(version as u16).into());
    }
    let size = buf.get_u32() as usize;
    if size < 2 || size > buf.remaining() {
        return Err(crate::codec::Error::InvalidLength(size).into());
    }
    let message_type = buf.get_u16();
    let mut payload = &buf[..size - 2];
    match Message::decode_payload(message_type, &mut payload)? {
        Message::DownstreamUdp(downstream) | Message::Downstream(downstream) => Ok(downstream),
        other => Err(crate::codec::Error::UnknownMessage(other.tag()).into()),
    }
}

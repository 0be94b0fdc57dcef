//! Wire codec.
//!
//! A frame has three parts: the client identity, a JSON header and a raw
//! payload. The header is a `Message` tagged by `"type"`; messages that carry
//! bytes (`packet`, `field-set`, `event`) put them in the payload part.
//!
//! The UDP transport flattens the header and payload into one datagram:
//!
//! ```text
//! +----------------+-----------------+-----------------+
//! | header len u16 | header (JSON)   | payload         |
//! | big endian     | header len B    | rest            |
//! +----------------+-----------------+-----------------+
//! ```
//!
//! The identity is the datagram's source address.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use crate::messages::Message;

/// Length of a client identity in bytes.
pub const CLIENT_ID_LEN: usize = 18;

/// Opaque transport identity of a connected node process.
///
/// Built from the peer's socket address: 16 bytes of IPv6 (IPv4 peers are
/// mapped) followed by the port in big-endian order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub [u8; CLIENT_ID_LEN]);

impl From<SocketAddr> for ClientId {
    fn from(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        let mut bytes = [0u8; CLIENT_ID_LEN];
        bytes[..16].copy_from_slice(&ip.octets());
        bytes[16..].copy_from_slice(&addr.port().to_be_bytes());
        ClientId(bytes)
    }
}

impl ClientId {
    pub fn to_socket_addr(&self) -> SocketAddr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.0[..16]);
        let ip = Ipv6Addr::from(octets);
        let port = u16::from_be_bytes([self.0[16], self.0[17]]);
        match ip.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), port),
            None => SocketAddr::new(IpAddr::V6(ip), port),
        }
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

/// `[identity][header][payload]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub client: ClientId,
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Fewer bytes than the layout requires.
    Truncated { needed: usize, available: usize },
    /// The header is not a valid message.
    Header(String),
    /// The message can only travel from the simulator to a node.
    Direction(&'static str),
    /// Payload bytes on a message that carries none.
    UnexpectedPayload(&'static str),
    /// The header does not fit the 16-bit length prefix.
    TooLarge(usize),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Truncated { needed, available } => write!(f, "truncated frame: need {} bytes, have {}", needed, available),
            CodecError::Header(msg) => write!(f, "invalid header: {}", msg),
            CodecError::Direction(kind) => write!(f, "'{}' cannot be sent by a node", kind),
            CodecError::UnexpectedPayload(kind) => write!(f, "'{}' does not carry a payload", kind),
            CodecError::TooLarge(len) => write!(f, "header of {} bytes exceeds the length prefix", len),
        }
    }
}

impl std::error::Error for CodecError {}

/// Decode a frame received from a node.
pub fn decode_frame(frame: Frame) -> Result<(ClientId, Message), CodecError> {
    let mut message: Message = serde_json::from_slice(&frame.header).map_err(|e| CodecError::Header(e.to_string()))?;
    if !message.is_node_originated() {
        return Err(CodecError::Direction(message.kind()));
    }
    if !message.set_payload(frame.payload) {
        return Err(CodecError::UnexpectedPayload(message.kind()));
    }
    Ok((frame.client, message))
}

/// Encode a message for delivery to `client`.
pub fn encode_frame(client: ClientId, message: &Message) -> Result<Frame, CodecError> {
    let header = serde_json::to_vec(message).map_err(|e| CodecError::Header(e.to_string()))?;
    Ok(Frame {
        client,
        header,
        payload: message.payload().to_vec(),
    })
}

/// Split a datagram from `client` into a frame.
pub fn decode_datagram(client: ClientId, bytes: &[u8]) -> Result<Frame, CodecError> {
    let Some(prefix) = bytes.get(..2) else {
        return Err(CodecError::Truncated {
            needed: 2,
            available: bytes.len(),
        });
    };
    let header_len = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;
    let body = &bytes[2..];
    if body.len() < header_len {
        return Err(CodecError::Truncated {
            needed: 2 + header_len,
            available: bytes.len(),
        });
    }
    let (header, payload) = body.split_at(header_len);
    Ok(Frame {
        client,
        header: header.to_vec(),
        payload: payload.to_vec(),
    })
}

pub fn encode_datagram(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let header_len = u16::try_from(frame.header.len()).map_err(|_| CodecError::TooLarge(frame.header.len()))?;
    let mut bytes = Vec::with_capacity(2 + frame.header.len() + frame.payload.len());
    bytes.extend_from_slice(&header_len.to_be_bytes());
    bytes.extend_from_slice(&frame.header);
    bytes.extend_from_slice(&frame.payload);
    Ok(bytes)
}

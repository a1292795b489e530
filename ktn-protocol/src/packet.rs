//! KTN Packet Structures and Serialization
//!
//! A packet carries a sequence number, an acknowledgment number, exactly one
//! control flag, the source and destination endpoints, an optional payload
//! and a checksum computed over every other field.
//!
//! # Wire format
//!
//! All multi-byte integers are big-endian.
//!
//! ```text
//! +--------+--------+------+----------+----------+----------+-------------+---------+
//! | seq 32 | ack 32 | flag | src addr | dst addr | checksum | payload len | payload |
//! |        |        |  8   |          |          |    16    |     16      |   ...   |
//! +--------+--------+------+----------+----------+----------+-------------+---------+
//! ```
//!
//! Each address is encoded as `family (4 | 6) | ip octets | port`.

use crate::sequence::SeqNumber;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Maximum payload carried by a single data packet
pub const MAX_PAYLOAD_SIZE: usize = 1400;

/// Encoded size of an IPv4 endpoint (family + octets + port)
const V4_ENDPOINT_SIZE: usize = 1 + 4 + 2;

/// Encoded size of an IPv6 endpoint (family + octets + port)
const V6_ENDPOINT_SIZE: usize = 1 + 16 + 2;

/// Size of the fixed fields surrounding the two endpoints
const FIXED_SIZE: usize = 4 + 4 + 1 + 2 + 2;

/// Smallest well-formed packet: two IPv4 endpoints and no payload
pub const MIN_PACKET_SIZE: usize = FIXED_SIZE + 2 * V4_ENDPOINT_SIZE;

/// Largest encoded packet: IPv6 endpoints and a full payload
pub const MAX_PACKET_SIZE: usize = FIXED_SIZE + 2 * V6_ENDPOINT_SIZE + MAX_PAYLOAD_SIZE;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Control flag carried by every packet. Exactly one per packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Flag {
    /// Data packet
    None = 0,
    /// Handshake initiation
    Syn = 1,
    /// Handshake reply
    SynAck = 2,
    /// Acknowledgment
    Ack = 3,
    /// Close initiation
    Fin = 4,
}

impl Flag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Flag::None),
            1 => Some(Flag::Syn),
            2 => Some(Flag::SynAck),
            3 => Some(Flag::Ack),
            4 => Some(Flag::Fin),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Everything except data is a control packet
    #[inline]
    pub fn is_control(self) -> bool {
        self != Flag::None
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Flag::None => "DATA",
            Flag::Syn => "SYN",
            Flag::SynAck => "SYN_ACK",
            Flag::Ack => "ACK",
            Flag::Fin => "FIN",
        };
        f.write_str(name)
    }
}

/// A single datagram exchanged between two endpoints.
///
/// Construct packets through [`Packet::data`] or [`Packet::control`], which
/// seal the checksum. Fields are public so that fault injection can tamper
/// with them; a tampered packet no longer passes [`Packet::is_intact`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sender-assigned sequence number
    pub seq: SeqNumber,
    /// Sequence number being acknowledged (SYN_ACK and ACK only, else zero)
    pub ack: SeqNumber,
    /// Control flag
    pub flag: Flag,
    /// Sending endpoint
    pub source: SocketAddr,
    /// Receiving endpoint
    pub destination: SocketAddr,
    /// Application payload, present only on data packets
    pub payload: Option<Bytes>,
    /// Internet checksum over all other fields
    pub checksum: u16,
}

impl Packet {
    /// Create a sealed data packet
    pub fn data(seq: SeqNumber, source: SocketAddr, destination: SocketAddr, payload: Bytes) -> Self {
        Packet {
            seq,
            ack: SeqNumber::default(),
            flag: Flag::None,
            source,
            destination,
            payload: Some(payload),
            checksum: 0,
        }
        .sealed()
    }

    /// Create a sealed control packet
    ///
    /// `ack` is only meaningful for SYN_ACK and ACK; pass zero otherwise.
    pub fn control(
        flag: Flag,
        seq: SeqNumber,
        ack: SeqNumber,
        source: SocketAddr,
        destination: SocketAddr,
    ) -> Self {
        debug_assert!(flag.is_control(), "control packet built with DATA flag");
        Packet {
            seq,
            ack,
            flag,
            source,
            destination,
            payload: None,
            checksum: 0,
        }
        .sealed()
    }

    fn sealed(mut self) -> Self {
        self.checksum = self.compute_checksum();
        self
    }

    /// Recompute the checksum over every field except the carried checksum
    pub fn compute_checksum(&self) -> u16 {
        let mut buf = BytesMut::with_capacity(self.size());
        self.put_fields(&mut buf, None);
        internet_checksum(&buf)
    }

    /// Check the carried checksum against a fresh computation
    #[inline]
    pub fn is_intact(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// A packet is valid for a receiver if it is addressed to that receiver
    /// and its checksum is intact.
    pub fn is_valid_for(&self, local: SocketAddr) -> bool {
        self.destination == local && self.is_intact()
    }

    /// Check if this is a data packet
    #[inline]
    pub fn is_data(&self) -> bool {
        self.flag == Flag::None
    }

    /// Payload length in bytes (zero for control packets)
    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Bytes::len)
    }

    /// Total encoded size of the packet
    pub fn size(&self) -> usize {
        FIXED_SIZE
            + endpoint_size(&self.source)
            + endpoint_size(&self.destination)
            + self.payload_len()
    }

    /// Serialize the packet to bytes
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());
        self.put_fields(&mut buf, Some(self.checksum));
        buf
    }

    fn put_fields(&self, buf: &mut BytesMut, checksum: Option<u16>) {
        buf.put_u32(self.seq.as_raw());
        buf.put_u32(self.ack.as_raw());
        buf.put_u8(self.flag.as_u8());
        put_endpoint(buf, &self.source);
        put_endpoint(buf, &self.destination);
        if let Some(checksum) = checksum {
            buf.put_u16(checksum);
        }
        let payload = self.payload.as_deref().unwrap_or(&[]);
        buf.put_u16(payload.len() as u16);
        buf.put_slice(payload);
    }

    /// Parse a packet from bytes
    ///
    /// Decoding does not verify the checksum; a packet with a bad checksum
    /// decodes fine and fails [`Packet::is_intact`] instead.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < MIN_PACKET_SIZE {
            return Err(PacketError::InsufficientData {
                expected: MIN_PACKET_SIZE,
                actual: bytes.len(),
            });
        }

        let mut buf = bytes;
        let seq = SeqNumber::new(buf.get_u32());
        let ack = SeqNumber::new(buf.get_u32());
        let raw_flag = buf.get_u8();
        let flag = Flag::from_u8(raw_flag).ok_or(PacketError::InvalidFlag(raw_flag))?;
        let source = get_endpoint(&mut buf)?;
        let destination = get_endpoint(&mut buf)?;

        if buf.remaining() < 4 {
            return Err(PacketError::Truncated);
        }
        let checksum = buf.get_u16();
        let payload_len = buf.get_u16() as usize;

        if buf.remaining() != payload_len {
            return Err(PacketError::LengthMismatch {
                declared: payload_len,
                actual: buf.remaining(),
            });
        }

        let payload = match flag {
            Flag::None => Some(Bytes::copy_from_slice(buf)),
            _ if payload_len > 0 => return Err(PacketError::UnexpectedPayload(flag)),
            _ => None,
        };

        Ok(Packet {
            seq,
            ack,
            flag,
            source,
            destination,
            payload,
            checksum,
        })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} seq={} ack={} {} -> {}",
            self.flag, self.seq, self.ack, self.source, self.destination
        )?;
        if self.is_data() {
            write!(f, " ({} bytes)", self.payload_len())?;
        }
        Ok(())
    }
}

fn endpoint_size(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => V4_ENDPOINT_SIZE,
        SocketAddr::V6(_) => V6_ENDPOINT_SIZE,
    }
}

fn put_endpoint(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(FAMILY_V4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(FAMILY_V6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(addr.port());
}

fn get_endpoint(buf: &mut &[u8]) -> Result<SocketAddr, PacketError> {
    if buf.remaining() < 1 {
        return Err(PacketError::Truncated);
    }
    let family = buf.get_u8();
    let ip = match family {
        FAMILY_V4 => {
            if buf.remaining() < 4 + 2 {
                return Err(PacketError::Truncated);
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_V6 => {
            if buf.remaining() < 16 + 2 {
                return Err(PacketError::Truncated);
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(PacketError::InvalidAddressFamily(other)),
    };
    let port = buf.get_u16();
    Ok(SocketAddr::new(ip, port))
}

/// 16-bit ones'-complement Internet checksum (RFC 1071)
///
/// An odd trailing byte is padded with zero on the right.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Packet parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Truncated packet")]
    Truncated,

    #[error("Invalid flag: {0}")]
    InvalidFlag(u8),

    #[error("Invalid address family: {0}")]
    InvalidAddressFamily(u8),

    #[error("Payload length mismatch: declared {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("{0} packet carries a payload")]
    UnexpectedPayload(Flag),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SocketAddr {
        "127.0.0.1:8001".parse().unwrap()
    }

    fn server() -> SocketAddr {
        "127.0.0.1:8002".parse().unwrap()
    }

    #[test]
    fn test_flag_codes() {
        for flag in [Flag::None, Flag::Syn, Flag::SynAck, Flag::Ack, Flag::Fin] {
            assert_eq!(Flag::from_u8(flag.as_u8()), Some(flag));
        }
        assert_eq!(Flag::from_u8(9), None);
        assert!(!Flag::None.is_control());
        assert!(Flag::Fin.is_control());
    }

    #[test]
    fn test_data_packet_serialization() {
        let payload = Bytes::from_static(b"Line one");
        let packet = Packet::data(SeqNumber::new(3), client(), server(), payload.clone());
        assert!(packet.is_intact());

        let decoded = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.payload, Some(payload));
        assert!(decoded.is_valid_for(server()));
    }

    #[test]
    fn test_control_packet_serialization() {
        let packet = Packet::control(
            Flag::SynAck,
            SeqNumber::new(100),
            SeqNumber::new(1),
            server(),
            client(),
        );
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), MIN_PACKET_SIZE);

        let decoded = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.flag, Flag::SynAck);
        assert_eq!(decoded.ack, SeqNumber::new(1));
        assert_eq!(decoded.payload, None);
    }

    #[test]
    fn test_ipv6_endpoints() {
        let src: SocketAddr = "[::1]:9000".parse().unwrap();
        let dst: SocketAddr = "[::1]:9001".parse().unwrap();
        let packet = Packet::data(SeqNumber::new(7), src, dst, Bytes::from_static(b"v6"));
        let decoded = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(decoded.source, src);
        assert_eq!(decoded.destination, dst);
        assert!(decoded.is_intact());
    }

    #[test]
    fn test_validity_requires_destination() {
        let packet = Packet::control(Flag::Syn, SeqNumber::new(1), SeqNumber::default(), client(), server());
        assert!(packet.is_valid_for(server()));
        assert!(!packet.is_valid_for(client()));
    }

    #[test]
    fn test_tampered_fields_fail_checksum() {
        let packet = Packet::data(SeqNumber::new(3), client(), server(), Bytes::from_static(b"abc"));

        let mut tampered = packet.clone();
        tampered.seq = SeqNumber::new(4);
        assert!(!tampered.is_intact());

        let mut tampered = packet.clone();
        tampered.payload = Some(Bytes::from_static(b"abd"));
        assert!(!tampered.is_intact());

        let mut tampered = packet;
        tampered.checksum ^= 0x0100;
        assert!(!tampered.is_intact());
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            Packet::from_bytes(&[0u8; 4]),
            Err(PacketError::InsufficientData { .. })
        ));

        let packet = Packet::control(Flag::Ack, SeqNumber::new(2), SeqNumber::new(100), client(), server());
        let mut bytes = packet.to_bytes();
        bytes[8] = 42;
        assert_eq!(Packet::from_bytes(&bytes), Err(PacketError::InvalidFlag(42)));

        let mut bytes = packet.to_bytes();
        bytes[9] = 5;
        assert_eq!(
            Packet::from_bytes(&bytes),
            Err(PacketError::InvalidAddressFamily(5))
        );

        let mut bytes = packet.to_bytes();
        bytes.put_u8(0xAA);
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(PacketError::LengthMismatch { declared: 0, actual: 1 })
        ));
    }

    #[test]
    fn test_internet_checksum_reference() {
        // RFC 1071 example words: 0x0001 0xf203 0xf4f5 0xf6f7
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(internet_checksum(&data), !0xddf2);
        assert_eq!(internet_checksum(&[0xAB]), !0xAB00);
    }
}

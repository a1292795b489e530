//! KTN Protocol Core
//!
//! This crate implements a simplified TCP over an unreliable datagram
//! network: the wire packet with its Internet checksum, local port
//! bookkeeping, the retransmission timer, the connection state machine
//! (three-way handshake and four-step teardown) and the stop-and-wait
//! reliable transfer engine built on top of it.

pub mod config;
pub mod connection;
pub mod network;
pub mod packet;
pub mod ports;
pub mod sequence;
pub mod timer;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use config::ProtocolConfig;
pub use connection::{Connection, ConnectionError, ConnectionState, ConnectionStats};
pub use network::{send_with_retry, Datagram, NetworkError};
pub use packet::{Flag, Packet, PacketError, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE};
pub use ports::{PortError, PortLease, PortRegistry};
pub use sequence::SeqNumber;
pub use timer::{Deadline, RetransmitTimer, TimerReport};
pub use transfer::Delivery;

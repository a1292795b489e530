//! KTN I/O
//!
//! Implementations of the [`Datagram`](ktn_protocol::Datagram) contract the
//! protocol core runs on: a UDP transport, an in-process memory network for
//! tests and demos, and a fault-injecting wrapper that makes either of them
//! unreliable.

pub mod memory;
pub mod simulator;
pub mod socket;

pub use memory::{MemoryDatagram, MemoryNetwork};
pub use simulator::{FailureConfig, FailureStats, LossyNetwork};
pub use socket::{SocketError, UdpDatagram};

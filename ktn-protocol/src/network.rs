//! Unreliable datagram collaborator
//!
//! The connection engine only needs to hand a packet to the network and to
//! poll for the next inbound packet with a timeout. Anything implementing
//! [`Datagram`] can carry a connection: a UDP socket, an in-process test
//! network, or a fault-injecting wrapper around either.

use crate::packet::{Packet, PacketError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Attempts made for a single outbound packet before giving up
pub const SEND_ATTEMPTS: usize = 3;

/// Pause between send attempts
pub const SEND_BACKOFF: Duration = Duration::from_millis(5);

/// Network primitive errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("Address {0} is already attached")]
    AddressInUse(SocketAddr),

    #[error("Network endpoint is closed")]
    Closed,
}

/// Send/receive contract of the unreliable network
pub trait Datagram: Send + Sync {
    /// Endpoint this datagram handle receives on
    fn local_endpoint(&self) -> SocketAddr;

    /// Hand `packet` to the network, routed by its destination
    ///
    /// Fire-and-forget: success says nothing about delivery.
    fn send(&self, packet: &Packet) -> Result<(), NetworkError>;

    /// Wait up to `timeout` for the next inbound packet
    ///
    /// Returns `Ok(None)` when the timeout elapses without a packet.
    fn receive(&self, timeout: Duration) -> Result<Option<Packet>, NetworkError>;
}

impl<D: Datagram + ?Sized> Datagram for Arc<D> {
    fn local_endpoint(&self) -> SocketAddr {
        (**self).local_endpoint()
    }

    fn send(&self, packet: &Packet) -> Result<(), NetworkError> {
        (**self).send(packet)
    }

    fn receive(&self, timeout: Duration) -> Result<Option<Packet>, NetworkError> {
        (**self).receive(timeout)
    }
}

/// Send `packet`, retrying transient failures a bounded number of times
pub fn send_with_retry(network: &dyn Datagram, packet: &Packet) -> Result<(), NetworkError> {
    let mut attempt = 1;
    loop {
        match network.send(packet) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < SEND_ATTEMPTS => {
                tracing::debug!(attempt, error = %e, "send failed, retrying");
                attempt += 1;
                thread::sleep(SEND_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }
}

//! In-process datagram network
//!
//! A [`MemoryNetwork`] is a hub that routes encoded packets between
//! [`MemoryDatagram`] endpoints over crossbeam channels. It behaves like a
//! perfect UDP network: packets to unknown endpoints vanish, nothing is lost
//! or reordered otherwise. Wrap an endpoint in a
//! [`LossyNetwork`](crate::simulator::LossyNetwork) to make it unreliable.

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use ktn_protocol::network::{Datagram, NetworkError};
use ktn_protocol::packet::Packet;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

type Routes = Arc<Mutex<HashMap<SocketAddr, Sender<Bytes>>>>;

/// Shared routing table of attached endpoints
///
/// Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    routes: Routes,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint at `addr`
    pub fn attach(&self, addr: SocketAddr) -> Result<MemoryDatagram, NetworkError> {
        let mut routes = self.routes.lock();
        if routes.contains_key(&addr) {
            return Err(NetworkError::AddressInUse(addr));
        }

        let (tx, rx) = channel::unbounded();
        routes.insert(addr, tx);
        tracing::debug!(%addr, "attached memory endpoint");

        Ok(MemoryDatagram {
            local: addr,
            inbox: rx,
            routes: Arc::clone(&self.routes),
        })
    }

    /// Check whether an endpoint is attached at `addr`
    pub fn is_attached(&self, addr: SocketAddr) -> bool {
        self.routes.lock().contains_key(&addr)
    }

    fn route(routes: &Routes, packet: &Packet) {
        let destination = packet.destination;
        let route = routes.lock().get(&destination).cloned();
        match route {
            Some(tx) => {
                // Receiver gone means the endpoint is detaching; same as no route
                let _ = tx.send(packet.to_bytes().freeze());
            }
            None => tracing::trace!(%destination, "no endpoint attached, packet dropped"),
        }
    }
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let routes = self.routes.lock();
        f.debug_struct("MemoryNetwork")
            .field("endpoints", &routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// An endpoint attached to a [`MemoryNetwork`]; detaches on drop
pub struct MemoryDatagram {
    local: SocketAddr,
    inbox: Receiver<Bytes>,
    routes: Routes,
}

impl Datagram for MemoryDatagram {
    fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    fn send(&self, packet: &Packet) -> Result<(), NetworkError> {
        MemoryNetwork::route(&self.routes, packet);
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Option<Packet>, NetworkError> {
        loop {
            let bytes = match self.inbox.recv_timeout(timeout) {
                Ok(bytes) => bytes,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(NetworkError::Closed),
            };
            match Packet::from_bytes(&bytes) {
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => tracing::debug!(error = %e, "dropped undecodable datagram"),
            }
        }
    }
}

impl Drop for MemoryDatagram {
    fn drop(&mut self) {
        self.routes.lock().remove(&self.local);
        tracing::debug!(addr = %self.local, "detached memory endpoint");
    }
}

impl fmt::Debug for MemoryDatagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDatagram")
            .field("local", &self.local)
            .field("queued", &self.inbox.len())
            .finish()
    }
}

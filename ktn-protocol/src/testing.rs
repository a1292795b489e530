//! Scripted datagram endpoint for unit tests

use crate::network::{Datagram, NetworkError};
use crate::packet::Packet;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Replays injected packets in order and records everything sent
pub(crate) struct Wire {
    local: SocketAddr,
    inbox: Mutex<VecDeque<Packet>>,
    sent: Mutex<Vec<Packet>>,
}

impl Wire {
    pub(crate) fn new(local: SocketAddr) -> Arc<Self> {
        Arc::new(Wire {
            local,
            inbox: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn inject(&self, packet: Packet) {
        self.inbox.lock().push_back(packet);
    }

    pub(crate) fn sent(&self) -> Vec<Packet> {
        self.sent.lock().clone()
    }
}

impl Datagram for Wire {
    fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    fn send(&self, packet: &Packet) -> Result<(), NetworkError> {
        self.sent.lock().push(packet.clone());
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Option<Packet>, NetworkError> {
        if let Some(packet) = self.inbox.lock().pop_front() {
            return Ok(Some(packet));
        }
        thread::sleep(timeout);
        Ok(None)
    }
}

//! UDP transport for KTN
//!
//! Carries encoded packets in UDP datagrams. Each packet travels in exactly
//! one datagram addressed to the packet's destination endpoint.

use ktn_protocol::network::{Datagram, NetworkError};
use ktn_protocol::packet::{Packet, MAX_PACKET_SIZE};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use thiserror::Error;

/// Socket configuration errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid socket address")]
    InvalidAddress,
}

/// UDP-backed [`Datagram`] endpoint
pub struct UdpDatagram {
    socket: UdpSocket,
    local: SocketAddr,
    /// Last read timeout applied to the socket, to skip redundant syscalls
    read_timeout: Mutex<Option<Duration>>,
}

impl UdpDatagram {
    /// Bind a UDP socket to `addr`
    ///
    /// Binding port 0 picks an ephemeral port; [`Datagram::local_endpoint`]
    /// reports the port actually bound.
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;

        let local = socket
            .local_addr()?
            .as_socket()
            .ok_or(SocketError::InvalidAddress)?;
        let socket: UdpSocket = socket.into();

        tracing::debug!(%local, "bound UDP datagram endpoint");
        Ok(UdpDatagram {
            socket,
            local,
            read_timeout: Mutex::new(None),
        })
    }

    fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        // A zero read timeout is rejected by the OS
        let timeout = timeout.max(Duration::from_millis(1));
        let mut current = self.read_timeout.lock();
        if *current != Some(timeout) {
            self.socket.set_read_timeout(Some(timeout))?;
            *current = Some(timeout);
        }
        Ok(())
    }
}

impl Datagram for UdpDatagram {
    fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    fn send(&self, packet: &Packet) -> Result<(), NetworkError> {
        let bytes = packet.to_bytes();
        self.socket.send_to(&bytes, packet.destination)?;
        tracing::trace!(%packet, "sent datagram");
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Option<Packet>, NetworkError> {
        self.set_read_timeout(timeout)?;

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (n, from) = match self.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Ok(None);
            }
            // ICMP port unreachable from an earlier send surfaces here on some platforms
            Err(e) if e.kind() == ErrorKind::ConnectionReset => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match Packet::from_bytes(&buf[..n]) {
            Ok(packet) => Ok(Some(packet)),
            Err(e) => {
                tracing::debug!(%from, error = %e, "dropped undecodable datagram");
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for UdpDatagram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpDatagram").field("local", &self.local).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ktn_protocol::sequence::SeqNumber;

    #[test]
    fn test_bind_reports_ephemeral_port() {
        let socket = UdpDatagram::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(socket.local_endpoint().port() > 0);
    }

    #[test]
    fn test_send_receive_packet() {
        let sender = UdpDatagram::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let receiver = UdpDatagram::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        let packet = Packet::data(
            SeqNumber::new(3),
            sender.local_endpoint(),
            receiver.local_endpoint(),
            Bytes::from_static(b"Hello, KTN!"),
        );
        sender.send(&packet).unwrap();

        let received = receiver.receive(Duration::from_millis(500)).unwrap().unwrap();
        assert_eq!(received, packet);
        assert!(received.is_valid_for(receiver.local_endpoint()));
    }

    #[test]
    fn test_receive_times_out() {
        let socket = UdpDatagram::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(socket.receive(Duration::from_millis(10)).unwrap().is_none());
        assert!(socket.receive(Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn test_garbage_is_dropped() {
        let receiver = UdpDatagram::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.send_to(b"not a packet", receiver.local_endpoint()).unwrap();

        assert!(receiver.receive(Duration::from_millis(200)).unwrap().is_none());
    }

    #[test]
    fn test_ipv6() {
        // May fail on systems without IPv6
        if let Ok(socket) = UdpDatagram::bind("[::1]:0".parse().unwrap()) {
            assert!(socket.local_endpoint().is_ipv6());
        }
    }
}

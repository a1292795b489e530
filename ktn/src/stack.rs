//! Connection factory
//!
//! A [`Stack`] owns the port registry shared by every connection it
//! creates, the protocol timing, and an optional failure profile that turns
//! each new endpoint into a [`LossyNetwork`].

use ktn_io::{FailureConfig, LossyNetwork, MemoryNetwork, SocketError, UdpDatagram};
use ktn_protocol::{
    Connection, ConnectionError, Datagram, NetworkError, PortError, PortRegistry, ProtocolConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while binding a connection
#[derive(Error, Debug)]
pub enum StackError {
    #[error("Port error: {0}")]
    Port(#[from] PortError),

    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// Factory for bound, CLOSED connections
#[derive(Debug, Clone, Default)]
pub struct Stack {
    ports: PortRegistry,
    config: ProtocolConfig,
    failures: Option<FailureConfig>,
}

impl Stack {
    pub fn new(config: ProtocolConfig) -> Self {
        Stack {
            ports: PortRegistry::new(),
            config,
            failures: None,
        }
    }

    /// Make every endpoint bound from now on unreliable
    pub fn with_failures(mut self, failures: FailureConfig) -> Self {
        self.failures = (!failures.is_reliable()).then_some(failures);
        self
    }

    /// Port registry shared by this stack's connections
    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Bind a connection to a UDP socket at `addr`
    ///
    /// The port is claimed before the socket is opened. Port 0 binds an
    /// ephemeral port and claims whatever port the OS picked.
    pub fn bind(&self, addr: SocketAddr) -> Result<Connection, StackError> {
        if addr.port() == 0 {
            let socket = UdpDatagram::bind(addr)?;
            let lease = self.ports.claim(socket.local_endpoint().port())?;
            return Ok(Connection::with_lease(self.wrap(socket), lease, self.config));
        }

        let lease = self.ports.claim(addr.port())?;
        let socket = UdpDatagram::bind(addr)?;
        Ok(Connection::with_lease(self.wrap(socket), lease, self.config))
    }

    /// Bind a connection to an in-process endpoint at `addr` on `network`
    pub fn bind_memory(
        &self,
        network: &MemoryNetwork,
        addr: SocketAddr,
    ) -> Result<Connection, StackError> {
        let lease = self.ports.claim(addr.port())?;
        let endpoint = network.attach(addr)?;
        Ok(Connection::with_lease(self.wrap(endpoint), lease, self.config))
    }

    fn wrap<D: Datagram + 'static>(&self, endpoint: D) -> Arc<dyn Datagram> {
        match self.failures {
            Some(failures) => {
                tracing::debug!(local = %endpoint.local_endpoint(), ?failures, "endpoint is lossy");
                Arc::new(LossyNetwork::new(endpoint, failures))
            }
            None => Arc::new(endpoint),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktn_protocol::ConnectionState;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_bind_memory_claims_port() {
        let stack = Stack::new(ProtocolConfig::fast());
        let network = MemoryNetwork::new();

        let conn = stack.bind_memory(&network, addr(8001)).unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(stack.ports().is_claimed(8001));

        assert!(matches!(
            stack.bind_memory(&network, addr(8001)),
            Err(StackError::Port(PortError::InUse(8001)))
        ));

        drop(conn);
        assert!(!stack.ports().is_claimed(8001));
    }

    #[test]
    fn test_bind_udp_ephemeral() {
        let stack = Stack::new(ProtocolConfig::fast());
        let conn = stack.bind(addr(0)).unwrap();
        let port = conn.local_endpoint().port();
        assert!(port > 0);
        assert!(stack.ports().is_claimed(port));
    }

    #[test]
    fn test_reliable_failures_are_ignored() {
        let stack = Stack::default().with_failures(FailureConfig::reliable());
        assert!(stack.failures.is_none());
    }
}

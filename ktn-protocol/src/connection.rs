//! KTN Connection State Machine
//!
//! Drives a connection from CLOSED through the three-way handshake, data
//! transfer and the asymmetric four-step teardown. Every blocking step pairs
//! a [`RetransmitTimer`] for the outbound packet with a polling loop that
//! reads inbound packets until the expected reply arrives or the step's
//! deadline passes.
//!
//! ```text
//!  CLOSED --connect/SYN--> SYN_SENT --SYN_ACK/ACK--> ESTABLISHED
//!  CLOSED --accept--> LISTEN --SYN--> SYN_RCVD --ACK--> ESTABLISHED (new Connection)
//!
//!  ESTABLISHED --close/FIN--> FIN_WAIT_1 --ACK--> FIN_WAIT_2 --FIN/ACK--> TIME_WAIT --> CLOSED
//!  ESTABLISHED --peer FIN--> CLOSE_WAIT --close/FIN--> LAST_ACK --ACK--> CLOSED
//! ```
//!
//! A connection has a single owner; its methods take `&mut self` and run on
//! the caller's thread. Send/receive logic lives in [`crate::transfer`].

use crate::config::ProtocolConfig;
use crate::network::{send_with_retry, Datagram, NetworkError};
use crate::packet::{Flag, Packet, PacketError};
use crate::ports::{PortError, PortLease, PortRegistry};
use crate::sequence::SeqNumber;
use crate::timer::{Deadline, RetransmitTimer};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    TimeWait,
    CloseWait,
    LastAck,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Listen => "LISTEN",
            ConnectionState::SynSent => "SYN_SENT",
            ConnectionState::SynRcvd => "SYN_RCVD",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::FinWait1 => "FIN_WAIT_1",
            ConnectionState::FinWait2 => "FIN_WAIT_2",
            ConnectionState::TimeWait => "TIME_WAIT",
            ConnectionState::CloseWait => "CLOSE_WAIT",
            ConnectionState::LastAck => "LAST_ACK",
        };
        f.write_str(name)
    }
}

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("No connection (state {state})")]
    NotConnected { state: ConnectionState },

    #[error("Operation not valid in state {0}")]
    InvalidState(ConnectionState),

    #[error("Packet {seq} was never acknowledged")]
    DeliveryFailed { seq: SeqNumber },

    #[error("FIN was not acknowledged, destination is gone")]
    TeardownFailed,

    #[error("Local port has been released")]
    PortReleased,

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("Port error: {0}")]
    Port(#[from] PortError),

    #[error("IO error: {0}")]
    Network(#[from] NetworkError),
}

/// Connection statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Distinct packets put on the network
    pub packets_sent: u64,
    /// Extra copies sent by retransmission timers
    pub packets_retransmitted: u64,
    /// Packets accepted in sequence
    pub packets_received: u64,
    /// Packets dropped for a bad checksum or a foreign destination
    pub packets_invalid: u64,
    /// Packets dropped because they came from someone other than the peer
    pub packets_foreign: u64,
    /// Packets dropped for an unexpected sequence number
    pub packets_stale: u64,
    /// Stale packets behind the expected sequence number (repeats)
    pub packets_duplicate: u64,
    /// In-sequence packets the current wait had no use for
    pub packets_unexpected: u64,
    /// Cached ACKs resent in answer to stale packets
    pub reacks_sent: u64,
    /// Application bytes acknowledged by the peer
    pub bytes_sent: u64,
    /// Application bytes delivered to the caller
    pub bytes_received: u64,
}

/// A reliable, in-order, stop-and-wait connection
pub struct Connection {
    pub(crate) state: ConnectionState,
    pub(crate) local: SocketAddr,
    pub(crate) remote: Option<SocketAddr>,
    pub(crate) network: Arc<dyn Datagram>,
    pub(crate) lease: Option<PortLease>,
    pub(crate) config: ProtocolConfig,
    /// Sequence number for the next packet we construct
    pub(crate) next_seq: SeqNumber,
    /// Sequence number the next accepted inbound packet must carry
    pub(crate) next_expected: Option<SeqNumber>,
    /// Most recently sent ACK, resent when the peer repeats itself
    pub(crate) last_ack: Option<Packet>,
    /// The peer's FIN, kept for the length of the teardown
    pub(crate) disconnect_request: Option<Packet>,
    pub(crate) stats: ConnectionStats,
}

impl Connection {
    /// Bind a CLOSED connection to the network's local endpoint, claiming
    /// its port in `ports`
    pub fn bind(
        network: Arc<dyn Datagram>,
        ports: &PortRegistry,
        config: ProtocolConfig,
    ) -> Result<Self, ConnectionError> {
        let lease = ports.claim(network.local_endpoint().port())?;
        Ok(Self::with_lease(network, lease, config))
    }

    /// Create a CLOSED connection on an already claimed port
    pub fn with_lease(network: Arc<dyn Datagram>, lease: PortLease, config: ProtocolConfig) -> Self {
        let local = network.local_endpoint();
        debug_assert_eq!(local.port(), lease.port());

        Connection {
            state: ConnectionState::Closed,
            local,
            remote: None,
            network,
            lease: Some(lease),
            config,
            next_seq: config.client_initial_seq,
            next_expected: None,
            last_ack: None,
            disconnect_request: None,
            stats: ConnectionStats::default(),
        }
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get local endpoint
    pub fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    /// Get remote endpoint (unset while CLOSED or listening)
    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Sequence number the next accepted inbound packet must carry
    pub fn next_expected_seq(&self) -> Option<SeqNumber> {
        self.next_expected
    }

    /// Sequence number the next outbound packet will carry
    pub fn next_seq(&self) -> SeqNumber {
        self.next_seq
    }

    /// Get connection statistics
    pub fn stats(&self) -> ConnectionStats {
        self.stats.clone()
    }

    /// Get the protocol configuration
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Check if connection is established
    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    /// Check whether the connection still holds its local port
    pub fn is_bound(&self) -> bool {
        self.lease.is_some()
    }

    /// Establish a connection to `remote` (client side).
    ///
    /// Sends SYN with retransmission and waits for the SYN_ACK that
    /// acknowledges it, then answers with a single ACK.
    pub fn connect(&mut self, remote: SocketAddr) -> Result<(), ConnectionError> {
        self.ensure_bound()?;
        if self.state != ConnectionState::Closed {
            return Err(ConnectionError::InvalidState(self.state));
        }

        self.reset_session();
        self.remote = Some(remote);
        self.next_seq = self.config.client_initial_seq;

        let syn = self.control_packet(Flag::Syn, SeqNumber::default())?;
        let syn_seq = syn.seq;
        self.transition(ConnectionState::SynSent);

        let reply = self.await_reply(&syn, self.config.step_timeout, |p| {
            p.flag == Flag::SynAck && p.ack == syn_seq
        });
        let synack = match reply {
            Ok(Some(synack)) => synack,
            Ok(None) => {
                self.reset_session();
                return Err(ConnectionError::Timeout("Connection"));
            }
            Err(e) => {
                self.reset_session();
                return Err(e);
            }
        };

        self.send_ack(&synack)?;
        self.transition(ConnectionState::Established);
        tracing::info!(local = %self.local, %remote, "connection established");
        Ok(())
    }

    /// Listen for and accept one incoming connection.
    ///
    /// Blocks until a SYN arrives, then completes the handshake and returns
    /// a new ESTABLISHED connection sharing this connection's local port.
    /// This connection returns to CLOSED and can accept again.
    ///
    /// The accepted connection reads from the same datagram endpoint as the
    /// listener. Do not call `accept` again while an accepted connection is
    /// still sending or receiving: both would consume each other's packets.
    pub fn accept(&mut self) -> Result<Connection, ConnectionError> {
        self.ensure_bound()?;
        if self.state != ConnectionState::Closed {
            return Err(ConnectionError::InvalidState(self.state));
        }

        let accepted = self.accept_handshake();
        self.reset_session();
        accepted
    }

    fn accept_handshake(&mut self) -> Result<Connection, ConnectionError> {
        self.reset_session();
        self.transition(ConnectionState::Listen);

        let syn = loop {
            let Some(packet) = self.poll(self.config.poll_interval)? else {
                continue;
            };
            if packet.flag == Flag::Syn {
                break packet;
            }
            self.stats.packets_unexpected += 1;
            tracing::warn!(%packet, "dropped non-SYN packet while listening");
        };
        self.stats.packets_received += 1;

        self.remote = Some(syn.source);
        self.next_expected = Some(syn.seq.next());
        self.next_seq = self.config.server_initial_seq;
        self.transition(ConnectionState::SynRcvd);

        let synack = self.control_packet(Flag::SynAck, syn.seq)?;
        let synack_seq = synack.seq;
        let ack = self.await_reply(&synack, self.config.step_timeout, |p| {
            p.flag == Flag::Ack && p.ack == synack_seq
        })?;
        if ack.is_none() {
            return Err(ConnectionError::Timeout("Destination"));
        }

        let accepted = Connection {
            state: ConnectionState::Established,
            local: self.local,
            remote: self.remote,
            network: Arc::clone(&self.network),
            lease: self.lease.clone(),
            config: self.config,
            next_seq: self.next_seq,
            next_expected: self.next_expected,
            last_ack: None,
            disconnect_request: None,
            stats: ConnectionStats::default(),
        };
        tracing::info!(local = %self.local, remote = %syn.source, "accepted connection");
        Ok(accepted)
    }

    /// Close the connection.
    ///
    /// From ESTABLISHED this runs the initiator side of the teardown
    /// (FIN_WAIT_1, FIN_WAIT_2, TIME_WAIT). From CLOSE_WAIT it runs the
    /// receiver side (LAST_ACK). Either way the connection ends CLOSED and
    /// releases its local port, even when the teardown itself fails.
    pub fn close(&mut self) -> Result<(), ConnectionError> {
        let result = match self.state {
            ConnectionState::Established => self.close_initiator(),
            ConnectionState::CloseWait => self.close_receiver(),
            _ => Ok(()),
        };

        self.transition(ConnectionState::Closed);
        self.reset_session();
        if self.lease.take().is_some() {
            tracing::info!(local = %self.local, "connection closed");
        }
        result
    }

    fn close_initiator(&mut self) -> Result<(), ConnectionError> {
        let fin = self.control_packet(Flag::Fin, SeqNumber::default())?;
        let fin_seq = fin.seq;
        self.transition(ConnectionState::FinWait1);

        let ack = self.await_reply(&fin, self.config.step_timeout, |p| {
            p.flag == Flag::Ack && p.ack == fin_seq
        })?;
        if ack.is_none() {
            tracing::warn!(local = %self.local, "FIN was not acknowledged");
            return Err(ConnectionError::TeardownFailed);
        }
        self.transition(ConnectionState::FinWait2);

        let Some(peer_fin) = self.wait_for(self.config.close_wait_timeout(), |p| p.flag == Flag::Fin)?
        else {
            tracing::warn!(local = %self.local, "peer never sent its FIN");
            return Ok(());
        };

        self.transition(ConnectionState::TimeWait);
        self.send_ack(&peer_fin)?;
        self.disconnect_request = Some(peer_fin);
        self.drain_time_wait()
    }

    /// Absorb duplicate FINs for one step timeout.
    ///
    /// A repeated FIN is behind the expected sequence number, so the stale
    /// filter answers it with the cached ACK for the disconnect request.
    fn drain_time_wait(&mut self) -> Result<(), ConnectionError> {
        let deadline = Deadline::after(self.config.step_timeout);
        while !deadline.expired() {
            if let Some(packet) = self.poll(deadline.next_poll(self.config.poll_interval))? {
                self.admit(&packet, |_| false)?;
            }
        }
        Ok(())
    }

    fn close_receiver(&mut self) -> Result<(), ConnectionError> {
        let fin = self.control_packet(Flag::Fin, SeqNumber::default())?;
        let fin_seq = fin.seq;
        self.transition(ConnectionState::LastAck);

        let ack = self.await_reply(&fin, self.config.step_timeout, |p| {
            p.flag == Flag::Ack && p.ack == fin_seq
        })?;
        if ack.is_none() {
            tracing::warn!(local = %self.local, "final ACK never arrived, closing anyway");
        }
        Ok(())
    }

    /// Retransmit `outbound` until a packet matching `wanted` is accepted or
    /// `budget` runs out. The timer is stopped before this returns.
    pub(crate) fn await_reply<F>(
        &mut self,
        outbound: &Packet,
        budget: Duration,
        wanted: F,
    ) -> Result<Option<Packet>, ConnectionError>
    where
        F: Fn(&Packet) -> bool,
    {
        let timer = RetransmitTimer::start(
            Arc::clone(&self.network),
            outbound.clone(),
            self.config.retransmit_interval,
        );
        let reply = self.wait_for(budget, wanted);
        let report = timer.cancel();

        if report.transmissions > 0 {
            self.stats.packets_sent += 1;
            self.stats.packets_retransmitted += report.transmissions - 1;
        }

        match reply? {
            Some(packet) => Ok(Some(packet)),
            None => match report.last_error {
                Some(e) if report.transmissions == 0 => Err(e.into()),
                _ => Ok(None),
            },
        }
    }

    /// Poll the network until a packet matching `wanted` is accepted or
    /// `budget` runs out
    pub(crate) fn wait_for<F>(
        &mut self,
        budget: Duration,
        wanted: F,
    ) -> Result<Option<Packet>, ConnectionError>
    where
        F: Fn(&Packet) -> bool,
    {
        let deadline = Deadline::after(budget);
        while !deadline.expired() {
            let Some(packet) = self.poll(deadline.next_poll(self.config.poll_interval))? else {
                continue;
            };
            if self.admit(&packet, &wanted)? {
                return Ok(Some(packet));
            }
        }
        Ok(None)
    }

    /// Hand out the next outbound sequence number
    pub(crate) fn take_seq(&mut self) -> SeqNumber {
        let seq = self.next_seq;
        self.next_seq.increment();
        seq
    }

    pub(crate) fn remote_or_err(&self) -> Result<SocketAddr, ConnectionError> {
        self.remote
            .ok_or(ConnectionError::NotConnected { state: self.state })
    }

    fn control_packet(&mut self, flag: Flag, ack: SeqNumber) -> Result<Packet, ConnectionError> {
        let remote = self.remote_or_err()?;
        Ok(Packet::control(flag, self.take_seq(), ack, self.local, remote))
    }

    /// Send a one-shot ACK for `acked` and cache it for re-acknowledgment
    pub(crate) fn send_ack(&mut self, acked: &Packet) -> Result<(), ConnectionError> {
        let ack = self.control_packet(Flag::Ack, acked.seq)?;
        send_with_retry(self.network.as_ref(), &ack)?;
        tracing::trace!(packet = %ack, "sent ACK");
        self.stats.packets_sent += 1;
        self.last_ack = Some(ack);
        Ok(())
    }

    fn ensure_bound(&self) -> Result<(), ConnectionError> {
        if self.lease.is_none() {
            return Err(ConnectionError::PortReleased);
        }
        Ok(())
    }

    pub(crate) fn ensure_established(&self) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Established {
            return Err(ConnectionError::NotConnected { state: self.state });
        }
        Ok(())
    }

    pub(crate) fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            tracing::debug!(local = %self.local, from = %self.state, to = %next, "state change");
            self.state = next;
        }
    }

    /// Forget everything about the current peer and return to CLOSED
    fn reset_session(&mut self) {
        self.state = ConnectionState::Closed;
        self.remote = None;
        self.next_expected = None;
        self.last_ack = None;
        self.disconnect_request = None;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("next_seq", &self.next_seq)
            .field("next_expected", &self.next_expected)
            .finish()
    }
}

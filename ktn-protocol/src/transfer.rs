//! Reliable transfer engine
//!
//! Stop-and-wait delivery on top of an ESTABLISHED [`Connection`]: one data
//! packet in flight, retransmitted until its ACK arrives. Inbound packets
//! pass two filters before a wait sees them:
//!
//! 1. validity: addressed to us with an intact checksum, and sent by the
//!    peer once one is known. Anything else is dropped silently.
//! 2. sequence: the packet must carry exactly the next expected sequence
//!    number. A mismatch is stale; unless it is itself an ACK we answer it
//!    with the cached last ACK, since the peer is evidently still waiting
//!    for it.
//!
//! Only a packet that passes both filters and that the current wait wants
//! advances the expected sequence number.

use crate::connection::{Connection, ConnectionError, ConnectionState};
use crate::network::send_with_retry;
use crate::packet::{Flag, Packet, PacketError, MAX_PAYLOAD_SIZE};
use crate::timer::Deadline;
use bytes::Bytes;
use std::time::Duration;

/// Outcome of a successful [`Connection::receive`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Next in-order message from the peer
    Data(String),
    /// The peer closed the connection; it is now CLOSED locally as well
    EndOfStream,
}

impl Delivery {
    /// Message text, if this is a data delivery
    pub fn into_data(self) -> Option<String> {
        match self {
            Delivery::Data(message) => Some(message),
            Delivery::EndOfStream => None,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Delivery::EndOfStream)
    }
}

enum Inbound {
    Data(Packet),
    Fin(Packet),
}

impl Connection {
    /// Send one message and block until the peer acknowledges it.
    pub fn send(&mut self, message: impl AsRef<[u8]>) -> Result<(), ConnectionError> {
        self.ensure_established()?;

        let payload = message.as_ref();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PacketError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            }
            .into());
        }

        let remote = self.remote_or_err()?;
        let seq = self.take_seq();
        let packet = Packet::data(seq, self.local, remote, Bytes::copy_from_slice(payload));

        let ack = self.await_reply(&packet, self.config.step_timeout, |p| {
            p.flag == Flag::Ack && p.ack == seq
        })?;
        if ack.is_none() {
            tracing::warn!(%seq, %remote, "data packet was never acknowledged");
            return Err(ConnectionError::DeliveryFailed { seq });
        }

        self.stats.bytes_sent += payload.len() as u64;
        tracing::debug!(%seq, bytes = payload.len(), "delivered");
        Ok(())
    }

    /// Block until the next message arrives.
    ///
    /// A FIN from the peer ends the stream: it is acknowledged, the
    /// connection runs the receiver side of the teardown and
    /// [`Delivery::EndOfStream`] is returned.
    pub fn receive(&mut self) -> Result<Delivery, ConnectionError> {
        self.ensure_established()?;

        match self.next_inbound()? {
            Inbound::Data(packet) => {
                self.send_ack(&packet)?;
                let payload = packet.payload.unwrap_or_default();
                self.stats.bytes_received += payload.len() as u64;
                Ok(Delivery::Data(String::from_utf8_lossy(&payload).into_owned()))
            }
            Inbound::Fin(fin) => {
                tracing::info!(local = %self.local, remote = %fin.source, "peer closed the connection");
                self.send_ack(&fin)?;
                self.disconnect_request = Some(fin);
                self.transition(ConnectionState::CloseWait);
                self.close()?;
                Ok(Delivery::EndOfStream)
            }
        }
    }

    fn next_inbound(&mut self) -> Result<Inbound, ConnectionError> {
        let deadline = self.config.receive_timeout.map(Deadline::after);
        loop {
            let poll = match deadline {
                Some(deadline) if deadline.expired() => {
                    return Err(ConnectionError::Timeout("Receive"));
                }
                Some(deadline) => deadline.next_poll(self.config.poll_interval),
                None => self.config.poll_interval,
            };

            let Some(packet) = self.poll(poll)? else {
                continue;
            };
            if self.admit(&packet, |p| p.is_data() || p.flag == Flag::Fin)? {
                return Ok(if packet.flag == Flag::Fin {
                    Inbound::Fin(packet)
                } else {
                    Inbound::Data(packet)
                });
            }
        }
    }

    /// Receive one packet that passes the validity filter
    pub(crate) fn poll(&mut self, timeout: Duration) -> Result<Option<Packet>, ConnectionError> {
        let Some(packet) = self.network.receive(timeout)? else {
            return Ok(None);
        };

        if !packet.is_valid_for(self.local) {
            self.stats.packets_invalid += 1;
            tracing::trace!(%packet, "dropped invalid packet");
            return Ok(None);
        }
        if let Some(remote) = self.remote {
            if packet.source != remote {
                self.stats.packets_foreign += 1;
                tracing::trace!(%packet, %remote, "dropped packet from foreign endpoint");
                return Ok(None);
            }
        }
        Ok(Some(packet))
    }

    /// Apply the sequence filter to a valid packet.
    ///
    /// Returns true if the packet was consumed by the current wait.
    pub(crate) fn admit<F>(&mut self, packet: &Packet, wanted: F) -> Result<bool, ConnectionError>
    where
        F: Fn(&Packet) -> bool,
    {
        let Some(expected) = self.next_expected else {
            // Nothing negotiated yet: the reply we wait for seeds the counter
            if wanted(packet) {
                self.next_expected = Some(packet.seq.next());
                self.stats.packets_received += 1;
                return Ok(true);
            }
            self.stats.packets_unexpected += 1;
            return Ok(false);
        };

        if packet.seq != expected {
            self.stats.packets_stale += 1;
            if expected.is_ahead_of(packet.seq) {
                self.stats.packets_duplicate += 1;
                tracing::trace!(%packet, %expected, behind = -expected.distance_to(packet.seq), "dropped duplicate packet");
            } else {
                tracing::trace!(%packet, %expected, ahead = expected.distance_to(packet.seq), "dropped out-of-order packet");
            }
            if packet.flag != Flag::Ack {
                self.reack()?;
            }
            return Ok(false);
        }

        if !wanted(packet) {
            self.stats.packets_unexpected += 1;
            tracing::debug!(%packet, state = %self.state, "ignored unexpected packet");
            return Ok(false);
        }

        self.next_expected = Some(expected.next());
        self.stats.packets_received += 1;
        Ok(true)
    }

    /// Resend the cached ACK, if any
    fn reack(&mut self) -> Result<(), ConnectionError> {
        let Some(ack) = self.last_ack.as_ref() else {
            return Ok(());
        };
        send_with_retry(self.network.as_ref(), ack)?;
        tracing::trace!(packet = %ack, "resent last ACK");
        self.stats.reacks_sent += 1;
        Ok(())
    }
}

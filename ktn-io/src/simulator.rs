//! Fault-injecting datagram wrapper
//!
//! [`LossyNetwork`] wraps any [`Datagram`] and, on every send, rolls the
//! dice configured in [`FailureConfig`]: the packet may be lost, delayed,
//! duplicated (a "ghost" copy), or have a single bit flipped in its header
//! or payload. Corruption never recomputes the checksum, so the receiver's
//! validity check is what catches it.

use bytes::Bytes;
use ktn_protocol::network::{Datagram, NetworkError};
use ktn_protocol::packet::Packet;
use ktn_protocol::sequence::SeqNumber;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Failure probabilities applied to each outbound packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailureConfig {
    /// Probability the packet is never delivered
    pub loss_probability: f64,
    /// Probability delivery is postponed by up to `max_delay`
    pub delay_probability: f64,
    /// Upper bound on an injected delay
    pub max_delay: Duration,
    /// Probability an extra duplicate copy is delivered
    pub ghost_probability: f64,
    /// Probability of a bit flip in seq, ack or source port
    pub header_error_probability: f64,
    /// Probability of a bit flip in the payload
    pub payload_error_probability: f64,
    /// Restrict corruption to payloads
    pub payload_errors_only: bool,
    /// RNG seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for FailureConfig {
    fn default() -> Self {
        FailureConfig {
            loss_probability: 0.0,
            delay_probability: 0.0,
            max_delay: Duration::from_millis(50),
            ghost_probability: 0.0,
            header_error_probability: 0.0,
            payload_error_probability: 0.0,
            payload_errors_only: false,
            seed: None,
        }
    }
}

impl FailureConfig {
    /// A network that never misbehaves
    pub fn reliable() -> Self {
        Self::default()
    }

    /// Only random loss
    pub fn lossy(loss_probability: f64) -> Self {
        FailureConfig {
            loss_probability,
            ..Self::default()
        }
    }

    /// Fix the RNG seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Check if any failure is configured
    pub fn is_reliable(&self) -> bool {
        self.loss_probability <= 0.0
            && self.delay_probability <= 0.0
            && self.ghost_probability <= 0.0
            && self.header_error_probability <= 0.0
            && self.payload_error_probability <= 0.0
    }
}

/// Counters of injected failures
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureStats {
    pub sent: u64,
    pub lost: u64,
    pub delayed: u64,
    pub ghosts: u64,
    pub header_errors: u64,
    pub payload_errors: u64,
}

/// Unreliable wrapper around a [`Datagram`]
pub struct LossyNetwork<D> {
    inner: Arc<D>,
    config: FailureConfig,
    rng: Mutex<StdRng>,
    stats: Mutex<FailureStats>,
}

impl<D: Datagram + 'static> LossyNetwork<D> {
    pub fn new(inner: D, config: FailureConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        LossyNetwork {
            inner: Arc::new(inner),
            config,
            rng: Mutex::new(rng),
            stats: Mutex::new(FailureStats::default()),
        }
    }

    pub fn config(&self) -> &FailureConfig {
        &self.config
    }

    /// Get failure statistics
    pub fn stats(&self) -> FailureStats {
        self.stats.lock().clone()
    }

    /// Roll against `probability`; out-of-range values saturate
    fn roll(&self, probability: f64) -> bool {
        probability > 0.0 && self.rng.lock().random_bool(probability.min(1.0))
    }

    fn random_delay(&self) -> Duration {
        let max = self.config.max_delay.as_millis() as u64;
        Duration::from_millis(self.rng.lock().random_range(0..=max))
    }

    fn corrupt_header(&self, packet: &mut Packet) {
        let mut rng = self.rng.lock();
        match rng.random_range(0..3u8) {
            0 => {
                let bit = rng.random_range(0..32u32);
                packet.seq = SeqNumber::new(packet.seq.as_raw() ^ (1 << bit));
            }
            1 => {
                let bit = rng.random_range(0..32u32);
                packet.ack = SeqNumber::new(packet.ack.as_raw() ^ (1 << bit));
            }
            _ => {
                let bit = rng.random_range(0..16u32);
                let port = packet.source.port() ^ (1 << bit);
                packet.source.set_port(port);
            }
        }
    }

    /// Flip one payload bit; returns false if there is no payload to corrupt
    fn corrupt_payload(&self, packet: &mut Packet) -> bool {
        let Some(payload) = packet.payload.as_ref().filter(|p| !p.is_empty()) else {
            return false;
        };

        let mut bytes = payload.to_vec();
        let mut rng = self.rng.lock();
        let index = rng.random_range(0..bytes.len());
        bytes[index] ^= 1 << rng.random_range(0..8u32);
        packet.payload = Some(Bytes::from(bytes));
        true
    }

    fn send_later(&self, packet: Packet, delay: Duration) {
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || {
            thread::sleep(delay);
            if let Err(e) = inner.send(&packet) {
                tracing::debug!(%packet, error = %e, "delayed send failed");
            }
        });
    }
}

impl<D: Datagram + 'static> Datagram for LossyNetwork<D> {
    fn local_endpoint(&self) -> SocketAddr {
        self.inner.local_endpoint()
    }

    fn send(&self, packet: &Packet) -> Result<(), NetworkError> {
        self.stats.lock().sent += 1;

        if self.roll(self.config.loss_probability) {
            self.stats.lock().lost += 1;
            tracing::trace!(%packet, "simulated loss");
            return Ok(());
        }

        let mut outbound = packet.clone();
        if !self.config.payload_errors_only && self.roll(self.config.header_error_probability) {
            self.corrupt_header(&mut outbound);
            self.stats.lock().header_errors += 1;
            tracing::trace!(packet = %outbound, "simulated header corruption");
        }
        if self.roll(self.config.payload_error_probability) && self.corrupt_payload(&mut outbound) {
            self.stats.lock().payload_errors += 1;
            tracing::trace!(packet = %outbound, "simulated payload corruption");
        }

        if self.roll(self.config.ghost_probability) {
            self.stats.lock().ghosts += 1;
            tracing::trace!(packet = %outbound, "simulated ghost copy");
            self.send_later(outbound.clone(), self.random_delay());
        }

        if self.roll(self.config.delay_probability) {
            self.stats.lock().delayed += 1;
            let delay = self.random_delay();
            tracing::trace!(packet = %outbound, ?delay, "simulated delay");
            self.send_later(outbound, delay);
            return Ok(());
        }

        self.inner.send(&outbound)
    }

    fn receive(&self, timeout: Duration) -> Result<Option<Packet>, NetworkError> {
        self.inner.receive(timeout)
    }
}

impl<D> std::fmt::Debug for LossyNetwork<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LossyNetwork")
            .field("config", &self.config)
            .finish()
    }
}

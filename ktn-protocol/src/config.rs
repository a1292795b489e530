//! Protocol timing and sequence configuration

use crate::sequence::SeqNumber;
use std::time::Duration;

/// Default retransmission period
pub const DEFAULT_RETRANSMIT_INTERVAL: Duration = Duration::from_millis(100);

/// Default overall budget for one wait-for-reply step
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default per-attempt receive timeout
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Timing constants governing every handshake, transfer and teardown wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Period of the retransmission timer
    pub retransmit_interval: Duration,
    /// Overall budget for a single wait-for-reply step
    pub step_timeout: Duration,
    /// Receive timeout for each poll of the network
    pub poll_interval: Duration,
    /// FIN_WAIT_2 waits this many step timeouts for the peer's FIN
    pub close_wait_multiplier: u32,
    /// First sequence number of a client-initiated connection
    pub client_initial_seq: SeqNumber,
    /// First sequence number of a server-side connection
    pub server_initial_seq: SeqNumber,
    /// Optional bound on a blocking `receive()`; `None` blocks forever
    pub receive_timeout: Option<Duration>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            retransmit_interval: DEFAULT_RETRANSMIT_INTERVAL,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            close_wait_multiplier: 3,
            client_initial_seq: SeqNumber::new(1),
            server_initial_seq: SeqNumber::new(100),
            receive_timeout: None,
        }
    }
}

impl ProtocolConfig {
    /// Configuration with all waits scaled down, for tests and local demos
    pub fn fast() -> Self {
        ProtocolConfig {
            retransmit_interval: Duration::from_millis(20),
            step_timeout: Duration::from_millis(400),
            poll_interval: Duration::from_millis(5),
            ..Self::default()
        }
    }

    /// How long FIN_WAIT_2 waits for the peer's FIN
    pub fn close_wait_timeout(&self) -> Duration {
        self.step_timeout * self.close_wait_multiplier
    }
}

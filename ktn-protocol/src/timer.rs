//! Retransmission timer and wait deadlines
//!
//! A [`RetransmitTimer`] is bound to exactly one outbound packet. It sends
//! the packet immediately and then again every interval on a background
//! thread until it is cancelled. It knows nothing about protocol state; the
//! caller decides what reply ends the wait and how long to wait overall,
//! usually with a [`Deadline`].

use crate::network::{send_with_retry, Datagram, NetworkError};
use crate::packet::Packet;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// What a cancelled timer did while it ran
#[derive(Debug, Default)]
pub struct TimerReport {
    /// Successful transmissions, the first one included
    pub transmissions: u64,
    /// Most recent send failure, if any
    pub last_error: Option<NetworkError>,
}

/// Repeating resend of a single packet
///
/// Dropping the timer cancels it.
pub struct RetransmitTimer {
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<TimerReport>>,
}

impl RetransmitTimer {
    /// Start resending `packet` over `network` every `interval`
    ///
    /// The first transmission happens on the timer thread right away.
    pub fn start(network: Arc<dyn Datagram>, packet: Packet, interval: Duration) -> Self {
        let (cancel_tx, cancel_rx) = channel::bounded::<()>(1);

        let handle = thread::spawn(move || {
            let mut report = TimerReport::default();
            loop {
                match send_with_retry(network.as_ref(), &packet) {
                    Ok(()) => {
                        report.transmissions += 1;
                        tracing::trace!(%packet, transmissions = report.transmissions, "transmitted");
                    }
                    Err(e) => {
                        tracing::warn!(%packet, error = %e, "retransmission failed");
                        report.last_error = Some(e);
                    }
                }

                match cancel_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    // Cancelled, or the owning timer was dropped
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            report
        });

        RetransmitTimer {
            cancel: Some(cancel_tx),
            handle: Some(handle),
        }
    }

    /// Stop the timer and wait for its thread to exit
    ///
    /// Once this returns no further copy of the packet will be sent.
    pub fn cancel(mut self) -> TimerReport {
        self.stop()
    }

    fn stop(&mut self) -> TimerReport {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.try_send(());
        }
        self.handle
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }
}

impl Drop for RetransmitTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Overall time budget for one wait-for-reply step
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    /// Create a deadline `budget` from now
    pub fn after(budget: Duration) -> Self {
        Deadline {
            start: Instant::now(),
            budget,
        }
    }

    /// Check if the budget is spent
    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.budget
    }

    /// Time left before expiry
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.start.elapsed())
    }

    /// Per-attempt receive timeout: `poll`, but never past the deadline
    pub fn next_poll(&self, poll: Duration) -> Duration {
        poll.min(self.remaining())
    }
}

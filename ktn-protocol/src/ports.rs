//! Local port bookkeeping
//!
//! A [`PortRegistry`] records which local ports are claimed by live
//! connections. Claims are handed out as [`PortLease`] values: a lease can
//! be cloned (a listener shares its lease with every connection it
//! accepts) and the port becomes free again once the last clone is dropped.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Port registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("Port {0} is already in use")]
    InUse(u16),
}

/// Mutex-guarded set of claimed local ports
///
/// Cloning the registry yields another handle to the same set.
#[derive(Clone, Default)]
pub struct PortRegistry {
    claimed: Arc<Mutex<HashSet<u16>>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `port`, failing if another lease already holds it
    pub fn claim(&self, port: u16) -> Result<PortLease, PortError> {
        let mut claimed = self.claimed.lock();
        if !claimed.insert(port) {
            return Err(PortError::InUse(port));
        }
        tracing::debug!(port, "claimed local port");

        Ok(PortLease {
            claim: Arc::new(Claim {
                port,
                claimed: Arc::clone(&self.claimed),
            }),
        })
    }

    /// Check whether `port` is currently claimed
    pub fn is_claimed(&self, port: u16) -> bool {
        self.claimed.lock().contains(&port)
    }

    /// Number of claimed ports
    pub fn claimed_count(&self) -> usize {
        self.claimed.lock().len()
    }
}

impl fmt::Debug for PortRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortRegistry")
            .field("claimed", &*self.claimed.lock())
            .finish()
    }
}

/// Shared claim on a local port
#[derive(Clone, Debug)]
pub struct PortLease {
    claim: Arc<Claim>,
}

impl PortLease {
    /// The claimed port
    pub fn port(&self) -> u16 {
        self.claim.port
    }
}

struct Claim {
    port: u16,
    claimed: Arc<Mutex<HashSet<u16>>>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.claimed.lock().remove(&self.port);
        tracing::debug!(port = self.port, "released local port");
    }
}

impl fmt::Debug for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Claim({})", self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_and_release() {
        let registry = PortRegistry::new();
        let lease = registry.claim(8001).unwrap();
        assert_eq!(lease.port(), 8001);
        assert!(registry.is_claimed(8001));

        drop(lease);
        assert!(!registry.is_claimed(8001));
        assert_eq!(registry.claimed_count(), 0);
    }

    #[test]
    fn test_double_claim_rejected() {
        let registry = PortRegistry::new();
        let _lease = registry.claim(8002).unwrap();
        assert_eq!(registry.claim(8002).unwrap_err(), PortError::InUse(8002));
    }

    #[test]
    fn test_shared_lease_released_by_last_holder() {
        let registry = PortRegistry::new();
        let listener = registry.claim(8003).unwrap();
        let accepted = listener.clone();

        drop(listener);
        assert!(registry.is_claimed(8003));

        drop(accepted);
        assert!(!registry.is_claimed(8003));
        assert!(registry.claim(8003).is_ok());
    }

    #[test]
    fn test_concurrent_claims_yield_single_winner() {
        let registry = PortRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.claim(9000).ok())
            })
            .collect();

        let leases: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(leases.len(), 1);
    }
}

pub mod correlate;
pub mod icmp;
pub mod pending;
pub mod pinger;
pub mod receiver;
pub mod socket;

use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::PingError;

pub use correlate::{ParsedResponse, ResponseKind, parse_icmp_response};
pub use icmp::{DEFAULT_PAYLOAD_SIZE, MAX_PAYLOAD_SIZE};
pub use pending::Reply;
pub use pinger::Pinger;

/// Something that can measure one round trip to an address
///
/// Targets poll through this trait so schedulers can be exercised without
/// raw sockets.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, addr: IpAddr, timeout: Duration) -> Result<Duration, PingError>;

    /// Probe up to `attempts` times, returning on the first success
    ///
    /// If every attempt fails the last error is returned. A closed transport
    /// or a missing socket ends the retries at once.
    async fn probe_attempts(
        &self,
        addr: IpAddr,
        timeout: Duration,
        attempts: usize,
    ) -> Result<Duration, PingError> {
        if attempts < 1 {
            return Err(PingError::InvalidAttempts);
        }

        let mut last_err = PingError::Timeout;
        for _ in 0..attempts {
            match self.probe(addr, timeout).await {
                Ok(rtt) => return Ok(rtt),
                Err(e @ (PingError::Closed | PingError::NoSocket(_))) => return Err(e),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl Prober for Pinger {
    async fn probe(&self, addr: IpAddr, timeout: Duration) -> Result<Duration, PingError> {
        Pinger::probe(self, addr, timeout).await
    }
}

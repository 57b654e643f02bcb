//! ICMP Echo transport.
//!
//! A `Pinger` owns up to two sockets (IPv4 and IPv6), one receive thread per
//! socket, and the in-flight request map. `open` reserves an Echo identifier
//! no other live pinger in the process holds, so several pingers never
//! complete each other's requests.

use parking_lot::{Mutex, RwLock};
use socket2::Socket;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{IpVersion, PingError};
use crate::probe::icmp::{
    DEFAULT_PAYLOAD_SIZE, MAX_PAYLOAD_SIZE, build_echo_request, IdentifierClaim, random_payload,
};
use crate::probe::Prober;
use crate::probe::pending::{PendingRequests, Reply, Request};
use crate::probe::receiver::Receiver;
use crate::probe::socket::{create_icmp_socket, send_icmp, set_mark};

/// Buffered replies per sweep before further replies are dropped
const SWEEP_CHANNEL_CAPACITY: usize = 64;

/// One open socket and its write path
struct Endpoint {
    socket: Arc<Socket>,
    /// Serializes writes so concurrent probes never interleave on the socket
    write_lock: Mutex<()>,
    is_dgram: bool,
}

pub struct Pinger {
    v4: Option<Endpoint>,
    v6: Option<Endpoint>,
    identifier: IdentifierClaim,
    payload: RwLock<Vec<u8>>,
    pending: Arc<PendingRequests>,
    cancel: CancellationToken,
    receivers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Pinger {
    /// Open sockets on the requested bind addresses
    ///
    /// Pass `Ipv4Addr::UNSPECIFIED` / `Ipv6Addr::UNSPECIFIED` to listen on
    /// every interface. Fails if any requested socket cannot be opened, or if
    /// neither family is requested.
    pub fn open(bind4: Option<Ipv4Addr>, bind6: Option<Ipv6Addr>) -> Result<Self, PingError> {
        if bind4.is_none() && bind6.is_none() {
            return Err(PingError::NotBound);
        }
        Self::open_claimed(bind4, bind6, IdentifierClaim::allocate()?)
    }

    /// Like [`Pinger::open`], with an explicit Echo identifier
    ///
    /// The caller is responsible for keeping it distinct from other pingers.
    pub fn open_with_identifier(
        bind4: Option<Ipv4Addr>,
        bind6: Option<Ipv6Addr>,
        identifier: u16,
    ) -> Result<Self, PingError> {
        if bind4.is_none() && bind6.is_none() {
            return Err(PingError::NotBound);
        }
        Self::open_claimed(bind4, bind6, IdentifierClaim::fixed(identifier))
    }

    fn open_claimed(
        bind4: Option<Ipv4Addr>,
        bind6: Option<Ipv6Addr>,
        identifier: IdentifierClaim,
    ) -> Result<Self, PingError> {

        let pending = Arc::new(PendingRequests::new());
        let cancel = CancellationToken::new();

        let mut pinger = Self {
            v4: None,
            v6: None,
            identifier,
            payload: RwLock::new(random_payload(DEFAULT_PAYLOAD_SIZE)),
            pending,
            cancel,
            receivers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };

        // On error, dropping `pinger` stops any receiver already started
        if let Some(addr) = bind4 {
            pinger.v4 = Some(pinger.start_endpoint(IpAddr::V4(addr))?);
        }
        if let Some(addr) = bind6 {
            pinger.v6 = Some(pinger.start_endpoint(IpAddr::V6(addr))?);
        }

        tracing::debug!(
            identifier = pinger.identifier(),
            ipv4 = pinger.v4.is_some(),
            ipv6 = pinger.v6.is_some(),
            "pinger opened"
        );
        Ok(pinger)
    }

    fn start_endpoint(&self, bind: IpAddr) -> Result<Endpoint, PingError> {
        let version = IpVersion::of(&bind);
        let info = create_icmp_socket(bind, self.identifier())?;
        let has_ip_header = info.has_ip_header(version == IpVersion::V6);
        let socket = Arc::new(info.socket);

        let handle = Receiver::new(
            Arc::clone(&socket),
            version,
            has_ip_header,
            self.identifier(),
            Arc::clone(&self.pending),
            self.cancel.clone(),
        )
        .spawn()?;
        self.receivers.lock().push(handle);

        Ok(Endpoint {
            socket,
            write_lock: Mutex::new(()),
            is_dgram: info.is_dgram,
        })
    }

    /// Echo identifier stamped into every request
    pub fn identifier(&self) -> u16 {
        self.identifier.id()
    }

    pub fn has_ipv4(&self) -> bool {
        self.v4.is_some()
    }

    pub fn has_ipv6(&self) -> bool {
        self.v6.is_some()
    }

    /// True if the given family fell back to an unprivileged datagram socket
    pub fn is_unprivileged(&self, version: IpVersion) -> bool {
        self.endpoint_for(version).is_some_and(|ep| ep.is_dgram)
    }

    /// Replace the payload with `size` pseudo-random bytes
    pub fn set_payload_size(&self, size: usize) -> Result<(), PingError> {
        if size > MAX_PAYLOAD_SIZE {
            return Err(PingError::PayloadTooLarge(size));
        }
        *self.payload.write() = random_payload(size);
        Ok(())
    }

    /// Replace the payload appended to every future Echo Request
    pub fn set_payload(&self, payload: Vec<u8>) -> Result<(), PingError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PingError::PayloadTooLarge(payload.len()));
        }
        *self.payload.write() = payload;
        Ok(())
    }

    pub fn payload_size(&self) -> usize {
        self.payload.read().len()
    }

    /// Set SO_MARK on every open socket (Linux only)
    pub fn set_mark(&self, mark: u32) -> Result<(), PingError> {
        for endpoint in [&self.v4, &self.v6].into_iter().flatten() {
            set_mark(&endpoint.socket, mark)?;
        }
        Ok(())
    }

    fn endpoint_for(&self, version: IpVersion) -> Option<&Endpoint> {
        match version {
            IpVersion::V4 => self.v4.as_ref(),
            IpVersion::V6 => self.v6.as_ref(),
        }
    }

    /// Resolve the socket for `addr`; IPv4-mapped addresses go out over IPv4
    fn route(&self, addr: IpAddr) -> Result<(IpAddr, &Endpoint), PingError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PingError::Closed);
        }
        let addr = addr.to_canonical();
        let version = IpVersion::of(&addr);
        let endpoint = self.endpoint_for(version).ok_or(PingError::NoSocket(version))?;
        Ok((addr, endpoint))
    }

    /// Write one Echo Request; on failure the request is evicted at once
    fn send(&self, endpoint: &Endpoint, addr: IpAddr, seq: u16) -> Result<(), PingError> {
        let packet = {
            let payload = self.payload.read();
            build_echo_request(self.identifier(), seq, &payload, addr.is_ipv6())
        };

        let result = {
            let _guard = endpoint.write_lock.lock();
            send_icmp(&endpoint.socket, &packet, addr)
        };

        if let Err(e) = result {
            self.pending.remove(seq);
            return Err(PingError::Io(e));
        }
        Ok(())
    }

    /// Send one Echo Request and wait for its answer
    ///
    /// Returns the round-trip time, `PingError::Unreachable` if a Destination
    /// Unreachable quoted the request, or `PingError::Timeout` once `timeout`
    /// elapses. A reply arriving after the timeout is discarded.
    pub async fn probe(&self, addr: IpAddr, timeout: Duration) -> Result<Duration, PingError> {
        let (addr, endpoint) = self.route(addr)?;

        let (tx, rx) = oneshot::channel();
        let seq = self.pending.register(Request::single(tx))?;

        // Evict the entry however this future ends (timeout, drop, error)
        let pending = &self.pending;
        let mut rx = scopeguard::guard(rx, move |rx| {
            drop(rx);
            pending.remove_if(seq, Request::is_abandoned);
        });

        self.send(endpoint, addr, seq)?;

        match tokio::time::timeout(timeout, &mut *rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without an answer
            Ok(Err(_)) => Err(PingError::Closed),
            Err(_) => {
                tracing::trace!(%addr, seq, "probe timed out");
                Err(PingError::Timeout)
            }
        }
    }

    /// Probe up to `attempts` times, returning on the first success
    pub async fn probe_attempts(
        &self,
        addr: IpAddr,
        timeout: Duration,
        attempts: usize,
    ) -> Result<Duration, PingError> {
        <Self as Prober>::probe_attempts(self, addr, timeout, attempts).await
    }

    /// Send one Echo Request and collect every reply for `window`
    ///
    /// For broadcast and multicast destinations. The channel closes once the
    /// window elapses or the pinger is closed. Replies beyond what the
    /// consumer has buffered are dropped.
    pub async fn probe_sweep(
        &self,
        addr: IpAddr,
        window: Duration,
    ) -> Result<mpsc::Receiver<Reply>, PingError> {
        let (addr, endpoint) = self.route(addr)?;

        let (tx, rx) = mpsc::channel(SWEEP_CHANNEL_CAPACITY);
        let seq = self.pending.register(Request::sweep(tx.clone()))?;
        self.send(endpoint, addr, seq)?;

        let pending = Arc::clone(&self.pending);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(window) => {}
                _ = cancel.cancelled() => {}
            }
            pending.remove_if(seq, |request| request.feeds(&tx));
        });

        Ok(rx)
    }

    /// Stop the receive threads and fail every outstanding request
    ///
    /// Blocks for up to one socket poll interval while the threads exit.
    /// Calling it again is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = self.receivers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("ICMP receive thread panicked");
            }
        }

        let failed = self.pending.close();
        tracing::debug!(failed, "pinger closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Pinger {
    fn drop(&mut self) {
        self.close();
    }
}

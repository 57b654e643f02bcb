//! In-flight request tracking.
//!
//! The pinger registers a request before writing its Echo Request, and the
//! receive threads look it up by sequence number when an answer arrives.
//! Callers never touch the map directly.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use crate::error::PingError;
use crate::probe::correlate::{ParsedResponse, ResponseKind};

/// One answer to a sweep request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub address: IpAddr,
    pub rtt: Duration,
}

/// One outstanding probe
#[derive(Debug)]
pub enum Request {
    /// Classic ping: completed by the first answer, then removed
    Single {
        sent_at: Instant,
        tx: oneshot::Sender<Result<Duration, PingError>>,
    },
    /// Broadcast/multicast sweep: stays registered until its window closes
    Sweep {
        sent_at: Instant,
        tx: mpsc::Sender<Reply>,
    },
}

impl Request {
    pub fn single(tx: oneshot::Sender<Result<Duration, PingError>>) -> Self {
        Request::Single {
            sent_at: Instant::now(),
            tx,
        }
    }

    pub fn sweep(tx: mpsc::Sender<Reply>) -> Self {
        Request::Sweep {
            sent_at: Instant::now(),
            tx,
        }
    }

    /// True once nobody is waiting for this request's outcome
    pub fn is_abandoned(&self) -> bool {
        match self {
            Request::Single { tx, .. } => tx.is_closed(),
            Request::Sweep { tx, .. } => tx.is_closed(),
        }
    }

    /// True if this is the sweep feeding `other`'s channel
    pub fn feeds(&self, other: &mpsc::Sender<Reply>) -> bool {
        matches!(self, Request::Sweep { tx, .. } if tx.same_channel(other))
    }

    /// Finalize with `err`; sweeps just close their channel
    fn fail(self, err: PingError) {
        if let Request::Single { tx, .. } = self {
            let _ = tx.send(Err(err));
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u16,
    requests: HashMap<u16, Request>,
    closed: bool,
}

/// Sequence-number → request map shared by the pinger and its receive threads
#[derive(Debug, Default)]
pub struct PendingRequests {
    inner: Mutex<Inner>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `request` under the next free sequence number
    ///
    /// Sequence numbers still in flight are skipped, so a wrapped counter
    /// never overwrites a live request.
    pub fn register(&self, request: Request) -> Result<u16, PingError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(PingError::Closed);
        }

        for _ in 0..=u16::MAX as u32 {
            let seq = inner.next_seq;
            inner.next_seq = seq.wrapping_add(1);
            if !inner.requests.contains_key(&seq) {
                inner.requests.insert(seq, request);
                return Ok(seq);
            }
        }
        Err(PingError::SequenceExhausted)
    }

    /// Route an inbound answer to its request
    ///
    /// Single requests are removed before they are completed, so each one
    /// completes at most once. Sweeps stay registered; their replies are
    /// forwarded with `try_send` and dropped if the consumer lags behind.
    /// Returns false if no request is registered under the sequence number.
    pub fn complete(&self, response: &ParsedResponse, received_at: Instant) -> bool {
        let mut inner = self.inner.lock();
        match inner.requests.get(&response.sequence) {
            None => return false,
            Some(Request::Sweep { sent_at, tx }) => {
                if response.kind == ResponseKind::EchoReply {
                    let reply = Reply {
                        address: response.responder,
                        rtt: received_at.saturating_duration_since(*sent_at),
                    };
                    if tx.try_send(reply).is_err() {
                        tracing::trace!(seq = response.sequence, "sweep reply dropped");
                    }
                }
                return true;
            }
            Some(Request::Single { .. }) => {}
        }
        let request = inner.requests.remove(&response.sequence);
        drop(inner);

        if let Some(Request::Single { sent_at, tx }) = request {
            let result = match response.kind {
                ResponseKind::EchoReply => Ok(received_at.saturating_duration_since(sent_at)),
                ResponseKind::DestUnreachable(code) => Err(PingError::Unreachable { code }),
            };
            let _ = tx.send(result);
        }
        true
    }

    /// Evict a request unconditionally
    pub fn remove(&self, seq: u16) -> Option<Request> {
        self.inner.lock().requests.remove(&seq)
    }

    /// Remove the request under `seq` if `predicate` holds for it
    pub fn remove_if(&self, seq: u16, predicate: impl FnOnce(&Request) -> bool) -> Option<Request> {
        let mut inner = self.inner.lock();
        if inner.requests.get(&seq).is_some_and(predicate) {
            inner.requests.remove(&seq)
        } else {
            None
        }
    }

    /// Refuse new registrations and fail everything still outstanding
    ///
    /// Single requests complete with `PingError::Closed`; sweep channels close.
    pub fn close(&self) -> usize {
        let drained: Vec<Request> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.requests.drain().map(|(_, request)| request).collect()
        };
        let count = drained.len();
        for request in drained {
            request.fail(PingError::Closed);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn echo_reply(sequence: u16) -> ParsedResponse {
        ParsedResponse {
            responder: IpAddr::V4(Ipv4Addr::LOCALHOST),
            sequence,
            kind: ResponseKind::EchoReply,
        }
    }

    #[test]
    fn test_single_completes_once() {
        let pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        let seq = pending.register(Request::single(tx)).unwrap();

        assert!(pending.complete(&echo_reply(seq), Instant::now()));
        assert!(pending.is_empty());
        // A duplicate reply finds nothing
        assert!(!pending.complete(&echo_reply(seq), Instant::now()));

        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_unreachable_completes_with_error() {
        let pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        let seq = pending.register(Request::single(tx)).unwrap();

        let response = ParsedResponse {
            kind: ResponseKind::DestUnreachable(1),
            ..echo_reply(seq)
        };
        assert!(pending.complete(&response, Instant::now()));

        match rx.try_recv().unwrap() {
            Err(PingError::Unreachable { code }) => assert_eq!(code, 1),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_late_reply_after_eviction_is_dropped() {
        let pending = PendingRequests::new();
        let (tx, rx) = oneshot::channel();
        let seq = pending.register(Request::single(tx)).unwrap();

        // Caller gave up: receiver dropped, entry evicted
        drop(rx);
        assert!(pending.remove_if(seq, Request::is_abandoned).is_some());

        assert!(!pending.complete(&echo_reply(seq), Instant::now()));
    }

    #[test]
    fn test_remove_if_keeps_live_request() {
        let pending = PendingRequests::new();
        let (tx, _rx) = oneshot::channel();
        let seq = pending.register(Request::single(tx)).unwrap();

        assert!(pending.remove_if(seq, Request::is_abandoned).is_none());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_sequence_numbers_advance() {
        let pending = PendingRequests::new();
        let mut receivers = Vec::new();
        let mut seqs = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            receivers.push(rx);
            seqs.push(pending.register(Request::single(tx)).unwrap());
        }
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_wrapped_counter_skips_in_flight() {
        let pending = PendingRequests::new();
        let (tx, _rx0) = oneshot::channel();
        assert_eq!(pending.register(Request::single(tx)).unwrap(), 0);

        pending.inner.lock().next_seq = 0;
        let (tx, _rx1) = oneshot::channel();
        assert_eq!(pending.register(Request::single(tx)).unwrap(), 1);
    }

    #[test]
    fn test_sweep_stays_registered() {
        let pending = PendingRequests::new();
        let (tx, mut rx) = mpsc::channel(4);
        let seq = pending.register(Request::sweep(tx.clone())).unwrap();

        let other = ParsedResponse {
            responder: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)),
            ..echo_reply(seq)
        };
        assert!(pending.complete(&echo_reply(seq), Instant::now()));
        assert!(pending.complete(&other, Instant::now()));
        assert_eq!(pending.len(), 1);

        assert_eq!(rx.try_recv().unwrap().address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(rx.try_recv().unwrap().address, other.responder);

        assert!(pending.remove_if(seq, |r| r.feeds(&tx)).is_some());
    }

    #[test]
    fn test_sweep_full_channel_does_not_block() {
        let pending = PendingRequests::new();
        let (tx, _rx) = mpsc::channel(1);
        let seq = pending.register(Request::sweep(tx)).unwrap();

        for _ in 0..10 {
            assert!(pending.complete(&echo_reply(seq), Instant::now()));
        }
    }

    #[test]
    fn test_close_fails_outstanding() {
        let pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        pending.register(Request::single(tx)).unwrap();
        let (sweep_tx, mut sweep_rx) = mpsc::channel(1);
        pending.register(Request::sweep(sweep_tx)).unwrap();

        assert_eq!(pending.close(), 2);
        assert!(matches!(rx.try_recv().unwrap(), Err(PingError::Closed)));
        assert!(matches!(
            sweep_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        let (tx, _rx) = oneshot::channel();
        assert!(matches!(
            pending.register(Request::single(tx)),
            Err(PingError::Closed)
        ));
    }

    #[test]
    fn test_remove_evicts() {
        let pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        let seq = pending.register(Request::single(tx)).unwrap();

        assert!(pending.remove(seq).is_some());
        assert!(pending.is_empty());
        assert!(rx.try_recv().is_err());
    }
}

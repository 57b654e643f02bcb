use socket2::Socket;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::IpVersion;
use crate::probe::correlate::parse_icmp_response;
use crate::probe::pending::PendingRequests;
use crate::probe::socket::{is_poll_timeout, recv_icmp};

/// Maximum consecutive errors before stopping the receiver
const MAX_CONSECUTIVE_ERRORS: u32 = 50;

/// Largest ICMP message we expect (jumbo payloads are truncated and discarded)
const RECV_BUFFER_LEN: usize = 65536;

/// Receive loop for one socket; correlates answers to pending requests
pub struct Receiver {
    socket: Arc<Socket>,
    version: IpVersion,
    has_ip_header: bool,
    identifier: u16,
    pending: Arc<PendingRequests>,
    cancel: CancellationToken,
    consecutive_errors: u32,
}

impl Receiver {
    pub fn new(
        socket: Arc<Socket>,
        version: IpVersion,
        has_ip_header: bool,
        identifier: u16,
        pending: Arc<PendingRequests>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            socket,
            version,
            has_ip_header,
            identifier,
            pending,
            cancel,
            consecutive_errors: 0,
        }
    }

    /// Start the loop on a dedicated thread (blocking I/O)
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("icmpv{}-recv", self.version))
            .spawn(move || self.run_blocking())
    }

    /// Read until cancelled; the socket read timeout bounds each wait
    fn run_blocking(mut self) {
        let mut buffer = vec![0u8; RECV_BUFFER_LEN];

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match recv_icmp(&self.socket, &mut buffer) {
                Ok((len, source)) => {
                    let received_at = Instant::now();
                    self.consecutive_errors = 0;

                    // Malformed and unrelated packets are protocol noise
                    let Some(parsed) = parse_icmp_response(
                        &buffer[..len],
                        source,
                        self.identifier,
                        self.has_ip_header,
                    ) else {
                        continue;
                    };

                    if !self.pending.complete(&parsed, received_at) {
                        tracing::trace!(
                            seq = parsed.sequence,
                            from = %parsed.responder,
                            "late or unknown reply"
                        );
                    }
                }
                Err(e) if is_poll_timeout(&e) => {
                    self.consecutive_errors = 0;
                }
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    self.consecutive_errors += 1;
                    tracing::warn!(
                        "ICMPv{} receive error ({}/{}): {}",
                        self.version,
                        self.consecutive_errors,
                        MAX_CONSECUTIVE_ERRORS,
                        e
                    );

                    if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        tracing::error!(
                            "ICMPv{} receiver stopped: {} consecutive errors (last: {})",
                            self.version,
                            self.consecutive_errors,
                            e
                        );
                        break;
                    }
                }
            }
        }

        tracing::debug!("ICMPv{} receiver exited", self.version);
    }
}

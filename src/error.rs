//! Error types for probing, resolution and monitoring.
//!
//! A probe timeout is ordinary packet loss, an unreachable answer is a
//! protocol-level loss, and only I/O failures point at the local host.

use std::fmt;
use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// IP protocol version of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(v6) if v6.to_ipv4_mapped().is_some() => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    /// Numeric label ("4" or "6")
    pub fn as_str(&self) -> &'static str {
        match self {
            IpVersion::V4 => "4",
            IpVersion::V6 => "6",
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the ICMP transport
#[derive(Debug, Error)]
pub enum PingError {
    /// No reply arrived before the caller's deadline
    #[error("i/o timeout")]
    Timeout,

    /// The pinger was closed while the request was outstanding
    #[error("pinger closed")]
    Closed,

    /// A Destination Unreachable message quoted our request
    #[error("destination unreachable (code {code})")]
    Unreachable { code: u8 },

    /// No socket is open for the destination's address family
    #[error("no IPv{0} socket open")]
    NoSocket(IpVersion),

    /// Neither an IPv4 nor an IPv6 bind address was requested
    #[error("need at least one bind address")]
    NotBound,

    #[error("attempts must be at least 1")]
    InvalidAttempts,

    #[error("payload of {0} bytes exceeds the maximum of 65500")]
    PayloadTooLarge(usize),

    /// Every sequence number is taken by an in-flight request
    #[error("too many requests in flight")]
    SequenceExhausted,

    /// Every Echo identifier is held by another pinger in this process
    #[error("no free ICMP identifier")]
    IdentifiersExhausted,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PingError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PingError::Timeout)
    }
}

/// Errors produced while resolving a host to addresses
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("error resolving '{host}': {message}")]
    Lookup { host: String, message: String },

    #[error("resolving '{host}' timed out")]
    Timeout { host: String },

    #[error("'{host}' resolved to no addresses")]
    NoAddresses { host: String },

    #[error("invalid nameserver '{0}'")]
    InvalidNameserver(String),
}

/// Errors produced by the monitor
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("monitor has been stopped")]
    Closed,
}

/// Errors produced while reconciling one host
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("error updating monitor for '{host}': {source}")]
    Monitor {
        host: String,
        #[source]
        source: MonitorError,
    },
}

/// A string that does not have the `"host ip version"` key shape
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid target key '{0}'")]
pub struct InvalidTargetKey(pub String);

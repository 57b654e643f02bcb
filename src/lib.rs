//! Continuous ICMP echo monitoring.
//!
//! A [`Pinger`] owns the ICMP sockets and correlates replies; a [`Monitor`]
//! runs one probing [`Target`](monitor::Target) per address; a [`HostSet`]
//! keeps the Monitor in line with what each host currently resolves to.

pub mod cli;
pub mod config;
pub mod error;
pub mod export;
pub mod lookup;
pub mod monitor;
pub mod probe;
pub mod state;

pub use error::{IpVersion, MonitorError, PingError, ReconcileError, ResolveError};
pub use lookup::{DnsResolver, HostSet, HostSpec, HostTarget, IpPolicy, Resolve, TargetKey};
pub use monitor::{Monitor, ProbeSettings, TargetRegistry};
pub use probe::{Pinger, Prober, Reply};
pub use state::{History, Metrics};

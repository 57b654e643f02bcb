pub mod reconcile;
pub mod resolver;

pub use reconcile::{
    HostSet, HostSpec, HostTarget, IpPolicy, ReconcileOutcome, STARTUP_STAGGER, TargetKey,
};
pub use resolver::{DnsResolver, Resolve, parse_nameserver};

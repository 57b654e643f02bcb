//! Keeps the monitored address set in step with name resolution.
//!
//! Each configured host is a [`HostTarget`] remembering the addresses it
//! last handed to the monitor. Reconciling resolves the host again and
//! applies only the difference: new addresses are upserted with a staggered
//! startup delay, vanished ones are removed, unchanged ones are untouched so
//! their history survives.

use futures::future::join_all;
use parking_lot::RwLock;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{InvalidTargetKey, IpVersion, ReconcileError};
use crate::lookup::resolver::Resolve;
use crate::monitor::TargetRegistry;

/// Spacing between first probes of consecutive addresses (and hosts)
pub const STARTUP_STAGGER: Duration = Duration::from_millis(10);

/// Monitor key of one address of one host, rendered as `"host ip version"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetKey {
    pub host: String,
    pub addr: IpAddr,
    pub version: IpVersion,
}

impl TargetKey {
    pub fn new(host: &str, addr: IpAddr) -> Self {
        Self {
            host: host.to_string(),
            addr,
            version: IpVersion::of(&addr),
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.host, self.addr, self.version)
    }
}

impl FromStr for TargetKey {
    type Err = InvalidTargetKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidTargetKey(s.to_string());

        let mut parts = s.rsplitn(3, ' ');
        let version = match parts.next() {
            Some("4") => IpVersion::V4,
            Some("6") => IpVersion::V6,
            _ => return Err(invalid()),
        };
        let addr: IpAddr = parts.next().and_then(|a| a.parse().ok()).ok_or_else(invalid)?;
        let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(invalid)?;

        Ok(Self {
            host: host.to_string(),
            addr,
            version,
        })
    }
}

/// Which address families of a host get monitored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPolicy {
    pub ipv4: bool,
    pub ipv6: bool,
}

impl Default for IpPolicy {
    fn default() -> Self {
        Self {
            ipv4: true,
            ipv6: true,
        }
    }
}

impl IpPolicy {
    pub fn allows(&self, addr: &IpAddr) -> bool {
        match IpVersion::of(addr) {
            IpVersion::V4 => self.ipv4,
            IpVersion::V6 => self.ipv6,
        }
    }
}

/// What one reconciliation changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub added: Vec<IpAddr>,
    pub removed: Vec<IpAddr>,
}

impl ReconcileOutcome {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// One configured host and the addresses currently monitored for it
pub struct HostTarget {
    host: String,
    resolver: Arc<dyn Resolve>,
    /// Startup offset of this host relative to the others
    delay: Duration,
    /// Held for the whole reconciliation, serializing runs for this host
    addresses: tokio::sync::Mutex<Vec<IpAddr>>,
}

impl HostTarget {
    pub fn new(host: impl Into<String>, resolver: Arc<dyn Resolve>, delay: Duration) -> Self {
        Self {
            host: host.into(),
            resolver,
            delay,
            addresses: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Addresses handed to the monitor by the last reconciliation
    pub async fn addresses(&self) -> Vec<IpAddr> {
        self.addresses.lock().await.clone()
    }

    /// Resolve the host and apply the address diff to `registry`
    ///
    /// A resolution error leaves the monitored addresses untouched.
    pub async fn reconcile(
        &self,
        registry: &dyn TargetRegistry,
        policy: IpPolicy,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let mut current = self.addresses.lock().await;

        let resolved = self.resolver.resolve(&self.host).await?;

        let mut desired: Vec<IpAddr> = Vec::with_capacity(resolved.len());
        for addr in resolved.into_iter().map(|a| a.to_canonical()) {
            if !policy.allows(&addr) {
                tracing::debug!(
                    host = %self.host,
                    %addr,
                    "IPv{} disabled: skipping address",
                    IpVersion::of(&addr)
                );
                continue;
            }
            if !desired.contains(&addr) {
                desired.push(addr);
            }
        }

        let mut outcome = ReconcileOutcome::default();

        // Only new addresses are staggered, by their position among each other
        let added: Vec<IpAddr> = desired
            .iter()
            .filter(|a| !current.contains(a))
            .copied()
            .collect();
        for (index, addr) in added.iter().enumerate() {
            let key = TargetKey::new(&self.host, *addr).to_string();
            let delay = self.delay + STARTUP_STAGGER * index as u32;
            tracing::info!(host = %self.host, %addr, "adding target");
            registry
                .upsert(&key, *addr, delay)
                .await
                .map_err(|source| ReconcileError::Monitor {
                    host: self.host.clone(),
                    source,
                })?;
            // Track it now so a later failure still leaves `current` accurate
            current.push(*addr);
            outcome.added.push(*addr);
        }

        for addr in current.iter().filter(|a| !desired.contains(a)) {
            tracing::info!(host = %self.host, %addr, "removing target");
            registry.remove(&TargetKey::new(&self.host, *addr).to_string()).await;
            outcome.removed.push(*addr);
        }

        *current = desired;
        Ok(outcome)
    }

    /// Remove every address of this host from `registry`
    pub async fn remove_from(&self, registry: &dyn TargetRegistry) {
        let mut current = self.addresses.lock().await;
        for addr in current.drain(..) {
            registry.remove(&TargetKey::new(&self.host, addr).to_string()).await;
        }
    }
}

/// A host to monitor and its address-family policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub host: String,
    pub policy: IpPolicy,
}

impl HostSpec {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            policy: IpPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: IpPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[derive(Clone)]
struct HostEntry {
    target: Arc<HostTarget>,
    policy: IpPolicy,
}

/// The desired hosts, reconciled against one registry
pub struct HostSet {
    resolver: Arc<dyn Resolve>,
    registry: Arc<dyn TargetRegistry>,
    hosts: RwLock<Vec<HostEntry>>,
}

impl HostSet {
    pub fn new(resolver: Arc<dyn Resolve>, registry: Arc<dyn TargetRegistry>) -> Self {
        Self {
            resolver,
            registry,
            hosts: RwLock::new(Vec::new()),
        }
    }

    /// Hosts currently tracked, in configuration order
    pub fn hosts(&self) -> Vec<String> {
        self.hosts
            .read()
            .iter()
            .map(|e| e.target.host().to_string())
            .collect()
    }

    /// Replace the desired host list and reconcile every host
    ///
    /// Hosts kept from the previous list retain their address memory; new
    /// hosts start `STARTUP_STAGGER * position` late. Hosts dropped from the
    /// list have all their addresses removed once the others are reconciled.
    /// Returns the per-host failures; one failing host never stops the rest.
    pub async fn sync(&self, specs: &[HostSpec]) -> Vec<ReconcileError> {
        let previous: Vec<HostEntry> = self.hosts.read().clone();

        let entries: Vec<HostEntry> = specs
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let target = previous
                    .iter()
                    .find(|e| e.target.host() == spec.host)
                    .map(|e| Arc::clone(&e.target))
                    .unwrap_or_else(|| {
                        Arc::new(HostTarget::new(
                            spec.host.clone(),
                            Arc::clone(&self.resolver),
                            STARTUP_STAGGER * index as u32,
                        ))
                    });
                HostEntry {
                    target,
                    policy: spec.policy,
                }
            })
            .collect();

        let errors = self.reconcile_entries(&entries).await;
        *self.hosts.write() = entries.clone();

        for entry in previous {
            if entries.iter().all(|e| !Arc::ptr_eq(&e.target, &entry.target)) {
                tracing::info!(host = entry.target.host(), "removing host");
                entry.target.remove_from(self.registry.as_ref()).await;
            }
        }

        errors
    }

    /// Re-resolve every host and apply the differences
    pub async fn refresh_all(&self) -> Vec<ReconcileError> {
        let entries: Vec<HostEntry> = self.hosts.read().clone();
        self.reconcile_entries(&entries).await
    }

    async fn reconcile_entries(&self, entries: &[HostEntry]) -> Vec<ReconcileError> {
        let registry = self.registry.as_ref();
        let results = join_all(
            entries
                .iter()
                .map(|entry| entry.target.reconcile(registry, entry.policy)),
        )
        .await;

        results.into_iter().filter_map(Result::err).collect()
    }

    /// Refresh every `interval` until cancelled; a zero interval disables it
    pub async fn run_refresh(&self, interval: Duration, cancel: CancellationToken) {
        if interval.is_zero() {
            tracing::info!("DNS refresh disabled");
            return;
        }

        let Some(first_tick) = tokio::time::Instant::now().checked_add(interval) else {
            tracing::error!(?interval, "DNS refresh interval out of range, refresh disabled");
            return;
        };
        let mut ticker = tokio::time::interval_at(first_tick, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tracing::debug!("refreshing DNS");
                    for err in self.refresh_all().await {
                        tracing::warn!("could not refresh DNS: {}", err);
                    }
                }
            }
        }
    }
}

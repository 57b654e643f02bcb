//! The set of monitored addresses.
//!
//! A `Monitor` maps an opaque key (see [`crate::lookup::TargetKey`]) to a
//! running [`Target`]. Upserting an existing key restarts it: the old Target
//! is fully stopped before the new one starts, so at most one Target polls
//! under any key.

pub mod target;

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::MonitorError;
use crate::probe::Prober;
use crate::state::Metrics;

pub use target::{ProbeSettings, Target, join_task};

/// The add/remove surface reconciliation drives
#[async_trait]
pub trait TargetRegistry: Send + Sync {
    /// Start (or restart) polling `addr` under `key`
    async fn upsert(&self, key: &str, addr: IpAddr, startup_delay: Duration)
    -> Result<(), MonitorError>;

    /// Stop polling `key`; returns false if it was not monitored
    async fn remove(&self, key: &str) -> bool;
}

pub struct Monitor {
    prober: Arc<dyn Prober>,
    settings: ProbeSettings,
    targets: RwLock<HashMap<String, Target>>,
    closed: AtomicBool,
}

impl Monitor {
    pub fn new(prober: Arc<dyn Prober>, settings: ProbeSettings) -> Self {
        Self {
            prober,
            settings,
            targets: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> ProbeSettings {
        self.settings
    }

    /// Start polling `addr` under `key`, restarting any existing Target
    ///
    /// The write lock is held while the old Target stops, so concurrent
    /// upserts of one key never overlap.
    pub async fn upsert(
        &self,
        key: &str,
        addr: IpAddr,
        startup_delay: Duration,
    ) -> Result<(), MonitorError> {
        let mut targets = self.targets.write().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(MonitorError::Closed);
        }

        if let Some(old) = targets.remove(key) {
            tracing::debug!(key, "restarting target");
            old.stop().await;
        }

        let target = Target::spawn(Arc::clone(&self.prober), addr, self.settings, startup_delay);
        targets.insert(key.to_string(), target);
        tracing::info!(key, %addr, delay_ms = startup_delay.as_millis() as u64, "target added");
        Ok(())
    }

    /// Stop and discard the Target under `key`, if any
    pub async fn remove(&self, key: &str) -> bool {
        let mut targets = self.targets.write().await;
        match targets.remove(key) {
            Some(target) => {
                target.stop().await;
                tracing::info!(key, "target removed");
                true
            }
            None => false,
        }
    }

    /// Metrics of every Target holding at least one sample
    ///
    /// With `clear`, each History is reset in the same step it is read.
    pub async fn export(&self, clear: bool) -> BTreeMap<String, Metrics> {
        let targets = self.targets.read().await;
        targets
            .iter()
            .filter_map(|(key, target)| target.compute(clear).map(|m| (key.clone(), m)))
            .collect()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.targets.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.targets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop every Target; later upserts fail with `MonitorError::Closed`
    pub async fn stop_all(&self) {
        let drained: Vec<Target> = {
            let mut targets = self.targets.write().await;
            self.closed.store(true, Ordering::Release);
            targets.drain().map(|(_, target)| target).collect()
        };

        let count = drained.len();
        join_all(drained.into_iter().map(Target::stop)).await;
        tracing::info!(count, "all targets stopped");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl TargetRegistry for Monitor {
    async fn upsert(
        &self,
        key: &str,
        addr: IpAddr,
        startup_delay: Duration,
    ) -> Result<(), MonitorError> {
        Monitor::upsert(self, key, addr, startup_delay).await
    }

    async fn remove(&self, key: &str) -> bool {
        Monitor::remove(self, key).await
    }
}

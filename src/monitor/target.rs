use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::PingError;
use crate::probe::Prober;
use crate::state::{History, Metrics};

/// Polling parameters shared by every Target of a Monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub history_size: usize,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(4),
            history_size: 10,
        }
    }
}

/// Polls one address on a fixed interval and keeps its History
///
/// Dropping a Target cancels its loop without waiting; use [`Target::stop`]
/// to wait until no probe can touch the History any more.
pub struct Target {
    addr: IpAddr,
    history: Arc<Mutex<History>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    _cancel_on_drop: DropGuard,
}

impl Target {
    /// Start polling `addr` after `startup_delay`
    pub fn spawn(
        prober: Arc<dyn Prober>,
        addr: IpAddr,
        settings: ProbeSettings,
        startup_delay: Duration,
    ) -> Self {
        let history = Arc::new(Mutex::new(History::new(settings.history_size)));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_target(
            prober,
            addr,
            settings,
            startup_delay,
            Arc::clone(&history),
            cancel.clone(),
        ));

        Self {
            addr,
            history,
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
            task,
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Aggregate the History, optionally clearing it in the same lock
    pub fn compute(&self, clear: bool) -> Option<Metrics> {
        let mut history = self.history.lock();
        if clear {
            history.compute_and_clear()
        } else {
            history.compute()
        }
    }

    /// Cancel the loop and wait for it and its in-flight probes to finish
    pub async fn stop(self) {
        let Target {
            addr, cancel, task, ..
        } = self;
        cancel.cancel();
        if !join_task(task).await {
            tracing::error!(%addr, "target loop panicked");
        }
    }
}

/// Await a background task; false if it panicked
///
/// Cancellation is a normal way for these tasks to end and is not reported.
pub async fn join_task(task: JoinHandle<()>) -> bool {
    match task.await {
        Err(e) if e.is_panic() => false,
        _ => true,
    }
}

async fn run_target(
    prober: Arc<dyn Prober>,
    addr: IpAddr,
    settings: ProbeSettings,
    startup_delay: Duration,
    history: Arc<Mutex<History>>,
    cancel: CancellationToken,
) {
    if !startup_delay.is_zero() {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(startup_delay) => {}
        }
    }

    // First probe goes out one interval after start
    let Some(first_tick) = Instant::now().checked_add(settings.interval) else {
        tracing::error!(%addr, interval = ?settings.interval, "interval out of range, not polling");
        return;
    };
    let mut interval = tokio::time::interval_at(first_tick, settings.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut inflight: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let prober = Arc::clone(&prober);
                let history = Arc::clone(&history);
                let timeout = settings.timeout;
                inflight.spawn(async move {
                    let result = prober.probe(addr, timeout).await;
                    log_probe_error(addr, &result);
                    history.lock().record_result(&result);
                });
            }
            Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    tracing::error!(%addr, "probe task panicked");
                }
            }
        }
    }

    // Probes still waiting on a reply are abandoned; they never reach the
    // History once aborted
    inflight.abort_all();
    while inflight.join_next().await.is_some() {}
    tracing::debug!(%addr, "target stopped");
}

fn log_probe_error(addr: IpAddr, result: &Result<Duration, PingError>) {
    match result {
        Ok(_) | Err(PingError::Timeout) => {}
        Err(PingError::Unreachable { code }) => {
            tracing::trace!(%addr, code, "destination unreachable");
        }
        Err(e) => tracing::debug!(%addr, "probe failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every probe after a fixed delay
    struct FixedProber {
        delay: Duration,
        calls: AtomicUsize,
    }

    impl FixedProber {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Prober for FixedProber {
        async fn probe(&self, _addr: IpAddr, timeout: Duration) -> Result<Duration, PingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(PingError::Timeout);
            }
            tokio::time::sleep(self.delay).await;
            Ok(self.delay)
        }
    }

    fn settings(interval_ms: u64, timeout_ms: u64) -> ProbeSettings {
        ProbeSettings {
            interval: Duration::from_millis(interval_ms),
            timeout: Duration::from_millis(timeout_ms),
            history_size: 100,
        }
    }

    const ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));

    #[tokio::test(start_paused = true)]
    async fn test_polls_on_interval() {
        let prober = FixedProber::new(Duration::from_millis(10));
        let target = Target::spawn(prober.clone(), ADDR, settings(100, 50), Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(555)).await;
        let metrics = target.compute(false).unwrap();
        assert_eq!(metrics.packets_sent, 5);
        assert_eq!(metrics.packets_lost, 0);
        assert!((metrics.mean - 10.0).abs() < 1e-6);

        target.stop().await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probes_do_not_delay_ticks() {
        // Each probe outlives two intervals
        let prober = FixedProber::new(Duration::from_millis(250));
        let target = Target::spawn(prober.clone(), ADDR, settings(100, 1000), Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(510)).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 5);
        // Probes sent at 100, 200 have completed
        assert_eq!(target.compute(false).unwrap().packets_sent, 2);
        target.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_count_as_loss() {
        let prober = FixedProber::new(Duration::from_secs(10));
        let target = Target::spawn(prober, ADDR, settings(100, 50), Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(360)).await;
        let metrics = target.compute(false).unwrap();
        assert_eq!(metrics.packets_sent, 3);
        assert_eq!(metrics.packets_lost, 3);
        assert!(metrics.mean.is_nan());
        target.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_delay() {
        let prober = FixedProber::new(Duration::from_millis(1));
        let target = Target::spawn(
            prober.clone(),
            ADDR,
            settings(100, 50),
            Duration::from_millis(1000),
        );

        tokio::time::sleep(Duration::from_millis(1050)).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 1);
        target.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_startup_delay() {
        let prober = FixedProber::new(Duration::from_millis(1));
        let target = Target::spawn(prober.clone(), ADDR, settings(100, 50), Duration::from_secs(3600));

        let started = Instant::now();
        target.stop().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_records_after_stop() {
        let prober = FixedProber::new(Duration::from_millis(80));
        let target = Target::spawn(prober.clone(), ADDR, settings(50, 1000), Duration::ZERO);
        let history = Arc::clone(&target.history);

        // Two probes in flight at 120ms (sent at 50 and 100)
        tokio::time::sleep(Duration::from_millis(120)).await;
        target.stop().await;
        let recorded = history.lock().len();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(history.lock().len(), recorded);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_interval_does_not_panic() {
        let prober = FixedProber::new(Duration::from_millis(1));
        let settings = ProbeSettings {
            interval: Duration::MAX,
            ..settings(100, 50)
        };
        let target = Target::spawn(prober.clone(), ADDR, settings, Duration::ZERO);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
        target.stop().await;
    }

    #[tokio::test]
    async fn test_join_task_reports_panics() {
        assert!(join_task(tokio::spawn(async {})).await);

        let aborted = tokio::spawn(std::future::pending::<()>());
        aborted.abort();
        assert!(join_task(aborted).await);

        let panicked: JoinHandle<()> = tokio::spawn(async { panic!("refresh failed") });
        assert!(!join_task(panicked).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compute_with_clear() {
        let prober = FixedProber::new(Duration::from_millis(1));
        let target = Target::spawn(prober, ADDR, settings(100, 50), Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(target.compute(true).unwrap().packets_sent, 3);
        assert!(target.compute(false).is_none());
        target.stop().await;
    }
}

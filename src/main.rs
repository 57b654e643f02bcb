use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::io::Write;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use echomon::cli::Args;
use echomon::config::Config;
use echomon::export::{generate_report, write_json_lines};
use echomon::lookup::{DnsResolver, HostSet};
use echomon::monitor::{Monitor, join_task};
use echomon::probe::Pinger;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    init_logging(&args.log_level);

    let config = Config::from_args(&args)?;
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    let pinger = Arc::new(open_pinger(&config)?);
    let monitor = Arc::new(Monitor::new(pinger.clone(), config.probe_settings()));

    let resolver = DnsResolver::new(config.nameserver()?, config.dns_timeout)
        .context("Failed to create DNS resolver")?;
    let hosts = Arc::new(HostSet::new(Arc::new(resolver), monitor.clone()));

    for err in hosts.sync(&config.host_specs()).await {
        tracing::warn!("{}", err);
    }
    tracing::info!(
        hosts = hosts.hosts().len(),
        addresses = monitor.len().await,
        "monitoring started"
    );

    let cancel = CancellationToken::new();
    let refresh = {
        let hosts = Arc::clone(&hosts);
        let cancel = cancel.clone();
        let interval = config.dns_refresh;
        tokio::spawn(async move { hosts.run_refresh(interval, cancel).await })
    };

    run_reporter(&monitor, args.report_interval_duration(), args.json).await?;

    // Shutdown: stop refreshing, stop probing, then release the sockets
    cancel.cancel();
    if !join_task(refresh).await {
        tracing::error!("DNS refresh task panicked");
    }
    monitor.stop_all().await;
    tokio::task::spawn_blocking(move || pinger.close())
        .await
        .context("Failed to close sockets")?;

    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("echomon={}", level.to_lowercase())));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_pinger(config: &Config) -> Result<Pinger> {
    let (v4, v6) = config.needs_families();
    let pinger = Pinger::open(
        v4.then_some(Ipv4Addr::UNSPECIFIED),
        v6.then_some(Ipv6Addr::UNSPECIFIED),
    )
    .context("Failed to open ICMP sockets (need root, CAP_NET_RAW, or ping_group_range)")?;

    pinger
        .set_payload_size(config.payload_size)
        .context("Invalid payload size")?;
    if config.firewall_mark != 0 {
        pinger
            .set_mark(config.firewall_mark)
            .context("Failed to set firewall mark")?;
    }
    Ok(pinger)
}

/// Print a snapshot every `interval` until Ctrl-C
async fn run_reporter(monitor: &Monitor, interval: Duration, json: bool) -> Result<()> {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                tracing::info!("shutting down");
                return Ok(());
            }
            _ = ticker.tick() => {
                let snapshot = monitor.export(true).await;
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                if json {
                    write_json_lines(&snapshot, Utc::now(), &mut out)?;
                } else {
                    generate_report(&snapshot, Utc::now(), &mut out)?;
                    out.flush()?;
                }
            }
        }
    }
}

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::MAX_DURATION;

/// Continuous ICMP echo monitoring of hosts with rolling loss/latency statistics
#[derive(Parser, Debug, Clone)]
#[command(name = "echomon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Hosts to monitor (IP address or hostname); added to any in --config
    pub targets: Vec<String>,

    /// Path to a TOML configuration file
    #[arg(short = 'C', long = "config")]
    pub config: Option<PathBuf>,

    /// Probe interval in seconds
    #[arg(short = 'i', long = "interval")]
    pub interval: Option<f64>,

    /// Probe timeout in seconds
    #[arg(short = 't', long = "timeout")]
    pub timeout: Option<f64>,

    /// Number of probe results kept per address
    #[arg(long = "history-size")]
    pub history_size: Option<usize>,

    /// ICMP payload size in bytes
    #[arg(short = 's', long = "payload-size")]
    pub payload_size: Option<usize>,

    /// Firewall mark (SO_MARK) applied to probes; Linux only
    #[arg(long = "fw-mark")]
    pub fw_mark: Option<u32>,

    /// DNS refresh interval in seconds (0 = resolve once)
    #[arg(long = "dns-refresh")]
    pub dns_refresh: Option<f64>,

    /// Nameserver to query instead of the system resolver (ip or ip:port)
    #[arg(long = "dns-nameserver")]
    pub dns_nameserver: Option<String>,

    /// Timeout for one DNS lookup in seconds
    #[arg(long = "dns-timeout")]
    pub dns_timeout: Option<f64>,

    /// Do not monitor IPv4 addresses
    #[arg(long = "disable-ipv4")]
    pub disable_ipv4: bool,

    /// Do not monitor IPv6 addresses
    #[arg(long = "disable-ipv6")]
    pub disable_ipv6: bool,

    /// Seconds between metric reports
    #[arg(short = 'r', long = "report-interval", default_value = "10")]
    pub report_interval: f64,

    /// Print reports as JSON lines instead of a table
    #[arg(long = "json")]
    pub json: bool,

    /// Log level (debug, info, warn, error); RUST_LOG overrides
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

fn secs_to_duration(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok()
}

/// Check a seconds flag: finite, within `MAX_DURATION`, and positive unless
/// `allow_zero`
fn check_secs(name: &str, value: Option<f64>, allow_zero: bool) -> Result<(), String> {
    let Some(v) = value else {
        return Ok(());
    };
    if !v.is_finite() || v < 0.0 || (v == 0.0 && !allow_zero) {
        return Err(if allow_zero {
            format!("{} cannot be negative", name)
        } else {
            format!("{} must be positive", name)
        });
    }
    match secs_to_duration(v) {
        Some(d) if d <= MAX_DURATION => Ok(()),
        _ => Err(format!(
            "{} cannot exceed {} seconds",
            name,
            MAX_DURATION.as_secs()
        )),
    }
}

impl Args {
    pub fn interval_duration(&self) -> Option<Duration> {
        self.interval.and_then(secs_to_duration)
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.and_then(secs_to_duration)
    }

    pub fn dns_refresh_duration(&self) -> Option<Duration> {
        self.dns_refresh.and_then(secs_to_duration)
    }

    pub fn dns_timeout_duration(&self) -> Option<Duration> {
        self.dns_timeout.and_then(secs_to_duration)
    }

    /// Report interval, capped at `MAX_DURATION`
    pub fn report_interval_duration(&self) -> Duration {
        secs_to_duration(self.report_interval)
            .unwrap_or(MAX_DURATION)
            .min(MAX_DURATION)
    }

    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        if self.targets.is_empty() && self.config.is_none() {
            return Err("Specify at least one target or a --config file".into());
        }

        if self.disable_ipv4 && self.disable_ipv6 {
            return Err("Cannot specify both --disable-ipv4 and --disable-ipv6".into());
        }

        check_secs("Interval", self.interval, false)?;
        check_secs("Timeout", self.timeout, false)?;
        check_secs("DNS timeout", self.dns_timeout, false)?;
        check_secs("Report interval", Some(self.report_interval), false)?;
        check_secs("DNS refresh interval", self.dns_refresh, true)?;

        if self.history_size == Some(0) {
            return Err("History size must be at least 1".into());
        }

        let level = self.log_level.to_lowercase();
        if !["trace", "debug", "info", "warn", "error"].contains(&level.as_str()) {
            return Err(format!(
                "Unknown log level: {}. Use debug, info, warn, or error",
                self.log_level
            ));
        }

        Ok(())
    }
}

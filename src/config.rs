use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::cli::Args;
use crate::error::ResolveError;
use crate::lookup::{HostSpec, IpPolicy, parse_nameserver};
use crate::monitor::ProbeSettings;
use crate::probe::{DEFAULT_PAYLOAD_SIZE, MAX_PAYLOAD_SIZE};

/// Upper bound for every configured interval and timeout
pub const MAX_DURATION: Duration = Duration::from_secs(7 * 24 * 3600);

/// One monitored host with optional per-host address-family overrides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_ipv4: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_ipv6: Option<bool>,
}

impl TargetConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            disable_ipv4: None,
            disable_ipv6: None,
        }
    }
}

/// Runtime configuration: TOML file layered under CLI args
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interval between probes to one address
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    /// Probe timeout
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// Probe results kept per address
    pub history_size: usize,
    /// ICMP payload size in bytes
    pub payload_size: usize,
    /// SO_MARK for outgoing probes (0 = unset)
    pub firewall_mark: u32,
    /// Re-resolution interval (zero disables)
    #[serde(with = "duration_serde")]
    pub dns_refresh: Duration,
    /// Nameserver used instead of the system resolver (`ip` or `ip:port`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_nameserver: Option<String>,
    /// Overall timeout for one lookup
    #[serde(with = "option_duration_serde", skip_serializing_if = "Option::is_none")]
    pub dns_timeout: Option<Duration>,
    pub disable_ipv4: bool,
    pub disable_ipv6: bool,
    pub targets: Vec<TargetConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(4),
            history_size: 10,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            firewall_mark: 0,
            dns_refresh: Duration::from_secs(60),
            dns_nameserver: None,
            dns_timeout: None,
            disable_ipv4: false,
            disable_ipv6: false,
            targets: Vec::new(),
        }
    }
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        let mut config = Config::default();
        config.apply_args(args);
        config
    }
}

impl Config {
    /// Parse a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Load `--config` (if any), then apply the remaining flags on top
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_args(args);
        Ok(config)
    }

    /// Override fields with whatever flags were given
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(interval) = args.interval_duration() {
            self.interval = interval;
        }
        if let Some(timeout) = args.timeout_duration() {
            self.timeout = timeout;
        }
        if let Some(size) = args.history_size {
            self.history_size = size;
        }
        if let Some(size) = args.payload_size {
            self.payload_size = size;
        }
        if let Some(mark) = args.fw_mark {
            self.firewall_mark = mark;
        }
        if let Some(refresh) = args.dns_refresh_duration() {
            self.dns_refresh = refresh;
        }
        if let Some(ref nameserver) = args.dns_nameserver {
            self.dns_nameserver = Some(nameserver.clone());
        }
        if let Some(timeout) = args.dns_timeout_duration() {
            self.dns_timeout = Some(timeout);
        }
        self.disable_ipv4 |= args.disable_ipv4;
        self.disable_ipv6 |= args.disable_ipv6;

        for host in &args.targets {
            if !self.targets.iter().any(|t| &t.addr == host) {
                self.targets.push(TargetConfig::new(host.clone()));
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.targets.is_empty() {
            return Err("No targets configured".into());
        }
        if let Some(t) = self.targets.iter().find(|t| t.addr.trim().is_empty()) {
            return Err(format!("Target address cannot be empty: {:?}", t));
        }
        for (i, t) in self.targets.iter().enumerate() {
            if self.targets[..i].iter().any(|o| o.addr.trim() == t.addr.trim()) {
                return Err(format!("Duplicate target: {}", t.addr.trim()));
            }
        }
        if self.interval.is_zero() {
            return Err("Interval must be positive".into());
        }
        if self.timeout.is_zero() {
            return Err("Timeout must be positive".into());
        }
        if self.history_size == 0 {
            return Err("History size must be at least 1".into());
        }
        if self.payload_size > MAX_PAYLOAD_SIZE {
            return Err(format!("Payload size cannot exceed {}", MAX_PAYLOAD_SIZE));
        }
        if self.disable_ipv4 && self.disable_ipv6 {
            return Err("IPv4 and IPv6 cannot both be disabled".into());
        }
        if let Some(ref nameserver) = self.dns_nameserver {
            parse_nameserver(nameserver).map_err(|e| e.to_string())?;
        }
        if self.dns_timeout.is_some_and(|t| t.is_zero()) {
            return Err("DNS timeout must be positive".into());
        }
        let limits = [
            ("Interval", Some(self.interval)),
            ("Timeout", Some(self.timeout)),
            ("DNS refresh interval", Some(self.dns_refresh)),
            ("DNS timeout", self.dns_timeout),
        ];
        for (name, value) in limits {
            if value.is_some_and(|d| d > MAX_DURATION) {
                return Err(format!(
                    "{} cannot exceed {} seconds",
                    name,
                    MAX_DURATION.as_secs()
                ));
            }
        }
        Ok(())
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            interval: self.interval,
            timeout: self.timeout,
            history_size: self.history_size,
        }
    }

    pub fn nameserver(&self) -> Result<Option<SocketAddr>, ResolveError> {
        self.dns_nameserver.as_deref().map(parse_nameserver).transpose()
    }

    /// Hosts with their effective IP policy (per-target overrides win)
    pub fn host_specs(&self) -> Vec<HostSpec> {
        self.targets
            .iter()
            .map(|t| {
                HostSpec::new(t.addr.trim()).with_policy(IpPolicy {
                    ipv4: !t.disable_ipv4.unwrap_or(self.disable_ipv4),
                    ipv6: !t.disable_ipv6.unwrap_or(self.disable_ipv6),
                })
            })
            .collect()
    }

    /// Address families some target needs a socket for
    pub fn needs_families(&self) -> (bool, bool) {
        self.host_specs().iter().fold((false, false), |(v4, v6), spec| {
            (v4 || spec.policy.ipv4, v6 || spec.policy.ipv6)
        })
    }
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Serde helper for Option<Duration>
mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::net::IpAddr;

use crate::lookup::TargetKey;
use crate::state::Metrics;

/// One exported line: the key split into labels plus its metrics
#[derive(Debug, Serialize)]
pub struct MetricsRecord<'a> {
    pub timestamp: DateTime<Utc>,
    pub host: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_version: Option<&'static str>,
    pub loss_pct: f64,
    #[serde(flatten)]
    pub metrics: &'a Metrics,
}

/// Write a snapshot as JSON lines, one object per monitored address
///
/// Latencies are null when every probe in the window was lost.
pub fn write_json_lines<W: Write>(
    snapshot: &BTreeMap<String, Metrics>,
    timestamp: DateTime<Utc>,
    mut writer: W,
) -> anyhow::Result<()> {
    for (key, metrics) in snapshot {
        // Keys the monitor was given by something else are passed through whole
        let parsed: Option<TargetKey> = key.parse().ok();
        let record = MetricsRecord {
            timestamp,
            host: parsed.as_ref().map_or(key.as_str(), |k| k.host.as_str()),
            ip: parsed.as_ref().map(|k| k.addr),
            ip_version: parsed.as_ref().map(|k| k.version.as_str()),
            loss_pct: metrics.loss_pct(),
            metrics,
        };
        serde_json::to_writer(&mut writer, &record)?;
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::Write;

use crate::state::Metrics;

fn fmt_ms(value: f64) -> String {
    if value.is_nan() {
        "-".to_string()
    } else {
        format!("{:.1}ms", value)
    }
}

/// Generate a text report of one snapshot
pub fn generate_report<W: Write>(
    snapshot: &BTreeMap<String, Metrics>,
    timestamp: DateTime<Utc>,
    mut writer: W,
) -> std::io::Result<()> {
    writeln!(writer, "echomon report at {}", timestamp.format("%Y-%m-%d %H:%M:%S UTC"))?;

    // Header
    writeln!(
        writer,
        "{:<50} {:>6} {:>6} {:>6} {:>9} {:>9} {:>9} {:>9}",
        "Target", "Loss%", "Sent", "Lost", "Best", "Avg", "Worst", "StdDev"
    )?;
    writeln!(writer, "{}", "-".repeat(110))?;

    if snapshot.is_empty() {
        writeln!(writer, "(no samples yet)")?;
    }

    for (key, m) in snapshot {
        writeln!(
            writer,
            "{:<50} {:>5.1}% {:>6} {:>6} {:>9} {:>9} {:>9} {:>9}",
            key,
            m.loss_pct(),
            m.packets_sent,
            m.packets_lost,
            fmt_ms(m.best),
            fmt_ms(m.mean),
            fmt_ms(m.worst),
            fmt_ms(m.stddev)
        )?;
    }
    writeln!(writer)?;

    Ok(())
}

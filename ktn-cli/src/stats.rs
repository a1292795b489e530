//! Statistics display and formatting

use ktn_protocol::ConnectionStats;

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// One-line summary of a connection's counters
pub fn display_connection_stats(stats: &ConnectionStats) -> String {
    let dropped = stats.packets_invalid
        + stats.packets_foreign
        + stats.packets_stale
        + stats.packets_unexpected;
    format!(
        "sent {} ({} retransmitted, {}) | received {} ({}) | dropped {} ({} invalid, {} stale) | re-acks {}",
        stats.packets_sent,
        stats.packets_retransmitted,
        format_bytes(stats.bytes_sent),
        stats.packets_received,
        format_bytes(stats.bytes_received),
        dropped,
        stats.packets_invalid,
        stats.packets_stale,
        stats.reacks_sent,
    )
}

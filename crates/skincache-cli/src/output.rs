//! Human-readable rendering of cache status.

use std::fmt::Write;

use skincache_sw::CacheStatus;

const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];

/// Format a byte count with a 1024 base and at most two decimals.
///
/// Trailing zeros are dropped, so 1536 renders as `1.5 KB` and 1024 as
/// `1 KB`.
pub fn format_cache_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = format!("{value:.2}");
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed} {}", UNITS[unit])
}

/// Render partition usage as an aligned table followed by a totals line.
pub fn render_status(status: &CacheStatus) -> String {
    if status.is_empty() {
        return "No cached partitions\n".to_string();
    }

    let width = status
        .keys()
        .map(String::len)
        .max()
        .unwrap_or(0)
        .max("PARTITION".len());

    let mut out = String::new();
    let _ = writeln!(out, "{:<width$}  {:>8}  {:>12}", "PARTITION", "ENTRIES", "SIZE");

    let (mut entries, mut bytes) = (0usize, 0u64);
    for (name, usage) in status {
        entries += usage.count;
        bytes += usage.size;
        let _ = writeln!(
            out,
            "{:<width$}  {:>8}  {:>12}",
            name,
            usage.count,
            format_cache_size(usage.size)
        );
    }

    let _ = writeln!(
        out,
        "{:<width$}  {:>8}  {:>12}",
        "TOTAL",
        entries,
        format_cache_size(bytes)
    );
    out
}

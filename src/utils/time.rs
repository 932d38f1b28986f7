use chrono::{DateTime, Local, Utc};

/// Formats accumulated seconds the way totals are shown everywhere: `1h 2m 3s`.
pub fn format_total_time(seconds: u64) -> String {
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;
    format!("{h}h {m}m {s}s")
}

/// `[date time]` prefix used by exported logs. Rendered in local time.
pub fn format_log_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp
        .with_timezone(&Local)
        .format("%x %H:%M:%S")
        .to_string()
}

/// Utility functions for clock arithmetic and formatting
use time::{format_description, OffsetDateTime};

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    let format = format_description::parse("[day].[month].[year] - [hour]:[minute]:[second]")
        .expect("Failed to create format description");
    dt.format(&format).unwrap_or_else(|_| dt.to_string())
}

/// Milliseconds elapsed between two readings of a wrapping millisecond counter
///
/// Unsigned subtraction keeps the result correct across a counter rollover,
/// as long as the real interval is shorter than one full counter period.
pub fn elapsed_ms(now: u32, since: u32) -> u32 {
    now.wrapping_sub(since)
}

/// True once at least `period` milliseconds have passed since `since`
pub fn period_elapsed(now: u32, since: u32, period: u32) -> bool {
    elapsed_ms(now, since) >= period
}

/// Render an averaged metric as the fixed-point text the hub expects
pub fn format_fixed(value: f32) -> String {
    format!("{:.2}", value)
}

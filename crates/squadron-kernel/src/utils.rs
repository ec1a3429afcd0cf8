use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current timestamp in milliseconds since the UNIX epoch safely.
pub fn now_ms() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    u64::try_from(millis).unwrap_or(0)
}

/// Saturating conversion of a duration to whole milliseconds.
pub fn duration_ms(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

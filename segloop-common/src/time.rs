//! Timestamp utilities

use chrono::{DateTime, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current time as Unix epoch milliseconds (the stored timestamp format)
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert stored epoch milliseconds back into a UTC timestamp
pub fn from_ms(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
}

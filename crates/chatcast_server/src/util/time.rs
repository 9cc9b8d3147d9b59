#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	unix_ms(SystemTime::now())
}

/// Unix milliseconds for `t`; times before the epoch clamp to 0.
#[inline]
pub fn unix_ms(t: SystemTime) -> i64 {
	t.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

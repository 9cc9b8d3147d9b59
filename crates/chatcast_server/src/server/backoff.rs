#![forbid(unsafe_code)]

use std::time::Duration;

use crate::config::MonitorSettings;

/// Exponent base for reconnect delays. Upstream throttles base-2 retry bursts.
const BACKOFF_FACTOR: u32 = 3;

/// Reconnect policy for one Shared Monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
	pub base: Duration,
	pub max: Duration,
	pub max_attempts: u32,
}

impl Default for BackoffPolicy {
	fn default() -> Self {
		Self {
			base: Duration::from_millis(1000),
			max: Duration::from_millis(120_000),
			max_attempts: 5,
		}
	}
}

impl From<&MonitorSettings> for BackoffPolicy {
	fn from(s: &MonitorSettings) -> Self {
		Self {
			base: s.reconnect_base,
			max: s.reconnect_max,
			max_attempts: s.reconnect_max_attempts,
		}
	}
}

impl BackoffPolicy {
	/// Delay before reconnect `attempt` (1-based): `min(base * 3^(attempt-1), max)`.
	///
	/// `None` once the attempt budget is spent.
	pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
		if attempt == 0 || attempt > self.max_attempts {
			return None;
		}

		let pow = (attempt - 1).min(32);
		let factor = u128::from(BACKOFF_FACTOR).saturating_pow(pow);
		let ms = self.base.as_millis().saturating_mul(factor);
		let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
		Some(d.min(self.max))
	}
}

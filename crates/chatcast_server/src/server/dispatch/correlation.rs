#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use chatcast_domain::{AuthorId, ChannelId};
use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct DonorWindow {
	amount: f64,
	registered_at: Instant,
}

/// Donor correlation windows keyed by `(channel, author)`.
///
/// A window lives for `ttl` after registration and is consumed by the first
/// successful [`CorrelationWindows::take`]. Expired windows are purged lazily
/// on lookup; there is no background sweep.
#[derive(Debug)]
pub struct CorrelationWindows {
	ttl: Duration,
	windows: Mutex<HashMap<ChannelId, HashMap<AuthorId, DonorWindow>>>,
}

impl CorrelationWindows {
	pub fn new(ttl: Duration) -> Self {
		Self {
			ttl,
			windows: Mutex::new(HashMap::new()),
		}
	}

	/// Open (or replace) a window; the latest donation wins, amounts do not accumulate.
	pub fn register(&self, channel: &ChannelId, author: &AuthorId, amount: f64) {
		self.windows.lock().entry(channel.clone()).or_default().insert(
			author.clone(),
			DonorWindow {
				amount,
				registered_at: Instant::now(),
			},
		);
	}

	/// Consume the author's open window, returning its amount.
	pub fn take(&self, channel: &ChannelId, author: &AuthorId) -> Option<f64> {
		let now = Instant::now();
		let mut windows = self.windows.lock();
		let per_channel = windows.get_mut(channel)?;

		per_channel.retain(|_, w| now.duration_since(w.registered_at) < self.ttl);
		let taken = per_channel.remove(author).map(|w| w.amount);

		if per_channel.is_empty() {
			windows.remove(channel);
		}
		taken
	}

	/// Whether the author currently has an unexpired window (does not consume it).
	pub fn is_open(&self, channel: &ChannelId, author: &AuthorId) -> bool {
		let now = Instant::now();
		self.windows
			.lock()
			.get(channel)
			.and_then(|m| m.get(author))
			.is_some_and(|w| now.duration_since(w.registered_at) < self.ttl)
	}

	pub fn forget_channel(&self, channel: &ChannelId) {
		self.windows.lock().remove(channel);
	}
}

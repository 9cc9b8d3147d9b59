#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chatcast_domain::ChannelId;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Envelope published to overlay clients: `{type, channel, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastEnvelope {
	#[serde(rename = "type")]
	pub kind: BroadcastKind,
	pub channel: ChannelId,
	pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastKind {
	Tts,
	Poll,
	Moderation,
	Monitor,
}

impl BroadcastEnvelope {
	pub fn new(kind: BroadcastKind, channel: ChannelId, payload: impl Serialize) -> Self {
		let payload = serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);
		Self { kind, channel, payload }
	}
}

#[derive(Debug, Clone)]
pub struct BroadcastHubConfig {
	/// Maximum number of queued items per subscriber.
	pub subscriber_queue_capacity: usize,
}

impl Default for BroadcastHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 256,
		}
	}
}

/// Items emitted on a subscriber stream.
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastItem {
	Event(BroadcastEnvelope),

	/// Indicates the subscriber is lagging and items were dropped.
	Lagged { dropped: u64 },
}

/// Per-channel topic hub for overlay clients.
///
/// Publishing never waits: a full subscriber queue drops the item and the
/// subscriber later receives a [`BroadcastItem::Lagged`] marker.
#[derive(Debug, Clone)]
pub struct BroadcastHub {
	inner: Arc<Mutex<Inner>>,
	cfg: BroadcastHubConfig,
}

impl BroadcastHub {
	pub fn new(cfg: BroadcastHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	pub fn subscribe(&self, channel: &ChannelId) -> mpsc::Receiver<BroadcastItem> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity);

		let mut inner = self.inner.lock();
		let entry = inner.topics.entry(channel.clone()).or_default();
		entry.prune_closed();
		entry.subscribers.push(Sub { tx, pending_lag: 0 });

		debug!(%channel, subs = entry.subscribers.len(), "broadcast hub: subscribed");
		rx
	}

	pub fn publish(&self, envelope: BroadcastEnvelope) {
		metrics::counter!("chatcast_broadcast_published_total").increment(1);

		let mut inner = self.inner.lock();
		let channel = envelope.channel.clone();
		let Some(entry) = inner.topics.get_mut(&channel) else {
			return;
		};

		let mut dropped_total: u64 = 0;
		for sub in entry.subscribers.iter_mut() {
			match sub.tx.try_send(BroadcastItem::Event(envelope.clone())) {
				Ok(()) => {
					if sub.pending_lag > 0
						&& sub
							.tx
							.try_send(BroadcastItem::Lagged {
								dropped: sub.pending_lag,
							})
							.is_ok()
					{
						sub.pending_lag = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;
					sub.pending_lag = sub.pending_lag.saturating_add(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		entry.prune_closed();
		if entry.subscribers.is_empty() {
			inner.topics.remove(&channel);
		}

		if dropped_total > 0 {
			metrics::counter!("chatcast_broadcast_dropped_total").increment(dropped_total);
			debug!(%channel, dropped = dropped_total, "broadcast hub: dropped due to full subscriber queues");
		}
	}

	pub fn subscriber_count(&self, channel: &ChannelId) -> usize {
		let inner = self.inner.lock();
		inner
			.topics
			.get(channel)
			.map(|t| t.subscribers.iter().filter(|s| !s.tx.is_closed()).count())
			.unwrap_or(0)
	}
}

#[derive(Debug, Default)]
struct Inner {
	topics: HashMap<ChannelId, Topic>,
}

#[derive(Debug, Default)]
struct Topic {
	subscribers: Vec<Sub>,
}

#[derive(Debug)]
struct Sub {
	tx: mpsc::Sender<BroadcastItem>,

	/// Items dropped since the last delivered lag marker.
	pending_lag: u64,
}

impl Topic {
	fn prune_closed(&mut self) {
		self.subscribers.retain(|s| !s.tx.is_closed());
	}
}

#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chatcast_domain::{AuthorId, ChannelId};
use chatcast_platform::ChatMessage;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::correlation::CorrelationWindows;
use super::render::render_text;
use super::{TriggerKind, TtsRecord};
use crate::config::DispatchSettings;
use crate::server::broadcast::{BroadcastEnvelope, BroadcastHub, BroadcastKind};
use crate::server::monitor::MessageHandler;
use crate::server::settings::SettingsService;
use crate::server::store::Store;
use crate::server::terms::TermLists;
use crate::util::time::unix_ms_now;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
	/// How long a registered donation stays claimable by its author.
	pub correlation_window: Duration,
	pub unit_symbol: String,
}

impl Default for DispatchConfig {
	fn default() -> Self {
		Self::from(&DispatchSettings::default())
	}
}

impl From<&DispatchSettings> for DispatchConfig {
	fn from(s: &DispatchSettings) -> Self {
		Self {
			correlation_window: s.correlation_window,
			unit_symbol: s.unit_symbol.clone(),
		}
	}
}

/// Why a message was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
	Disabled,
	Empty,
	NoDonation,
	BannedTerm,
	TooLong,
	Cooldown,
}

impl RejectReason {
	pub fn as_str(self) -> &'static str {
		match self {
			RejectReason::Disabled => "disabled",
			RejectReason::Empty => "empty",
			RejectReason::NoDonation => "no_donation",
			RejectReason::BannedTerm => "banned_term",
			RejectReason::TooLong => "too_long",
			RejectReason::Cooldown => "cooldown",
		}
	}
}

#[derive(Debug, Clone)]
struct QueueEntry {
	author: AuthorId,
	text: String,
	kind: TriggerKind,
	amount: Option<f64>,
}

#[derive(Default)]
struct ChannelQueue {
	entries: VecDeque<QueueEntry>,
	draining: bool,

	/// Time of the last successful drain; the cooldown runs from here.
	last_drain: Option<Instant>,
	drain_task: Option<JoinHandle<()>>,
}

/// Where drained entries go.
struct Sink {
	store: Arc<dyn Store>,
	hub: BroadcastHub,
	settings: Arc<SettingsService>,
	unit_symbol: String,
}

/// Per-channel FIFO of accepted chat lines, drained one at a time against the
/// channel's cooldown.
pub struct DispatchQueue {
	sink: Arc<Sink>,
	terms: Arc<TermLists>,
	windows: CorrelationWindows,
	channels: Mutex<HashMap<ChannelId, Arc<Mutex<ChannelQueue>>>>,
}

impl DispatchQueue {
	pub fn new(
		cfg: DispatchConfig,
		settings: Arc<SettingsService>,
		terms: Arc<TermLists>,
		store: Arc<dyn Store>,
		hub: BroadcastHub,
	) -> Self {
		Self {
			sink: Arc::new(Sink {
				store,
				hub,
				settings,
				unit_symbol: cfg.unit_symbol,
			}),
			terms,
			windows: CorrelationWindows::new(cfg.correlation_window),
			channels: Mutex::new(HashMap::new()),
		}
	}

	/// Record a donation so the donor's next message is read out.
	pub fn register_donation(&self, channel: &ChannelId, author: &AuthorId, amount: f64) {
		self.windows.register(channel, author, amount);
		metrics::counter!("chatcast_donations_registered_total").increment(1);
		info!(%channel, %author, amount, "dispatch: donation registered");
	}

	pub fn has_open_donation(&self, channel: &ChannelId, author: &AuthorId) -> bool {
		self.windows.is_open(channel, author)
	}

	/// Entries accepted but not yet drained.
	pub fn queued(&self, channel: &ChannelId) -> usize {
		self.channels
			.lock()
			.get(channel)
			.map(|q| q.lock().entries.len())
			.unwrap_or(0)
	}

	/// Filter one chat line and queue it when accepted.
	///
	/// A matching donor window is consumed before the content filters run, so
	/// a rejected donor message still spends the donation.
	pub fn offer(&self, channel: &ChannelId, author: &AuthorId, text: &str) -> Result<TriggerKind, RejectReason> {
		let settings = self.sink.settings.current(channel);
		if !settings.tts.enabled {
			return Err(RejectReason::Disabled);
		}

		let text = text.trim();
		if text.is_empty() {
			return Err(RejectReason::Empty);
		}

		let amount = self.windows.take(channel, author);
		if settings.tts.donation_gated && amount.is_none() {
			return Err(RejectReason::NoDonation);
		}
		let kind = if amount.is_some() {
			TriggerKind::Donation
		} else {
			TriggerKind::Regular
		};

		if let Some(m) = self.terms.find(&settings.automod, text) {
			debug!(%channel, %author, term = %m.term, source = m.source.as_str(), "dispatch: banned term");
			return Err(RejectReason::BannedTerm);
		}

		if text.chars().count() > settings.tts.max_length {
			return Err(RejectReason::TooLong);
		}

		let cooldown = Duration::from_secs(settings.tts.cooldown_secs);
		let queue = self.queue_for(channel);
		let mut q = queue.lock();

		if let Some(last) = q.last_drain
			&& last + cooldown > Instant::now()
		{
			return Err(RejectReason::Cooldown);
		}

		q.entries.push_back(QueueEntry {
			author: author.clone(),
			text: text.to_string(),
			kind,
			amount,
		});
		metrics::counter!("chatcast_dispatch_accepted_total").increment(1);

		if !q.draining {
			q.draining = true;
			let sink = Arc::clone(&self.sink);
			let channel = channel.clone();
			let queue = Arc::clone(&queue);
			q.drain_task = Some(tokio::spawn(drain(sink, channel, queue)));
		}

		Ok(kind)
	}

	/// Drop all state of a channel and stop its drain task.
	pub fn forget(&self, channel: &ChannelId) {
		let removed = self.channels.lock().remove(channel);
		if let Some(queue) = removed {
			let mut q = queue.lock();
			if let Some(task) = q.drain_task.take() {
				task.abort();
			}
			q.entries.clear();
			q.draining = false;
		}
		self.windows.forget_channel(channel);
	}

	fn queue_for(&self, channel: &ChannelId) -> Arc<Mutex<ChannelQueue>> {
		Arc::clone(self.channels.lock().entry(channel.clone()).or_default())
	}
}

impl MessageHandler for DispatchQueue {
	fn on_message(&self, channel: &ChannelId, msg: &ChatMessage) -> anyhow::Result<()> {
		match self.offer(channel, &msg.author, &msg.text) {
			Ok(kind) => debug!(%channel, author = %msg.author, kind = kind.as_str(), "dispatch: queued"),
			Err(RejectReason::Disabled) => {}
			Err(reason) => {
				metrics::counter!("chatcast_dispatch_rejected_total", "reason" => reason.as_str()).increment(1);
				debug!(%channel, author = %msg.author, reason = reason.as_str(), "dispatch: rejected");
			}
		}
		Ok(())
	}
}

/// Pop, render, persist and broadcast entries one at a time until the queue is empty.
///
/// The head is only popped once `last_drain + cooldown` has passed, using the
/// cooldown in effect at that moment.
async fn drain(sink: Arc<Sink>, channel: ChannelId, queue: Arc<Mutex<ChannelQueue>>) {
	loop {
		let wait = {
			let cooldown = Duration::from_secs(sink.settings.current(&channel).tts.cooldown_secs);
			let q = queue.lock();
			q.last_drain
				.map(|last| (last + cooldown).saturating_duration_since(Instant::now()))
				.unwrap_or_default()
		};
		if !wait.is_zero() {
			tokio::time::sleep(wait).await;
			continue;
		}

		let entry = {
			let mut q = queue.lock();
			match q.entries.pop_front() {
				Some(e) => e,
				None => {
					q.draining = false;
					q.drain_task = None;
					return;
				}
			}
		};

		let record = TtsRecord {
			id: Uuid::new_v4(),
			channel: channel.clone(),
			text: render_text(&entry.author, &entry.text, entry.kind, entry.amount, &sink.unit_symbol),
			author: entry.author,
			kind: entry.kind,
			amount: entry.amount,
			created_at_ms: unix_ms_now(),
		};

		if let Err(e) = sink.store.save_record(&record).await {
			warn!(%channel, error = %e, "dispatch: failed to persist record");
		}

		sink.hub
			.publish(BroadcastEnvelope::new(BroadcastKind::Tts, channel.clone(), &record));
		queue.lock().last_drain = Some(Instant::now());

		metrics::counter!("chatcast_dispatch_drained_total").increment(1);
		debug!(%channel, id = %record.id, kind = record.kind.as_str(), "dispatch: drained");
	}
}

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chatcast_domain::{AuthorId, ChannelId};
use chatcast_platform::{BAN_REASON_CODE, BanClient, ChatMessage};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::server::broadcast::{BroadcastEnvelope, BroadcastHub, BroadcastKind};
use crate::server::monitor::MessageHandler;
use crate::server::settings::SettingsService;
use crate::server::terms::TermLists;

#[derive(Default)]
struct ChannelModeration {
	room: String,

	/// Authors whose ban succeeded.
	banned: HashSet<AuthorId>,

	/// Authors with a ban call in flight.
	pending: HashSet<AuthorId>,

	/// Authors whose ban was refused for lack of permission. Cleared when the
	/// channel is attached again.
	denied: HashSet<AuthorId>,
}

/// Payload of a `moderation` broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct ModerationNotice {
	pub author: AuthorId,
	pub message: String,
}

/// Bans authors whose messages contain a banned term.
///
/// A violation leads straight to a ban; there are no warning or timeout tiers.
/// The ban call runs in its own task so fan-out never waits on it. Transient
/// failures are tried again on the author's next violation; a permission
/// failure is not, until the channel is re-registered.
pub struct ModerationEngine {
	ban: Option<Arc<dyn BanClient>>,
	settings: Arc<SettingsService>,
	terms: Arc<TermLists>,
	hub: BroadcastHub,
	channels: Mutex<HashMap<ChannelId, Arc<Mutex<ChannelModeration>>>>,
	bans_issued: Mutex<HashMap<ChannelId, Arc<AtomicU64>>>,
}

impl ModerationEngine {
	pub fn new(
		ban: Option<Arc<dyn BanClient>>,
		settings: Arc<SettingsService>,
		terms: Arc<TermLists>,
		hub: BroadcastHub,
	) -> Self {
		if ban.is_none() {
			warn!("moderation: no ban client configured; violations are only logged");
		}
		Self {
			ban,
			settings,
			terms,
			hub,
			channels: Mutex::new(HashMap::new()),
			bans_issued: Mutex::new(HashMap::new()),
		}
	}

	/// Start moderating a channel whose chat runs in `room`.
	pub fn attach(&self, channel: &ChannelId, room: &str) {
		let state = ChannelModeration {
			room: room.to_string(),
			..ChannelModeration::default()
		};
		self.channels
			.lock()
			.insert(channel.clone(), Arc::new(Mutex::new(state)));
	}

	pub fn forget(&self, channel: &ChannelId) {
		self.channels.lock().remove(channel);
	}

	/// Bans issued for the channel since the process started.
	pub fn bans_issued(&self, channel: &ChannelId) -> u64 {
		self.bans_issued
			.lock()
			.get(channel)
			.map(|c| c.load(Ordering::Relaxed))
			.unwrap_or(0)
	}

	/// Whether a ban of `author` was refused for lack of permission.
	pub fn is_denied(&self, channel: &ChannelId, author: &AuthorId) -> bool {
		self.channels
			.lock()
			.get(channel)
			.is_some_and(|s| s.lock().denied.contains(author))
	}

	pub fn is_banned(&self, channel: &ChannelId, author: &AuthorId) -> bool {
		self.channels
			.lock()
			.get(channel)
			.is_some_and(|s| s.lock().banned.contains(author))
	}

	fn counter(&self, channel: &ChannelId) -> Arc<AtomicU64> {
		Arc::clone(self.bans_issued.lock().entry(channel.clone()).or_default())
	}

	fn check(&self, channel: &ChannelId, msg: &ChatMessage) {
		let settings = self.settings.current(channel);
		if !settings.automod.enabled {
			return;
		}

		let Some(hit) = self.terms.find(&settings.automod, &msg.text) else {
			return;
		};

		let Some(state) = self.channels.lock().get(channel).cloned() else {
			warn!(%channel, "moderation: message for unattached channel");
			return;
		};

		let room = {
			let mut s = state.lock();
			if s.banned.contains(&msg.author) || s.pending.contains(&msg.author) {
				debug!(%channel, author = %msg.author, "moderation: author already banned");
				return;
			}
			if s.denied.contains(&msg.author) {
				debug!(%channel, author = %msg.author, "moderation: ban previously refused; not retrying");
				return;
			}
			s.pending.insert(msg.author.clone());
			s.room.clone()
		};

		info!(
			%channel,
			author = %msg.author,
			term = %hit.term,
			source = hit.source.as_str(),
			"moderation: banned term found; banning author"
		);

		let Some(client) = self.ban.clone() else {
			state.lock().pending.remove(&msg.author);
			warn!(%channel, author = %msg.author, "moderation: ban skipped; no ban client configured");
			return;
		};

		let channel = channel.clone();
		let author = msg.author.clone();
		let hub = self.hub.clone();
		let counter = self.counter(&channel);

		tokio::spawn(async move {
			let result = client.ban(&room, &author, BAN_REASON_CODE).await;

			let mut s = state.lock();
			s.pending.remove(&author);
			match result {
				Ok(()) => {
					s.banned.insert(author.clone());
					drop(s);
					counter.fetch_add(1, Ordering::Relaxed);
					metrics::counter!("chatcast_moderation_bans_total").increment(1);
					info!(%channel, %author, "moderation: author banned");
				}
				Err(e) => {
					if e.is_permission() {
						s.denied.insert(author.clone());
					}
					drop(s);
					metrics::counter!("chatcast_moderation_ban_failures_total").increment(1);
					warn!(%channel, %author, error = %e, "moderation: ban failed");
					if e.is_permission() {
						hub.publish(BroadcastEnvelope::new(
							BroadcastKind::Moderation,
							channel.clone(),
							ModerationNotice {
								author,
								message: e.to_string(),
							},
						));
					}
				}
			}
		});
	}
}

impl MessageHandler for ModerationEngine {
	fn on_message(&self, channel: &ChannelId, msg: &ChatMessage) -> anyhow::Result<()> {
		self.check(channel, msg);
		Ok(())
	}
}

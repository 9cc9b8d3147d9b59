#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chatcast_domain::ChannelId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::server::store::Store;

/// Current settings schema version.
pub const SETTINGS_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtsSettings {
	pub enabled: bool,

	/// Only donors with an open correlation window are read out.
	pub donation_gated: bool,

	/// Minimum seconds between two drained records.
	pub cooldown_secs: u64,

	/// Messages longer than this (in chars) are dropped.
	pub max_length: usize,
}

impl Default for TtsSettings {
	fn default() -> Self {
		Self {
			enabled: false,
			donation_gated: false,
			cooldown_secs: 10,
			max_length: 200,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
	/// Identities allowed to start polls and manage this list.
	pub whitelist: Vec<String>,
}

impl PollSettings {
	pub fn is_whitelisted(&self, id: &str) -> bool {
		self.whitelist.iter().any(|w| w == id)
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomodSettings {
	pub enabled: bool,
	pub custom_words: Vec<String>,
	pub use_slur_list: bool,
	pub use_spam_list: bool,
}

/// Effective per-channel settings after defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettings {
	pub version: u32,
	pub tts: TtsSettings,
	pub poll: PollSettings,
	pub automod: AutomodSettings,
}

impl Default for ChannelSettings {
	fn default() -> Self {
		Self {
			version: SETTINGS_VERSION,
			tts: TtsSettings::default(),
			poll: PollSettings::default(),
			automod: AutomodSettings::default(),
		}
	}
}

/// Settings as persisted; every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredSettings {
	#[serde(default)]
	pub version: Option<u32>,
	#[serde(default)]
	pub tts: Option<StoredTts>,
	#[serde(default)]
	pub poll: Option<StoredPoll>,
	#[serde(default)]
	pub automod: Option<StoredAutomod>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredTts {
	pub enabled: Option<bool>,
	pub donation_gated: Option<bool>,
	pub cooldown_secs: Option<u64>,
	pub max_length: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredPoll {
	pub whitelist: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredAutomod {
	pub enabled: Option<bool>,
	pub custom_words: Option<Vec<String>>,
	pub use_slur_list: Option<bool>,
	pub use_spam_list: Option<bool>,
}

/// Fill every missing field from the defaults. `None` yields full defaults.
pub fn merge_defaults(stored: Option<StoredSettings>) -> ChannelSettings {
	let d = ChannelSettings::default();
	let Some(s) = stored else {
		return d;
	};

	let tts = s.tts.unwrap_or_default();
	let poll = s.poll.unwrap_or_default();
	let automod = s.automod.unwrap_or_default();

	ChannelSettings {
		version: s.version.unwrap_or(d.version),
		tts: TtsSettings {
			enabled: tts.enabled.unwrap_or(d.tts.enabled),
			donation_gated: tts.donation_gated.unwrap_or(d.tts.donation_gated),
			cooldown_secs: tts.cooldown_secs.unwrap_or(d.tts.cooldown_secs),
			max_length: tts.max_length.filter(|v| *v > 0).unwrap_or(d.tts.max_length),
		},
		poll: PollSettings {
			whitelist: poll
				.whitelist
				.map(|w| w.into_iter().map(|id| id.trim().to_string()).filter(|id| !id.is_empty()).collect())
				.unwrap_or(d.poll.whitelist),
		},
		automod: AutomodSettings {
			enabled: automod.enabled.unwrap_or(d.automod.enabled),
			custom_words: automod
				.custom_words
				.map(|w| w.into_iter().map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect())
				.unwrap_or(d.automod.custom_words),
			use_slur_list: automod.use_slur_list.unwrap_or(d.automod.use_slur_list),
			use_spam_list: automod.use_spam_list.unwrap_or(d.automod.use_spam_list),
		},
	}
}

impl From<&ChannelSettings> for StoredSettings {
	fn from(s: &ChannelSettings) -> Self {
		Self {
			version: Some(s.version),
			tts: Some(StoredTts {
				enabled: Some(s.tts.enabled),
				donation_gated: Some(s.tts.donation_gated),
				cooldown_secs: Some(s.tts.cooldown_secs),
				max_length: Some(s.tts.max_length),
			}),
			poll: Some(StoredPoll {
				whitelist: Some(s.poll.whitelist.clone()),
			}),
			automod: Some(StoredAutomod {
				enabled: Some(s.automod.enabled),
				custom_words: Some(s.automod.custom_words.clone()),
				use_slur_list: Some(s.automod.use_slur_list),
				use_spam_list: Some(s.automod.use_spam_list),
			}),
		}
	}
}

/// Per-channel settings snapshots backed by the store.
///
/// Readers on the message path use [`SettingsService::current`]; every
/// write goes through the store and is followed by a re-read. Writes made
/// to the store by other processes are picked up by
/// [`SettingsService::spawn_refresher`].
pub struct SettingsService {
	store: Arc<dyn Store>,
	snapshots: RwLock<HashMap<ChannelId, Arc<ChannelSettings>>>,
}

impl SettingsService {
	pub fn new(store: Arc<dyn Store>) -> Self {
		Self {
			store,
			snapshots: RwLock::new(HashMap::new()),
		}
	}

	/// Re-read a channel's settings from the store and refresh the snapshot.
	pub async fn reload(&self, channel: &ChannelId) -> anyhow::Result<Arc<ChannelSettings>> {
		let stored = self
			.store
			.get_settings(channel)
			.await
			.with_context(|| format!("load settings for {channel}"))?;
		let merged = Arc::new(merge_defaults(stored));
		self.snapshots.write().insert(channel.clone(), Arc::clone(&merged));
		debug!(%channel, version = merged.version, "settings: snapshot refreshed");
		Ok(merged)
	}

	/// Persist new settings, then re-read them.
	pub async fn update(&self, channel: &ChannelId, settings: &ChannelSettings) -> anyhow::Result<Arc<ChannelSettings>> {
		let stored = StoredSettings::from(settings);
		self.store
			.put_settings(channel, &stored)
			.await
			.with_context(|| format!("save settings for {channel}"))?;
		self.reload(channel).await
	}

	/// Latest snapshot; defaults when the channel was never loaded.
	pub fn current(&self, channel: &ChannelId) -> Arc<ChannelSettings> {
		self.snapshots
			.read()
			.get(channel)
			.cloned()
			.unwrap_or_else(|| Arc::new(ChannelSettings::default()))
	}

	/// Re-read `channel` from the store every `interval` until aborted.
	pub fn spawn_refresher(self: &Arc<Self>, channel: ChannelId, interval: Duration) -> JoinHandle<()> {
		let this = Arc::clone(self);
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				if let Err(e) = this.reload(&channel).await {
					warn!(%channel, error = %e, "settings: periodic reload failed; keeping last snapshot");
					metrics::counter!("chatcast_settings_reload_failures_total").increment(1);
				}
			}
		})
	}

	pub fn forget(&self, channel: &ChannelId) {
		self.snapshots.write().remove(channel);
	}
}

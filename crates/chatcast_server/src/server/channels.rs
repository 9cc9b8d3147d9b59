#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chatcast_domain::{Channel, ChannelId};
use chatcast_platform::LedgerClient;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::server::broadcast::{BroadcastEnvelope, BroadcastHub, BroadcastKind};
use crate::server::dispatch::DispatchQueue;
use crate::server::donations::{DonationWatcherConfig, spawn_donation_watcher};
use crate::server::moderation::ModerationEngine;
use crate::server::poll::PollService;
use crate::server::registry::{MonitorHandle, MonitorRegistry};
use crate::server::settings::{ChannelSettings, SettingsService};

pub const SUBSCRIBER_MODERATION: &str = "moderation";
pub const SUBSCRIBER_DISPATCH: &str = "dispatch";
pub const SUBSCRIBER_POLL: &str = "poll";

struct Registered {
	channel: Channel,
	watcher: Option<JoinHandle<()>>,
	status_forwarder: JoinHandle<()>,
	settings_refresher: JoinHandle<()>,
}

/// Engines and collaborators a [`ChannelService`] wires together.
pub struct ChannelServiceDeps {
	pub registry: Arc<MonitorRegistry>,
	pub settings: Arc<SettingsService>,
	pub dispatch: Arc<DispatchQueue>,
	pub moderation: Arc<ModerationEngine>,
	pub polls: Arc<PollService>,
	pub hub: BroadcastHub,
	pub ledger: Option<Arc<dyn LedgerClient>>,
	pub watcher: DonationWatcherConfig,

	/// How often registered channels re-read their settings from the store.
	pub settings_refresh: Duration,
}

/// Channel lifecycle: register, deregister and settings updates.
pub struct ChannelService {
	deps: ChannelServiceDeps,
	channels: Mutex<HashMap<ChannelId, Registered>>,
}

impl ChannelService {
	pub fn new(deps: ChannelServiceDeps) -> Self {
		Self {
			deps,
			channels: Mutex::new(HashMap::new()),
		}
	}

	pub fn registry(&self) -> &Arc<MonitorRegistry> {
		&self.deps.registry
	}

	/// Load settings and attach every subscriber for `channel`.
	///
	/// Registering an unchanged channel again is a no-op; a changed one is
	/// torn down and rebuilt.
	pub async fn register(&self, channel: Channel) -> anyhow::Result<MonitorHandle> {
		let mut channels = self.channels.lock().await;

		if let Some(existing) = channels.get(&channel.id) {
			if existing.channel == channel
				&& let Some(monitor) = self.deps.registry.get(&channel.id).await
			{
				debug!(channel = %channel.id, "channels: already registered");
				return Ok(monitor);
			}
			info!(channel = %channel.id, "channels: configuration changed; re-registering");
			if let Some(old) = channels.remove(&channel.id) {
				self.teardown(old).await;
			}
		}

		let id = channel.id.clone();
		self.deps.settings.reload(&id).await?;
		self.deps.moderation.attach(&id, &channel.room_token);

		let d = &self.deps;
		d.registry
			.subscribe(&id, &channel.room_token, SUBSCRIBER_MODERATION, d.moderation.clone())
			.await;
		d.registry
			.subscribe(&id, &channel.room_token, SUBSCRIBER_DISPATCH, d.dispatch.clone())
			.await;
		let monitor = d
			.registry
			.subscribe(&id, &channel.room_token, SUBSCRIBER_POLL, d.polls.clone())
			.await;
		d.polls.attach(&id, monitor.clone(), channel.payout_wallet.clone());

		let status_forwarder = spawn_status_forwarder(monitor.clone(), d.hub.clone());
		let settings_refresher = d.settings.spawn_refresher(id.clone(), d.settings_refresh);

		let watcher = match (channel.payout_wallet.clone(), d.ledger.clone()) {
			(Some(wallet), Some(ledger)) => Some(spawn_donation_watcher(
				id.clone(),
				wallet,
				ledger,
				Arc::clone(&d.dispatch),
				d.watcher.clone(),
			)),
			(Some(_), None) => {
				info!(channel = %id, "channels: payout wallet set but no ledger configured");
				None
			}
			_ => None,
		};

		info!(channel = %id, room = %channel.room_token, donations = watcher.is_some(), "channels: registered");
		channels.insert(
			id,
			Registered {
				channel,
				watcher,
				status_forwarder,
				settings_refresher,
			},
		);
		Ok(monitor)
	}

	/// Detach every subscriber and drop all per-channel state. Unknown ids are ignored.
	pub async fn deregister(&self, id: &ChannelId) {
		let removed = self.channels.lock().await.remove(id);
		match removed {
			Some(reg) => {
				self.teardown(reg).await;
				info!(channel = %id, "channels: deregistered");
			}
			None => debug!(channel = %id, "channels: deregister for unknown channel"),
		}
	}

	/// Persist new settings and re-read them from the store.
	pub async fn update_settings(&self, id: &ChannelId, settings: &ChannelSettings) -> anyhow::Result<Arc<ChannelSettings>> {
		let applied = self.deps.settings.update(id, settings).await?;
		info!(channel = %id, "channels: settings updated");
		Ok(applied)
	}

	pub async fn registered(&self) -> Vec<ChannelId> {
		let mut ids: Vec<ChannelId> = self.channels.lock().await.keys().cloned().collect();
		ids.sort();
		ids
	}

	/// Deregister every channel.
	pub async fn shutdown(&self) {
		let all: Vec<Registered> = self.channels.lock().await.drain().map(|(_, r)| r).collect();
		for reg in all {
			let id = reg.channel.id.clone();
			self.teardown(reg).await;
			debug!(channel = %id, "channels: shut down");
		}
	}

	async fn teardown(&self, reg: Registered) {
		let id = &reg.channel.id;
		if let Some(w) = reg.watcher {
			w.abort();
		}
		reg.status_forwarder.abort();
		reg.settings_refresher.abort();

		let d = &self.deps;
		for name in [SUBSCRIBER_MODERATION, SUBSCRIBER_DISPATCH, SUBSCRIBER_POLL] {
			d.registry.unsubscribe(id, name).await;
		}

		d.polls.forget(id);
		d.dispatch.forget(id);
		d.moderation.forget(id);
		d.settings.forget(id);
	}
}

/// Publish every connection status change of `monitor` as a `monitor` broadcast.
fn spawn_status_forwarder(monitor: MonitorHandle, hub: BroadcastHub) -> JoinHandle<()> {
	let mut rx = monitor.watch_status();
	tokio::spawn(async move {
		loop {
			rx.borrow_and_update();
			let snapshot = monitor.snapshot();
			hub.publish(BroadcastEnvelope::new(
				BroadcastKind::Monitor,
				monitor.channel().clone(),
				&snapshot,
			));
			if rx.changed().await.is_err() {
				return;
			}
		}
	})
}

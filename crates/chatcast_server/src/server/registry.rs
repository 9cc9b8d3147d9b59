#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chatcast_domain::ChannelId;
use chatcast_platform::{SecretString, TransportConfig, TransportFactory};
use tracing::{debug, info, warn};

use crate::config::MonitorSettings;
use crate::server::backoff::BackoffPolicy;
use crate::server::monitor::{MessageHandler, MonitorDeps, MonitorSnapshot, SharedMonitor};

/// Handle returned by [`MonitorRegistry::subscribe`].
pub type MonitorHandle = Arc<SharedMonitor>;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
	/// Startup offset per already-existing monitor.
	pub stagger: Duration,
	pub policy: BackoffPolicy,
	pub display_name: String,
	pub history_limit: u32,
	pub proxy: Option<String>,
	pub auth_cookie: Option<SecretString>,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self::from(&MonitorSettings::default())
	}
}

impl From<&MonitorSettings> for RegistryConfig {
	fn from(s: &MonitorSettings) -> Self {
		Self {
			stagger: s.stagger,
			policy: BackoffPolicy::from(s),
			display_name: s.display_name.clone(),
			history_limit: s.history_limit,
			proxy: s.proxy.clone(),
			auth_cookie: s.auth_cookie.clone(),
		}
	}
}

#[derive(Default)]
struct Slot {
	monitor: Option<Arc<SharedMonitor>>,
}

/// Channel → Shared Monitor map.
///
/// Each channel has its own async slot lock; subscribe/unsubscribe on one
/// channel never waits on another channel's connect or teardown.
pub struct MonitorRegistry {
	cfg: RegistryConfig,
	factory: Arc<dyn TransportFactory>,
	slots: parking_lot::Mutex<HashMap<ChannelId, Arc<tokio::sync::Mutex<Slot>>>>,
	live: AtomicUsize,
}

impl MonitorRegistry {
	pub fn new(cfg: RegistryConfig, factory: Arc<dyn TransportFactory>) -> Self {
		Self {
			cfg,
			factory,
			slots: parking_lot::Mutex::new(HashMap::new()),
			live: AtomicUsize::new(0),
		}
	}

	fn slot(&self, channel: &ChannelId) -> Arc<tokio::sync::Mutex<Slot>> {
		let mut slots = self.slots.lock();
		Arc::clone(slots.entry(channel.clone()).or_default())
	}

	fn deps(&self, room_token: &str) -> MonitorDeps {
		let mut transport_cfg = TransportConfig::new(room_token);
		transport_cfg.display_name = self.cfg.display_name.clone();
		transport_cfg.history_limit = self.cfg.history_limit;
		transport_cfg.proxy = self.cfg.proxy.clone();

		MonitorDeps {
			factory: Arc::clone(&self.factory),
			transport_cfg,
			auth_cookie: self.cfg.auth_cookie.clone(),
			policy: self.cfg.policy,
		}
	}

	/// Attach `name` to the channel's monitor, creating and starting it on first use.
	///
	/// A repeated `(channel, name)` is a logged no-op. Subscribing to a monitor
	/// that gave up reconnecting restarts it.
	pub async fn subscribe(
		&self,
		channel: &ChannelId,
		room_token: &str,
		name: &str,
		handler: Arc<dyn MessageHandler>,
	) -> MonitorHandle {
		let slot = self.slot(channel);
		let mut guard = slot.lock().await;

		if let Some(monitor) = guard.monitor.as_ref() {
			if monitor.add_subscriber(name, handler) {
				info!(%channel, subscriber = name, "registry: subscriber attached to existing monitor");
			} else {
				info!(%channel, subscriber = name, "registry: duplicate subscribe ignored");
			}
			if monitor.status().gave_up && !monitor.is_running() {
				monitor.restart();
			}
			return Arc::clone(monitor);
		}

		let existing = self.live.fetch_add(1, Ordering::SeqCst);
		let delay = self.cfg.stagger.saturating_mul(u32::try_from(existing).unwrap_or(u32::MAX));
		metrics::gauge!("chatcast_monitors_active").set((existing + 1) as f64);

		let monitor = SharedMonitor::new(channel.clone(), self.deps(room_token), delay);
		monitor.add_subscriber(name, handler);
		monitor.start();
		info!(
			%channel,
			room = room_token,
			subscriber = name,
			delay_ms = delay.as_millis(),
			"registry: monitor created"
		);

		guard.monitor = Some(Arc::clone(&monitor));
		monitor
	}

	/// Detach `name`; the last detach shuts the monitor down and waits for it.
	pub async fn unsubscribe(&self, channel: &ChannelId, name: &str) {
		let Some(slot) = self.slots.lock().get(channel).cloned() else {
			debug!(%channel, subscriber = name, "registry: unsubscribe for unknown channel");
			return;
		};

		{
			let mut guard = slot.lock().await;
			let Some(monitor) = guard.monitor.clone() else {
				return;
			};

			if !monitor.has_subscriber(name) {
				debug!(%channel, subscriber = name, "registry: unsubscribe for unknown subscriber");
				return;
			}

			let remaining = monitor.remove_subscriber(name);
			info!(%channel, subscriber = name, remaining, "registry: subscriber detached");

			if remaining == 0 {
				guard.monitor = None;
				monitor.shutdown().await;
				let left = self.live.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
				metrics::gauge!("chatcast_monitors_active").set(left as f64);
				info!(%channel, "registry: monitor torn down");
			}
		}

		self.prune_slot(channel, &slot);
	}

	fn prune_slot(&self, channel: &ChannelId, slot: &Arc<tokio::sync::Mutex<Slot>>) {
		let mut slots = self.slots.lock();
		let Some(current) = slots.get(channel) else {
			return;
		};
		if !Arc::ptr_eq(current, slot) {
			return;
		}
		// map + caller; a third holder is mid-subscribe
		let removable = Arc::strong_count(current) == 2 && current.try_lock().is_ok_and(|g| g.monitor.is_none());
		if removable {
			slots.remove(channel);
		}
	}

	pub async fn get(&self, channel: &ChannelId) -> Option<MonitorHandle> {
		let slot = self.slots.lock().get(channel).cloned()?;
		let guard = slot.lock().await;
		guard.monitor.clone()
	}

	/// Number of monitors currently alive.
	pub fn monitor_count(&self) -> usize {
		self.live.load(Ordering::SeqCst)
	}

	pub async fn snapshots(&self) -> Vec<MonitorSnapshot> {
		let slots: Vec<_> = self.slots.lock().values().cloned().collect();
		let mut out = Vec::with_capacity(slots.len());
		for slot in slots {
			if let Some(m) = slot.lock().await.monitor.as_ref() {
				out.push(m.snapshot());
			}
		}
		out.sort_by(|a, b| a.channel.cmp(&b.channel));
		out
	}

	/// Tear down every monitor regardless of subscribers.
	pub async fn shutdown_all(&self) {
		let slots: Vec<(ChannelId, Arc<tokio::sync::Mutex<Slot>>)> =
			self.slots.lock().iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect();

		for (channel, slot) in slots {
			let monitor = slot.lock().await.monitor.take();
			if let Some(m) = monitor {
				m.shutdown().await;
				self.live.fetch_sub(1, Ordering::SeqCst);
				debug!(%channel, "registry: monitor shut down");
			}
			self.prune_slot(&channel, &slot);
		}

		if self.monitor_count() != 0 {
			warn!(left = self.monitor_count(), "registry: monitors remained after shutdown");
		}
		metrics::gauge!("chatcast_monitors_active").set(self.monitor_count() as f64);
	}
}

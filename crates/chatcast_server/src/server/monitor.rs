#![forbid(unsafe_code)]

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chatcast_domain::ChannelId;
use chatcast_platform::{
	ChatMessage, ChatTransport, SecretString, TransportConfig, TransportError, TransportEvent, TransportEventRx,
	TransportFactory, transport_channel,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::server::backoff::BackoffPolicy;

/// Transport → monitor event queue depth.
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Receives every chat message of a channel, in arrival order.
///
/// Called inline on the monitor's delivery loop: implementations must not
/// block. Side effects that wait on I/O belong in a spawned task.
pub trait MessageHandler: Send + Sync + 'static {
	fn on_message(&self, channel: &ChannelId, msg: &ChatMessage) -> anyhow::Result<()>;
}

impl<F> MessageHandler for F
where
	F: Fn(&ChannelId, &ChatMessage) -> anyhow::Result<()> + Send + Sync + 'static,
{
	fn on_message(&self, channel: &ChannelId, msg: &ChatMessage) -> anyhow::Result<()> {
		self(channel, msg)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
}

/// Observable connection status of one monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorStatus {
	pub state: ConnectionState,

	/// Consecutive failed reconnect attempts since the last successful connect.
	pub attempt: u32,

	#[serde(skip)]
	pub next_reconnect_at: Option<SystemTime>,

	/// Set once the attempt budget is exhausted; cleared by a restart.
	pub gave_up: bool,
}

impl Default for MonitorStatus {
	fn default() -> Self {
		Self {
			state: ConnectionState::Disconnected,
			attempt: 0,
			next_reconnect_at: None,
			gave_up: false,
		}
	}
}

/// Point-in-time view for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
	pub channel: ChannelId,
	pub room: String,
	pub subscribers: Vec<String>,
	#[serde(flatten)]
	pub status: MonitorStatus,
}

/// Everything a monitor needs to build its transport.
#[derive(Clone)]
pub struct MonitorDeps {
	pub factory: Arc<dyn TransportFactory>,
	pub transport_cfg: TransportConfig,
	pub auth_cookie: Option<SecretString>,
	pub policy: BackoffPolicy,
}

struct Subscriber {
	name: String,
	handler: Arc<dyn MessageHandler>,
}

/// Owner of a channel's single upstream connection; fans messages out to subscribers.
pub struct SharedMonitor {
	channel: ChannelId,
	deps: MonitorDeps,
	initial_delay: Duration,

	subscribers: RwLock<Vec<Subscriber>>,
	transport: Mutex<Option<Arc<dyn ChatTransport>>>,
	status_tx: watch::Sender<MonitorStatus>,
	shutdown_tx: watch::Sender<bool>,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl SharedMonitor {
	pub fn new(channel: ChannelId, deps: MonitorDeps, initial_delay: Duration) -> Arc<Self> {
		let (status_tx, _) = watch::channel(MonitorStatus::default());
		let (shutdown_tx, _) = watch::channel(false);
		Arc::new(Self {
			channel,
			deps,
			initial_delay,
			subscribers: RwLock::new(Vec::new()),
			transport: Mutex::new(None),
			status_tx,
			shutdown_tx,
			task: Mutex::new(None),
		})
	}

	pub fn channel(&self) -> &ChannelId {
		&self.channel
	}

	pub fn status(&self) -> MonitorStatus {
		self.status_tx.borrow().clone()
	}

	pub fn watch_status(&self) -> watch::Receiver<MonitorStatus> {
		self.status_tx.subscribe()
	}

	pub fn subscriber_names(&self) -> Vec<String> {
		self.subscribers.read().iter().map(|s| s.name.clone()).collect()
	}

	pub fn subscriber_count(&self) -> usize {
		self.subscribers.read().len()
	}

	pub fn has_subscriber(&self, name: &str) -> bool {
		self.subscribers.read().iter().any(|s| s.name == name)
	}

	pub fn snapshot(&self) -> MonitorSnapshot {
		MonitorSnapshot {
			channel: self.channel.clone(),
			room: self.deps.transport_cfg.room.clone(),
			subscribers: self.subscriber_names(),
			status: self.status(),
		}
	}

	/// Register a handler; returns `false` (and changes nothing) for a known name.
	pub(crate) fn add_subscriber(&self, name: &str, handler: Arc<dyn MessageHandler>) -> bool {
		let mut subs = self.subscribers.write();
		if subs.iter().any(|s| s.name == name) {
			return false;
		}
		subs.push(Subscriber {
			name: name.to_string(),
			handler,
		});
		true
	}

	/// Remove a handler; returns the remaining subscriber count.
	pub(crate) fn remove_subscriber(&self, name: &str) -> usize {
		let mut subs = self.subscribers.write();
		subs.retain(|s| s.name != name);
		subs.len()
	}

	/// Whether the connection task is still running.
	pub fn is_running(&self) -> bool {
		self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
	}

	/// Spawn the connection task. No-op while a task is already running.
	pub(crate) fn start(self: &Arc<Self>) {
		self.spawn_run(self.initial_delay);
	}

	/// Resume after the attempt budget was exhausted, connecting immediately.
	pub(crate) fn restart(self: &Arc<Self>) {
		if self.is_running() {
			return;
		}
		info!(channel = %self.channel, "monitor: restarting after give-up");
		self.status_tx.send_replace(MonitorStatus::default());
		self.spawn_run(Duration::ZERO);
	}

	fn spawn_run(self: &Arc<Self>, delay: Duration) {
		let mut guard = self.task.lock();
		if guard.as_ref().is_some_and(|t| !t.is_finished()) {
			return;
		}
		self.shutdown_tx.send_replace(false);
		let this = Arc::clone(self);
		*guard = Some(tokio::spawn(async move { this.run(delay).await }));
	}

	/// Stop the connection task and disconnect the transport; resolves once both are done.
	pub async fn shutdown(&self) {
		self.shutdown_tx.send_replace(true);
		let task = self.task.lock().take();
		if let Some(task) = task
			&& let Err(e) = task.await
		{
			warn!(channel = %self.channel, error = %e, "monitor task ended abnormally");
		}

		let leftover = self.transport.lock().take();
		if let Some(t) = leftover {
			t.disconnect().await;
		}
		self.set_state(ConnectionState::Disconnected);
	}

	/// Send a chat line through the live transport.
	pub async fn send_message(&self, text: &str) -> Result<(), TransportError> {
		let transport = self.transport.lock().clone();
		match transport {
			Some(t) if t.is_active() => t.send_message(text).await,
			_ => Err(TransportError::NotConnected),
		}
	}

	/// Deliver `msg` to every subscriber in registration order.
	///
	/// A handler error or panic is logged and counted; the remaining handlers
	/// still run.
	pub fn fan_out(&self, msg: &ChatMessage) {
		let snapshot: Vec<(String, Arc<dyn MessageHandler>)> = self
			.subscribers
			.read()
			.iter()
			.map(|s| (s.name.clone(), Arc::clone(&s.handler)))
			.collect();

		for (name, handler) in snapshot {
			match catch_unwind(AssertUnwindSafe(|| handler.on_message(&self.channel, msg))) {
				Ok(Ok(())) => {}
				Ok(Err(e)) => {
					metrics::counter!("chatcast_monitor_handler_faults_total").increment(1);
					warn!(channel = %self.channel, subscriber = %name, error = %e, "subscriber handler failed");
				}
				Err(_) => {
					metrics::counter!("chatcast_monitor_handler_faults_total").increment(1);
					error!(channel = %self.channel, subscriber = %name, "subscriber handler panicked");
				}
			}
		}
	}

	fn set_state(&self, state: ConnectionState) {
		self.status_tx.send_if_modified(|s| {
			if s.state == state {
				return false;
			}
			s.state = state;
			true
		});
	}

	/// Release the current transport (if any) and build a fresh one.
	async fn replace_transport(&self) -> (Arc<dyn ChatTransport>, TransportEventRx) {
		let previous = self.transport.lock().take();
		if let Some(prev) = previous {
			prev.disconnect().await;
		}

		let (events_tx, events_rx) = transport_channel(EVENT_QUEUE_CAPACITY);
		let transport = self.deps.factory.create(self.deps.transport_cfg.clone(), events_tx);
		if let Some(cookie) = self.deps.auth_cookie.clone() {
			transport.set_auth_cookie(cookie);
		}
		*self.transport.lock() = Some(Arc::clone(&transport));
		(transport, events_rx)
	}

	async fn run(self: Arc<Self>, initial_delay: Duration) {
		let mut shutdown_rx = self.shutdown_tx.subscribe();

		if !initial_delay.is_zero() {
			debug!(channel = %self.channel, delay_ms = initial_delay.as_millis(), "monitor: staggered start");
			tokio::select! {
				_ = tokio::time::sleep(initial_delay) => {}
				_ = cancelled(&mut shutdown_rx) => return,
			}
		}

		'connect: loop {
			// a transport that reported a terminal event is never reused
			let (transport, mut events_rx) = self.replace_transport().await;

			self.set_state(ConnectionState::Connecting);

			let connected = tokio::select! {
				r = transport.connect() => r,
				_ = cancelled(&mut shutdown_rx) => break 'connect,
			};

			match connected {
				Ok(()) => {
					metrics::counter!("chatcast_monitor_connects_total").increment(1);
					self.status_tx.send_modify(|s| {
						s.state = ConnectionState::Connected;
						s.attempt = 0;
						s.next_reconnect_at = None;
					});
					info!(channel = %self.channel, room = %self.deps.transport_cfg.room, "monitor: connected");

					let reason = loop {
						tokio::select! {
							ev = events_rx.recv() => match ev {
								Some(ev) if ev.is_terminal() => break terminal_reason(ev),
								Some(TransportEvent::Message(msg)) => self.fan_out(&msg),
								Some(_) => {
									debug!(channel = %self.channel, "monitor: transport reported connected");
								}
								None => break "transport event channel closed".to_string(),
							},
							_ = cancelled(&mut shutdown_rx) => break 'connect,
						}
					};

					metrics::counter!("chatcast_monitor_disconnects_total").increment(1);
					warn!(channel = %self.channel, %reason, "monitor: disconnected");
					self.set_state(ConnectionState::Disconnected);
				}
				Err(e) => {
					warn!(channel = %self.channel, error = %e, "monitor: connect failed");
					self.set_state(ConnectionState::Disconnected);
				}
			}

			let attempt = self.status_tx.borrow().attempt + 1;
			let Some(delay) = self.deps.policy.delay_for(attempt) else {
				metrics::counter!("chatcast_monitor_give_ups_total").increment(1);
				error!(
					channel = %self.channel,
					max_attempts = self.deps.policy.max_attempts,
					"monitor: max reconnect attempts reached; giving up until resubscribed"
				);
				self.status_tx.send_modify(|s| {
					s.state = ConnectionState::Disconnected;
					s.next_reconnect_at = None;
					s.gave_up = true;
				});
				break;
			};

			metrics::counter!("chatcast_monitor_reconnect_attempts_total").increment(1);
			self.status_tx.send_modify(|s| {
				s.attempt = attempt;
				s.next_reconnect_at = Some(SystemTime::now() + delay);
			});
			info!(
				channel = %self.channel,
				attempt,
				delay_ms = delay.as_millis(),
				"monitor: scheduling reconnect"
			);

			tokio::select! {
				_ = tokio::time::sleep(delay) => {}
				_ = cancelled(&mut shutdown_rx) => break,
			}
		}

		let current = self.transport.lock().take();
		if let Some(transport) = current {
			transport.disconnect().await;
		}
		self.set_state(ConnectionState::Disconnected);
		debug!(channel = %self.channel, "monitor: task finished");
	}
}

fn terminal_reason(ev: TransportEvent) -> String {
	match ev {
		TransportEvent::Disconnected { reason } => reason,
		TransportEvent::Error(e) => format!("transport error: {e}"),
		other => format!("unexpected event: {other:?}"),
	}
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
	let _ = rx.wait_for(|stop| *stop).await;
}

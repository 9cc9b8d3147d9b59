#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatcast_domain::AuthorId;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Interval;
use tracing::{debug, info, warn};

use crate::SecretString;
use crate::transport::{
	ChatMessage, ChatTransport, TransportConfig, TransportError, TransportEvent, TransportEventTx, TransportFactory,
};

const DEMO_AUTHORS: [&str; 3] = ["7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU", "demo_viewer", "Addr1"];

/// Synthetic transport that emits a chat line per tick; used for local runs.
pub struct DemoTransport {
	cfg: TransportConfig,
	events_tx: TransportEventTx,
	emit_interval: Duration,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl DemoTransport {
	pub fn new(cfg: TransportConfig, events_tx: TransportEventTx) -> Self {
		Self {
			cfg,
			events_tx,
			emit_interval: Duration::from_millis(1500),
			task: Mutex::new(None),
		}
	}

	/// Customize emit interval (useful for tests).
	pub fn with_emit_interval(mut self, interval: Duration) -> Self {
		self.emit_interval = interval;
		self
	}

	fn make_message(room: &str, n: u64) -> Option<ChatMessage> {
		let idx = usize::try_from(n).unwrap_or_default() % DEMO_AUTHORS.len();
		let author = AuthorId::new(DEMO_AUTHORS[idx]).ok()?;
		Some(ChatMessage::new(author, format!("demo chat line #{n} in {room}")))
	}
}

#[async_trait]
impl ChatTransport for DemoTransport {
	async fn connect(&self) -> Result<(), TransportError> {
		let mut guard = self.task.lock();
		if guard.as_ref().is_some_and(|t| !t.is_finished()) {
			return Ok(());
		}

		let events_tx = self.events_tx.clone();
		let room = self.cfg.room.clone();
		let emit_interval = self.emit_interval;

		let task = tokio::spawn(async move {
			if events_tx.send(TransportEvent::Connected).await.is_err() {
				return;
			}
			info!(%room, "demo transport online");
			debug!(%room, interval_ms = emit_interval.as_millis(), "demo transport tick interval configured");

			let mut interval: Interval = tokio::time::interval(emit_interval);
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			let mut tick: u64 = 0;

			loop {
				interval.tick().await;
				tick += 1;
				let Some(msg) = Self::make_message(&room, tick) else {
					continue;
				};
				if events_tx.send(TransportEvent::Message(msg)).await.is_err() {
					break;
				}
			}
		});

		*guard = Some(task);
		Ok(())
	}

	async fn disconnect(&self) {
		let task = self.task.lock().take();
		if let Some(task) = task {
			task.abort();
			let _ = task.await;
			info!(room = %self.cfg.room, "demo transport offline");
		}
	}

	async fn send_message(&self, text: &str) -> Result<(), TransportError> {
		if !self.is_active() {
			return Err(TransportError::NotConnected);
		}
		info!(room = %self.cfg.room, %text, "demo transport chat reply");
		Ok(())
	}

	fn is_active(&self) -> bool {
		self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
	}

	fn set_auth_cookie(&self, _token: SecretString) {
		warn!(room = %self.cfg.room, "ignored auth cookie (demo transport)");
	}
}

#[derive(Debug, Clone, Default)]
pub struct DemoTransportFactory {
	emit_interval: Option<Duration>,
}

impl DemoTransportFactory {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_emit_interval(mut self, interval: Duration) -> Self {
		self.emit_interval = Some(interval);
		self
	}
}

impl TransportFactory for DemoTransportFactory {
	fn create(&self, cfg: TransportConfig, events_tx: TransportEventTx) -> Arc<dyn ChatTransport> {
		let mut t = DemoTransport::new(cfg, events_tx);
		if let Some(i) = self.emit_interval {
			t = t.with_emit_interval(i);
		}
		Arc::new(t)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn demo_transport_emits_connected_then_messages() {
		let (tx, mut rx) = crate::transport_channel(16);
		let t = DemoTransport::new(TransportConfig::new("room"), tx).with_emit_interval(Duration::from_millis(10));

		t.connect().await.unwrap();
		assert!(t.is_active());

		assert!(matches!(rx.recv().await, Some(TransportEvent::Connected)));
		match rx.recv().await {
			Some(TransportEvent::Message(m)) => assert!(m.text.contains("room")),
			other => panic!("expected message, got {other:?}"),
		}

		t.disconnect().await;
		assert!(!t.is_active());
		assert!(matches!(t.send_message("hi").await, Err(TransportError::NotConnected)));
	}
}

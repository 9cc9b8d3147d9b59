#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chatcast_domain::{AuthorId, ChannelId};
use chatcast_platform::{
	BanClient, BanError, ChatMessage, ChatTransport, LedgerClient, LedgerError, LedgerTransaction, SecretString,
	TransportConfig, TransportError, TransportEvent, TransportEventTx, TransportFactory,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{Instant, timeout};

use crate::server::monitor::{ConnectionState, MonitorStatus, SharedMonitor};

static LOG_INIT: OnceLock<()> = OnceLock::new();

pub fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("CHATCAST_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

pub fn channel(id: &str) -> ChannelId {
	ChannelId::new(id).expect("valid channel id")
}

pub fn author(id: &str) -> AuthorId {
	AuthorId::new(id).expect("valid author id")
}

pub fn chat(author_id: &str, text: &str) -> ChatMessage {
	ChatMessage::new(author(author_id), text)
}

/// Shared bookkeeping for every transport a [`FakeFactory`] built.
#[derive(Default)]
pub struct FakeUpstream {
	live: AtomicUsize,
	max_live: AtomicUsize,
	connects: Mutex<Vec<(String, Instant)>>,
	transports: Mutex<Vec<Arc<FakeTransport>>>,
	fail_connects: AtomicBool,
}

impl FakeUpstream {
	pub fn live(&self) -> usize {
		self.live.load(Ordering::SeqCst)
	}

	pub fn max_live(&self) -> usize {
		self.max_live.load(Ordering::SeqCst)
	}

	pub fn created(&self) -> usize {
		self.transports.lock().len()
	}

	pub fn set_fail_connects(&self, fail: bool) {
		self.fail_connects.store(fail, Ordering::SeqCst);
	}

	/// Connect attempts (successful or not) for `room`.
	pub fn connects_for(&self, room: &str) -> Vec<Instant> {
		self.connects.lock().iter().filter(|(r, _)| r == room).map(|(_, t)| *t).collect()
	}

	fn latest(&self, room: &str) -> Option<Arc<FakeTransport>> {
		self.transports.lock().iter().rev().find(|t| t.room == room).cloned()
	}

	pub fn sent(&self, room: &str) -> Vec<String> {
		self.transports
			.lock()
			.iter()
			.filter(|t| t.room == room)
			.flat_map(|t| t.sent.lock().clone())
			.collect()
	}

	/// Push a chat message through the room's newest transport.
	pub async fn emit(&self, room: &str, msg: ChatMessage) {
		let t = self.latest(room).expect("transport for room");
		t.events_tx
			.send(TransportEvent::Message(msg))
			.await
			.expect("monitor listening");
	}

	/// Simulate the remote side closing the room's connection.
	pub async fn drop_connection(&self, room: &str) {
		let t = self.latest(room).expect("transport for room");
		if t.active.swap(false, Ordering::SeqCst) {
			self.live.fetch_sub(1, Ordering::SeqCst);
		}
		let _ = t
			.events_tx
			.send(TransportEvent::Disconnected {
				reason: "remote closed".to_string(),
			})
			.await;
	}

	/// Report a close while the transport still claims to be active.
	pub async fn close_leaving_active(&self, room: &str) {
		let t = self.latest(room).expect("transport for room");
		let _ = t
			.events_tx
			.send(TransportEvent::Disconnected {
				reason: "closed after handshake".to_string(),
			})
			.await;
	}
}

pub struct FakeTransport {
	room: String,
	events_tx: TransportEventTx,
	active: AtomicBool,
	upstream: Arc<FakeUpstream>,
	sent: Mutex<Vec<String>>,
}

#[async_trait]
impl ChatTransport for FakeTransport {
	async fn connect(&self) -> Result<(), TransportError> {
		self.upstream.connects.lock().push((self.room.clone(), Instant::now()));
		if self.upstream.fail_connects.load(Ordering::SeqCst) {
			return Err(TransportError::Connect("refused".to_string()));
		}
		if !self.active.swap(true, Ordering::SeqCst) {
			let live = self.upstream.live.fetch_add(1, Ordering::SeqCst) + 1;
			self.upstream.max_live.fetch_max(live, Ordering::SeqCst);
		}
		let _ = self.events_tx.try_send(TransportEvent::Connected);
		Ok(())
	}

	async fn disconnect(&self) {
		if self.active.swap(false, Ordering::SeqCst) {
			self.upstream.live.fetch_sub(1, Ordering::SeqCst);
		}
	}

	async fn send_message(&self, text: &str) -> Result<(), TransportError> {
		if !self.is_active() {
			return Err(TransportError::NotConnected);
		}
		self.sent.lock().push(text.to_string());
		Ok(())
	}

	fn is_active(&self) -> bool {
		self.active.load(Ordering::SeqCst)
	}

	fn set_auth_cookie(&self, _token: SecretString) {}
}

#[derive(Clone, Default)]
pub struct FakeFactory {
	pub upstream: Arc<FakeUpstream>,
}

impl TransportFactory for FakeFactory {
	fn create(&self, cfg: TransportConfig, events_tx: TransportEventTx) -> Arc<dyn ChatTransport> {
		let t = Arc::new(FakeTransport {
			room: cfg.room,
			events_tx,
			active: AtomicBool::new(false),
			upstream: Arc::clone(&self.upstream),
			sent: Mutex::new(Vec::new()),
		});
		self.upstream.transports.lock().push(Arc::clone(&t));
		t
	}
}

/// Ban client that records calls and answers from a script (default: success).
#[derive(Default)]
pub struct RecordingBanClient {
	pub calls: Mutex<Vec<(String, String)>>,
	pub responses: Mutex<VecDeque<Result<(), BanError>>>,
}

impl RecordingBanClient {
	pub fn call_count(&self) -> usize {
		self.calls.lock().len()
	}
}

#[async_trait]
impl BanClient for RecordingBanClient {
	async fn ban(&self, room: &str, author: &AuthorId, _reason: &str) -> Result<(), BanError> {
		self.calls.lock().push((room.to_string(), author.as_str().to_string()));
		self.responses.lock().pop_front().unwrap_or(Ok(()))
	}
}

/// Ledger whose latest signature and transactions are set by the test.
#[derive(Default)]
pub struct ScriptedLedger {
	pub latest: Mutex<Option<String>>,
	pub transactions: Mutex<Vec<LedgerTransaction>>,
	pub lookups: AtomicUsize,
}

#[async_trait]
impl LedgerClient for ScriptedLedger {
	async fn latest_signature(&self, _wallet: &str) -> Result<Option<String>, LedgerError> {
		Ok(self.latest.lock().clone())
	}

	async fn transaction(&self, signature: &str) -> Result<Option<LedgerTransaction>, LedgerError> {
		self.lookups.fetch_add(1, Ordering::SeqCst);
		Ok(self
			.transactions
			.lock()
			.iter()
			.find(|t| t.signature == signature)
			.cloned())
	}
}

pub async fn wait_status(rx: &mut watch::Receiver<MonitorStatus>, pred: impl FnMut(&MonitorStatus) -> bool) {
	timeout(Duration::from_secs(3600), rx.wait_for(pred))
		.await
		.expect("status reached within timeout")
		.expect("status sender alive");
}

pub async fn wait_connected(monitor: &SharedMonitor) {
	let mut rx = monitor.watch_status();
	wait_status(&mut rx, |s| s.state == ConnectionState::Connected).await;
}

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chatcast_domain::AuthorId;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, warn};
use url::Url;

use crate::transport::{
	ChatMessage, ChatTransport, TransportConfig, TransportError, TransportEvent, TransportEventTx, TransportFactory,
};
use crate::SecretString;

/// Outgoing frame queue depth per connection.
const OUTGOING_QUEUE_CAPACITY: usize = 64;

/// WebSocket chat transport speaking JSON text frames.
pub struct WsChatTransport {
	base_url: Url,
	cfg: TransportConfig,
	events_tx: TransportEventTx,
	state: Arc<Mutex<WsState>>,
}

#[derive(Default)]
struct WsState {
	active: bool,
	auth_cookie: Option<SecretString>,
	outgoing: Option<mpsc::Sender<String>>,
	task: Option<JoinHandle<()>>,

	/// Bumped per connection; only the reader of the current generation may clear `active`.
	generation: u64,
}

impl WsState {
	/// Mark a fresh connection live and return its generation.
	fn begin(&mut self, outgoing: mpsc::Sender<String>) -> u64 {
		self.generation += 1;
		self.active = true;
		self.outgoing = Some(outgoing);
		if let Some(old) = self.task.take() {
			old.abort();
		}
		self.generation
	}

	/// Mark the connection of `generation` closed; stale readers are ignored.
	fn finish(&mut self, generation: u64) -> bool {
		if self.generation != generation {
			return false;
		}
		self.active = false;
		self.outgoing = None;
		true
	}

	fn close(&mut self) -> Option<JoinHandle<()>> {
		self.generation += 1;
		self.active = false;
		self.outgoing = None;
		self.task.take()
	}
}

/// Inbound frame as sent by the chat service.
#[derive(Debug, Deserialize)]
struct WsFrame {
	#[serde(rename = "type")]
	kind: String,
	#[serde(default)]
	author: Option<String>,
	#[serde(default)]
	text: Option<String>,
	#[serde(default)]
	timestamp: Option<serde_json::Value>,
}

impl WsChatTransport {
	pub fn new(base_url: Url, cfg: TransportConfig, events_tx: TransportEventTx) -> Self {
		Self {
			base_url,
			cfg,
			events_tx,
			state: Arc::new(Mutex::new(WsState::default())),
		}
	}

	fn connect_url(&self) -> Url {
		let mut url = self.base_url.clone();
		url.query_pairs_mut()
			.append_pair("room", &self.cfg.room)
			.append_pair("name", &self.cfg.display_name)
			.append_pair("history", &self.cfg.history_limit.to_string());
		url
	}
}

/// Parse one text frame into a chat message; non-message frames yield `None`.
pub(crate) fn parse_frame(text: &str) -> Option<ChatMessage> {
	let frame: WsFrame = serde_json::from_str(text).ok()?;
	if frame.kind != "message" {
		return None;
	}

	let author = AuthorId::new(frame.author?).ok()?;
	let text = frame.text?;
	if text.trim().is_empty() {
		return None;
	}

	let timestamp = frame.timestamp.as_ref().and_then(parse_timestamp).unwrap_or_else(SystemTime::now);

	Some(ChatMessage { author, text, timestamp })
}

fn parse_timestamp(v: &serde_json::Value) -> Option<SystemTime> {
	match v {
		serde_json::Value::Number(n) => {
			let ms = n.as_u64()?;
			Some(SystemTime::UNIX_EPOCH + Duration::from_millis(ms))
		}
		serde_json::Value::String(s) => {
			let parsed = chrono::DateTime::parse_from_rfc3339(s).ok()?;
			let ms = u64::try_from(parsed.timestamp_millis()).ok()?;
			Some(SystemTime::UNIX_EPOCH + Duration::from_millis(ms))
		}
		_ => None,
	}
}

#[async_trait]
impl ChatTransport for WsChatTransport {
	async fn connect(&self) -> Result<(), TransportError> {
		if self.is_active() {
			return Ok(());
		}

		if let Some(proxy) = self.cfg.proxy.as_deref() {
			warn!(room = %self.cfg.room, %proxy, "ws transport does not tunnel through proxies; connecting directly");
		}

		let url = self.connect_url();
		let mut request = url
			.as_str()
			.into_client_request()
			.map_err(|e| TransportError::Connect(e.to_string()))?;

		let cookie = self.state.lock().auth_cookie.clone();
		if let Some(cookie) = cookie
			&& !cookie.is_empty()
		{
			let value = HeaderValue::from_str(&format!("auth_token={}", cookie.expose()))
				.map_err(|e| TransportError::Connect(format!("invalid auth cookie: {e}")))?;
			request.headers_mut().insert("Cookie", value);
		}

		let (ws, _resp) = match tokio_tungstenite::connect_async(request).await {
			Ok(v) => v,
			Err(tokio_tungstenite::tungstenite::Error::Http(resp)) if resp.status().as_u16() == 429 => {
				metrics::counter!("chatcast_transport_rate_limited_total").increment(1);
				return Err(TransportError::RateLimited);
			}
			Err(e) => return Err(TransportError::Connect(e.to_string())),
		};

		let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTGOING_QUEUE_CAPACITY);
		let events_tx = self.events_tx.clone();
		let state = Arc::clone(&self.state);
		let room = self.cfg.room.clone();

		// live before the reader runs, so a close right after the handshake is never overwritten
		let generation = self.state.lock().begin(out_tx);

		let task = tokio::spawn(async move {
			let (mut sink, mut stream) = ws.split();
			let _ = events_tx.send(TransportEvent::Connected).await;

			let terminal = loop {
				tokio::select! {
					out = out_rx.recv() => {
						let Some(out) = out else {
							let _ = sink.close().await;
							break None;
						};
						if let Err(e) = sink.send(Message::Text(out.into())).await {
							break Some(TransportEvent::Error(format!("write: {e}")));
						}
					}
					msg = stream.next() => {
						let Some(msg) = msg else {
							break Some(TransportEvent::Disconnected { reason: "stream ended".to_string() });
						};
						match msg {
							Ok(Message::Text(text)) => {
								if let Some(chat) = parse_frame(&text) {
									if events_tx.send(TransportEvent::Message(chat)).await.is_err() {
										break None;
									}
								} else {
									debug!(%room, "ignoring non-message frame");
								}
							}
							Ok(Message::Ping(p)) => {
								let _ = sink.send(Message::Pong(p)).await;
							}
							Ok(Message::Close(frame)) => {
								break Some(TransportEvent::Disconnected { reason: format!("close frame: {frame:?}") });
							}
							Ok(_) => {}
							Err(e) => {
								break Some(TransportEvent::Error(format!("read: {e}")));
							}
						}
					}
				}
			};

			let current = state.lock().finish(generation);
			if current && let Some(ev) = terminal {
				let _ = events_tx.send(ev).await;
			}
		});

		let mut guard = self.state.lock();
		if guard.generation == generation {
			guard.task = Some(task);
		} else {
			task.abort();
		}
		Ok(())
	}

	async fn disconnect(&self) {
		let task = self.state.lock().close();
		if let Some(task) = task {
			task.abort();
			let _ = task.await;
		}
	}

	async fn send_message(&self, text: &str) -> Result<(), TransportError> {
		let outgoing = {
			let guard = self.state.lock();
			if !guard.active {
				return Err(TransportError::NotConnected);
			}
			guard.outgoing.clone()
		};
		let Some(outgoing) = outgoing else {
			return Err(TransportError::NotConnected);
		};

		let frame = serde_json::json!({ "type": "send", "text": text }).to_string();
		outgoing.send(frame).await.map_err(|e| TransportError::Send(e.to_string()))
	}

	fn is_active(&self) -> bool {
		self.state.lock().active
	}

	fn set_auth_cookie(&self, token: SecretString) {
		self.state.lock().auth_cookie = Some(token);
	}
}

/// Builds [`WsChatTransport`] instances against one service URL.
#[derive(Debug, Clone)]
pub struct WsTransportFactory {
	base_url: Url,
}

impl WsTransportFactory {
	pub fn new(base_url: Url) -> Self {
		Self { base_url }
	}
}

impl TransportFactory for WsTransportFactory {
	fn create(&self, cfg: TransportConfig, events_tx: TransportEventTx) -> Arc<dyn ChatTransport> {
		Arc::new(WsChatTransport::new(self.base_url.clone(), cfg, events_tx))
	}
}

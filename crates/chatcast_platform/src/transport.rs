#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::SystemTime;

use chatcast_domain::AuthorId;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::SecretString;

/// Construction parameters for one upstream chat connection.
#[derive(Debug, Clone)]
pub struct TransportConfig {
	/// External room identifier (the channel's room token).
	pub room: String,

	pub display_name: String,

	/// Number of backlog messages requested on join.
	pub history_limit: u32,

	pub proxy: Option<String>,
}

impl TransportConfig {
	pub fn new(room: impl Into<String>) -> Self {
		Self {
			room: room.into(),
			display_name: "chatcast".to_string(),
			history_limit: 0,
			proxy: None,
		}
	}
}

/// Chat message as received from the upstream room.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
	pub author: AuthorId,
	pub text: String,
	pub timestamp: SystemTime,
}

impl ChatMessage {
	pub fn new(author: AuthorId, text: impl Into<String>) -> Self {
		Self {
			author,
			text: text.into(),
			timestamp: SystemTime::now(),
		}
	}
}

/// Transport → monitor event.
#[derive(Debug, Clone)]
pub enum TransportEvent {
	Connected,

	/// Connection closed by the remote side or the network.
	Disconnected {
		reason: String,
	},

	/// Read/protocol fault; the connection is no longer usable.
	Error(String),

	Message(ChatMessage),
}

impl TransportEvent {
	/// Whether this event ends the current connection.
	pub fn is_terminal(&self) -> bool {
		matches!(self, Self::Disconnected { .. } | Self::Error(_))
	}
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
	#[error("connect failed: {0}")]
	Connect(String),
	#[error("upstream rate limited the connection (429)")]
	RateLimited,
	#[error("transport is not connected")]
	NotConnected,
	#[error("send failed: {0}")]
	Send(String),
}

pub type TransportEventTx = mpsc::Sender<TransportEvent>;
pub type TransportEventRx = mpsc::Receiver<TransportEvent>;

/// Build the bounded event channel handed to a transport at construction.
pub fn transport_channel(capacity: usize) -> (TransportEventTx, TransportEventRx) {
	mpsc::channel(capacity)
}

/// One realtime connection to a single chat room.
#[async_trait::async_trait]
pub trait ChatTransport: Send + Sync + 'static {
	/// Open the connection; resolves once the room is joined.
	async fn connect(&self) -> Result<(), TransportError>;

	/// Close the connection. Does not emit `Disconnected`.
	async fn disconnect(&self);

	async fn send_message(&self, text: &str) -> Result<(), TransportError>;

	fn is_active(&self) -> bool;

	fn set_auth_cookie(&self, token: SecretString);
}

/// Creates transports; the monitor owns the returned instance.
pub trait TransportFactory: Send + Sync + 'static {
	fn create(&self, cfg: TransportConfig, events_tx: TransportEventTx) -> Arc<dyn ChatTransport>;
}

#![forbid(unsafe_code)]

//! Contracts for the collaborators chatcast talks to: the upstream chat
//! transport, the moderation (ban) endpoint and the donation ledger.

pub mod ban;
pub mod demo;
pub mod ledger;
pub mod transport;
pub mod ws;

use std::fmt;

pub use ban::{BAN_REASON_CODE, BanClient, BanError, HttpBanClient};
pub use demo::{DemoTransport, DemoTransportFactory};
pub use ledger::{Donation, JsonRpcLedgerClient, LedgerClient, LedgerError, LedgerTransaction, detect_donation};
pub use transport::{
	ChatMessage, ChatTransport, TransportConfig, TransportError, TransportEvent, TransportEventRx, TransportEventTx,
	TransportFactory, transport_channel,
};
pub use ws::{WsChatTransport, WsTransportFactory};

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

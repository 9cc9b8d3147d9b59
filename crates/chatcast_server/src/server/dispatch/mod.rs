#![forbid(unsafe_code)]

//! Cooldown-gated TTS dispatch: donor correlation, filtering, FIFO drain.

pub mod correlation;
pub mod queue;
pub mod render;

use chatcast_domain::{AuthorId, ChannelId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use correlation::CorrelationWindows;
pub use queue::{DispatchConfig, DispatchQueue, RejectReason};
pub use render::render_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
	Regular,
	Donation,
}

impl TriggerKind {
	pub fn as_str(self) -> &'static str {
		match self {
			TriggerKind::Regular => "regular",
			TriggerKind::Donation => "donation",
		}
	}
}

/// A drained, rendered record as persisted and broadcast.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TtsRecord {
	pub id: Uuid,
	pub channel: ChannelId,
	pub author: AuthorId,

	/// Rendered text, including the donation prefix when present.
	pub text: String,

	pub kind: TriggerKind,
	pub amount: Option<f64>,
	pub created_at_ms: i64,
}

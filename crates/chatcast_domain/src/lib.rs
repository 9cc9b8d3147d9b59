#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
}

/// Streamer channel identifier (one chat room / configuration unit).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct ChannelId(String);

impl ChannelId {
	/// Create a non-empty `ChannelId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(trimmed.to_string()))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelId::new(s.to_string())
	}
}

/// Chat author identity as reported by the transport (often a wallet address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct AuthorId(String);

impl AuthorId {
	/// Create a non-empty `AuthorId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(trimmed.to_string()))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Display form used in rendered records.
	///
	/// Identities written in the address alphabet are cut to their first
	/// [`SHORT_ID_LEN`] characters; anything else is shown unmodified.
	pub fn short(&self) -> &str {
		short_display_id(&self.0)
	}
}

impl fmt::Display for AuthorId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for AuthorId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		AuthorId::new(s.to_string())
	}
}

/// Registered streamer channel.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Channel {
	pub id: ChannelId,

	/// External chat room token the transport joins.
	pub room_token: String,

	/// Payout account watched for donations.
	#[cfg_attr(feature = "serde", serde(default))]
	pub payout_wallet: Option<String>,
}

impl Channel {
	pub fn new(id: ChannelId, room_token: impl Into<String>) -> Self {
		Self {
			id,
			room_token: room_token.into(),
			payout_wallet: None,
		}
	}

	pub fn with_payout_wallet(mut self, wallet: impl Into<String>) -> Self {
		let wallet = wallet.into();
		self.payout_wallet = if wallet.trim().is_empty() { None } else { Some(wallet) };
		self
	}
}

/// Characters of the base58 address alphabet (no `0`, `O`, `I`, `l`).
pub const ADDRESS_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Number of leading characters kept when shortening an address-like id.
pub const SHORT_ID_LEN: usize = 4;

/// Whether `s` is written entirely in the address alphabet and is longer than its short form.
pub fn is_address_like(s: &str) -> bool {
	s.len() > SHORT_ID_LEN && s.chars().all(|c| ADDRESS_ALPHABET.contains(c))
}

/// Shorten an identity for display.
pub fn short_display_id(s: &str) -> &str {
	if is_address_like(s) {
		// address alphabet is pure ASCII, so byte slicing is on a char boundary
		&s[..SHORT_ID_LEN]
	} else {
		s
	}
}

#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use chatcast_domain::AuthorId;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::SecretString;

/// Fixed reason code attached to every automated ban.
pub const BAN_REASON_CODE: &str = "automod_banned_term";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BanError {
	/// 401/403: the configured credentials may not moderate this room.
	#[error("not authorized to ban in this room; grant the bot account moderator rights and refresh its token")]
	NotAuthorized,
	#[error("ban request timed out")]
	Timeout,
	#[error("ban rejected: status={status}")]
	Rejected { status: u16 },
	#[error("ban request failed: {0}")]
	Request(String),
}

impl BanError {
	/// Permission faults are surfaced to users and never retried.
	pub fn is_permission(&self) -> bool {
		matches!(self, Self::NotAuthorized)
	}
}

/// Outbound moderation endpoint.
#[async_trait]
pub trait BanClient: Send + Sync + 'static {
	async fn ban(&self, room: &str, author: &AuthorId, reason: &str) -> Result<(), BanError>;
}

/// Map an HTTP status from the moderation endpoint to a ban outcome.
pub fn classify_ban_status(status: StatusCode) -> Result<(), BanError> {
	if status.is_success() {
		return Ok(());
	}
	match status {
		StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(BanError::NotAuthorized),
		status => Err(BanError::Rejected { status: status.as_u16() }),
	}
}

#[derive(Debug, Serialize)]
struct BanRequest<'a> {
	room: &'a str,
	user: &'a str,
	reason: &'a str,
}

/// Ban client for the platform's REST moderation endpoint.
#[derive(Debug, Clone)]
pub struct HttpBanClient {
	base_url: String,
	auth_token: SecretString,
	timeout: Duration,
	client: reqwest::Client,
}

impl HttpBanClient {
	pub fn new(base_url: impl Into<String>, auth_token: SecretString) -> Self {
		Self {
			base_url: base_url.into(),
			auth_token,
			timeout: Duration::from_secs(10),
			client: reqwest::Client::new(),
		}
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	fn auth_header(&self) -> Option<String> {
		let token = self.auth_token.expose().trim();
		if token.is_empty() {
			None
		} else {
			Some(format!("Bearer {token}"))
		}
	}
}

#[async_trait]
impl BanClient for HttpBanClient {
	async fn ban(&self, room: &str, author: &AuthorId, reason: &str) -> Result<(), BanError> {
		let Some(auth) = self.auth_header() else {
			return Err(BanError::NotAuthorized);
		};

		let url = format!("{}/moderation/ban", self.base_url.trim_end_matches('/'));
		let body = BanRequest {
			room,
			user: author.as_str(),
			reason,
		};

		let resp = self
			.client
			.post(url)
			.header("Authorization", auth)
			.timeout(self.timeout)
			.json(&body)
			.send()
			.await
			.map_err(|e| {
				if e.is_timeout() {
					BanError::Timeout
				} else {
					BanError::Request(e.to_string())
				}
			})?;

		classify_ban_status(resp.status())
	}
}

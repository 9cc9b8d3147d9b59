#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use chatcast_domain::ChannelId;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::server::broadcast::{BroadcastEnvelope, BroadcastHub, BroadcastKind};
use crate::util::time::unix_ms;

pub const MIN_POLL_SECS: u64 = 5;
pub const MAX_POLL_SECS: u64 = 300;
pub const DEFAULT_POLL_SECS: u64 = 60;

/// Period of the closing check.
pub const POLL_TICK: Duration = Duration::from_millis(500);

/// Poll validation faults; the message is meant for the chat user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
	#[error("usage: /poll \"question\" 1:option 2:option [seconds]")]
	Usage,
	#[error("a poll needs a question")]
	MissingQuestion,
	#[error("a poll needs at least 2 options")]
	NotEnoughOptions,
	#[error("option {0} is listed twice")]
	DuplicateOption(u32),
	#[error("unexpected argument '{0}'")]
	UnexpectedArgument(String),
	#[error("a poll is already running")]
	AlreadyActive,
	#[error("no poll is running")]
	NoActivePoll,
	#[error("the poll has closed")]
	Closed,
	#[error("{0} is not an option in this poll")]
	InvalidOption(u32),
	#[error("only whitelisted users can do that")]
	NotWhitelisted,
}

/// Clamp a requested duration to the allowed range; `None` yields the default.
pub fn clamp_duration(secs: Option<u64>) -> Duration {
	Duration::from_secs(secs.unwrap_or(DEFAULT_POLL_SECS).clamp(MIN_POLL_SECS, MAX_POLL_SECS))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionTally {
	pub key: u32,
	pub label: String,
	pub votes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PollOutcome {
	NoVotes,
	Winner { key: u32, label: String, votes: u64 },
	/// Every option sharing the top tally; no tiebreak is applied.
	Tie { keys: Vec<u32>, votes: u64 },
}

/// Poll state as broadcast to overlays and reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollSnapshot {
	pub question: String,
	pub options: Vec<OptionTally>,
	pub total_votes: u64,
	pub ends_at_ms: i64,
	pub closed: bool,
	pub outcome: PollOutcome,
}

impl PollSnapshot {
	/// Winning option key; `None` on a tie or without votes.
	pub fn winner(&self) -> Option<u32> {
		match self.outcome {
			PollOutcome::Winner { key, .. } => Some(key),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
	Counted,
	Changed { from: u32 },
	Unchanged,
}

#[derive(Debug)]
struct Poll {
	question: String,
	options: Vec<OptionTally>,
	voters: HashMap<String, u32>,
	deadline: Instant,
	ends_at: SystemTime,
	closed: bool,
}

impl Poll {
	fn tally_mut(&mut self, key: u32) -> Option<&mut OptionTally> {
		self.options.iter_mut().find(|o| o.key == key)
	}

	fn snapshot(&self) -> PollSnapshot {
		let total_votes = self.options.iter().map(|o| o.votes).sum();
		PollSnapshot {
			question: self.question.clone(),
			options: self.options.clone(),
			total_votes,
			ends_at_ms: unix_ms(self.ends_at),
			closed: self.closed,
			outcome: outcome(&self.options),
		}
	}
}

fn outcome(options: &[OptionTally]) -> PollOutcome {
	let top = options.iter().map(|o| o.votes).max().unwrap_or(0);
	if top == 0 {
		return PollOutcome::NoVotes;
	}

	let leaders: Vec<&OptionTally> = options.iter().filter(|o| o.votes == top).collect();
	match leaders.as_slice() {
		[only] => PollOutcome::Winner {
			key: only.key,
			label: only.label.clone(),
			votes: top,
		},
		_ => PollOutcome::Tie {
			keys: leaders.iter().map(|o| o.key).collect(),
			votes: top,
		},
	}
}

#[derive(Default)]
struct ChannelPolls {
	active: Option<Poll>,
	last_result: Option<PollSnapshot>,
	ticker: Option<JoinHandle<()>>,
}

/// One poll per channel: `no-poll -> active -> closed -> no-poll`.
///
/// Expiry is detected by a [`POLL_TICK`] ticker rather than an exact timer. A
/// closed poll is cleared on the following tick; its final snapshot stays
/// available through [`PollEngine::results`].
pub struct PollEngine {
	hub: BroadcastHub,
	channels: Mutex<HashMap<ChannelId, ChannelPolls>>,
}

impl PollEngine {
	pub fn new(hub: BroadcastHub) -> Arc<Self> {
		Arc::new(Self {
			hub,
			channels: Mutex::new(HashMap::new()),
		})
	}

	/// Open a poll. Blank labels are dropped before the option count is checked.
	pub fn start(
		self: &Arc<Self>,
		channel: &ChannelId,
		question: &str,
		options: Vec<(u32, String)>,
		duration: Duration,
	) -> Result<PollSnapshot, PollError> {
		let question = question.trim();
		if question.is_empty() {
			return Err(PollError::MissingQuestion);
		}

		let mut seen = HashSet::new();
		let mut tallies = Vec::with_capacity(options.len());
		for (key, label) in options {
			if !seen.insert(key) {
				return Err(PollError::DuplicateOption(key));
			}
			let label = label.trim();
			if label.is_empty() {
				continue;
			}
			tallies.push(OptionTally {
				key,
				label: label.to_string(),
				votes: 0,
			});
		}
		if tallies.len() < 2 {
			return Err(PollError::NotEnoughOptions);
		}

		let mut channels = self.channels.lock();
		let entry = channels.entry(channel.clone()).or_default();
		if entry.active.as_ref().is_some_and(|p| !p.closed) {
			return Err(PollError::AlreadyActive);
		}

		let poll = Poll {
			question: question.to_string(),
			options: tallies,
			voters: HashMap::new(),
			deadline: Instant::now() + duration,
			ends_at: SystemTime::now() + duration,
			closed: false,
		};
		let snapshot = poll.snapshot();
		entry.active = Some(poll);
		if let Some(old) = entry.ticker.take() {
			old.abort();
		}
		entry.ticker = Some(spawn_ticker(Arc::downgrade(self), channel.clone()));
		drop(channels);

		info!(%channel, question, secs = duration.as_secs(), "poll: started");
		self.publish(channel, &snapshot);
		Ok(snapshot)
	}

	/// Record `voter`'s choice; a voter holds exactly one live vote.
	pub fn vote(&self, channel: &ChannelId, voter: &str, key: u32) -> Result<VoteOutcome, PollError> {
		let (result, snapshot) = {
			let mut channels = self.channels.lock();
			let poll = channels
				.get_mut(channel)
				.and_then(|c| c.active.as_mut())
				.ok_or(PollError::NoActivePoll)?;

			if poll.closed || Instant::now() >= poll.deadline {
				return Err(PollError::Closed);
			}
			if !poll.options.iter().any(|o| o.key == key) {
				return Err(PollError::InvalidOption(key));
			}

			let previous = poll.voters.insert(voter.to_string(), key);
			let result = match previous {
				Some(prev) if prev == key => return Ok(VoteOutcome::Unchanged),
				Some(prev) => {
					if let Some(t) = poll.tally_mut(prev) {
						t.votes = t.votes.saturating_sub(1);
					}
					VoteOutcome::Changed { from: prev }
				}
				None => VoteOutcome::Counted,
			};
			if let Some(t) = poll.tally_mut(key) {
				t.votes += 1;
			}
			(result, poll.snapshot())
		};

		metrics::counter!("chatcast_poll_votes_total").increment(1);
		debug!(%channel, voter, key, "poll: vote recorded");
		self.publish(channel, &snapshot);
		Ok(result)
	}

	/// Close and clear the running poll now.
	pub fn end(&self, channel: &ChannelId) -> Result<PollSnapshot, PollError> {
		let snapshot = {
			let mut channels = self.channels.lock();
			let entry = channels.get_mut(channel).ok_or(PollError::NoActivePoll)?;
			let mut poll = entry.active.take().ok_or(PollError::NoActivePoll)?;
			if let Some(t) = entry.ticker.take() {
				t.abort();
			}
			poll.closed = true;
			let snapshot = poll.snapshot();
			entry.last_result = Some(snapshot.clone());
			snapshot
		};

		info!(%channel, "poll: ended early");
		self.publish(channel, &snapshot);
		Ok(snapshot)
	}

	/// The running poll, or the most recently finished one.
	pub fn results(&self, channel: &ChannelId) -> Option<PollSnapshot> {
		let channels = self.channels.lock();
		let entry = channels.get(channel)?;
		entry
			.active
			.as_ref()
			.map(Poll::snapshot)
			.or_else(|| entry.last_result.clone())
	}

	pub fn winner(&self, channel: &ChannelId) -> Option<u32> {
		self.results(channel).and_then(|s| s.winner())
	}

	pub fn is_active(&self, channel: &ChannelId) -> bool {
		self.channels
			.lock()
			.get(channel)
			.and_then(|c| c.active.as_ref())
			.is_some_and(|p| !p.closed)
	}

	pub fn forget(&self, channel: &ChannelId) {
		if let Some(entry) = self.channels.lock().remove(channel)
			&& let Some(t) = entry.ticker
		{
			t.abort();
		}
	}

	/// One ticker step; returns `false` once there is nothing left to watch.
	fn tick(&self, channel: &ChannelId) -> bool {
		let closed_now = {
			let mut channels = self.channels.lock();
			let Some(entry) = channels.get_mut(channel) else {
				return false;
			};
			let Some(poll) = entry.active.as_mut() else {
				entry.ticker = None;
				return false;
			};

			if poll.closed {
				entry.active = None;
				entry.ticker = None;
				debug!(%channel, "poll: cleared");
				return false;
			}

			if Instant::now() < poll.deadline {
				return true;
			}

			poll.closed = true;
			let snapshot = poll.snapshot();
			entry.last_result = Some(snapshot.clone());
			snapshot
		};

		info!(%channel, total_votes = closed_now.total_votes, "poll: closed");
		self.publish(channel, &closed_now);
		true
	}

	fn publish(&self, channel: &ChannelId, snapshot: &PollSnapshot) {
		self.hub
			.publish(BroadcastEnvelope::new(BroadcastKind::Poll, channel.clone(), snapshot));
	}
}

fn spawn_ticker(engine: Weak<PollEngine>, channel: ChannelId) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval_at(Instant::now() + POLL_TICK, POLL_TICK);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			ticker.tick().await;
			let Some(engine) = engine.upgrade() else {
				return;
			};
			if !engine.tick(&channel) {
				return;
			}
		}
	})
}

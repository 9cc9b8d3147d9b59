#![forbid(unsafe_code)]

pub mod command;
pub mod engine;

use std::collections::HashMap;
use std::sync::Arc;

use chatcast_domain::{AuthorId, ChannelId};
use chatcast_platform::ChatMessage;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use command::{Command, PollRequest, WhitelistCommand, parse_command};
pub use engine::{PollEngine, PollError, PollOutcome, PollSnapshot, VoteOutcome};

use crate::server::monitor::MessageHandler;
use crate::server::registry::MonitorHandle;
use crate::server::settings::SettingsService;

struct PollChannel {
	monitor: MonitorHandle,

	/// Identity that may always manage polls (the payout wallet owner).
	owner: Option<String>,
}

/// Chat-facing side of the poll engine: commands, votes, privilege checks and replies.
pub struct PollService {
	engine: Arc<PollEngine>,
	settings: Arc<SettingsService>,
	channels: Mutex<HashMap<ChannelId, PollChannel>>,
	whitelist_writes: Arc<tokio::sync::Mutex<()>>,
}

impl PollService {
	pub fn new(engine: Arc<PollEngine>, settings: Arc<SettingsService>) -> Self {
		Self {
			engine,
			settings,
			channels: Mutex::new(HashMap::new()),
			whitelist_writes: Arc::new(tokio::sync::Mutex::new(())),
		}
	}

	pub fn engine(&self) -> &Arc<PollEngine> {
		&self.engine
	}

	/// Route replies for `channel` through `monitor`.
	pub fn attach(&self, channel: &ChannelId, monitor: MonitorHandle, owner: Option<String>) {
		self.channels
			.lock()
			.insert(channel.clone(), PollChannel { monitor, owner });
	}

	pub fn forget(&self, channel: &ChannelId) {
		self.channels.lock().remove(channel);
		self.engine.forget(channel);
	}

	fn is_privileged(&self, channel: &ChannelId, author: &AuthorId) -> bool {
		if self.settings.current(channel).poll.is_whitelisted(author.as_str()) {
			return true;
		}
		self.channels
			.lock()
			.get(channel)
			.and_then(|c| c.owner.as_deref())
			.is_some_and(|owner| owner == author.as_str())
	}

	fn reply(&self, channel: &ChannelId, text: String) {
		let Some(monitor) = self.channels.lock().get(channel).map(|c| c.monitor.clone()) else {
			debug!(%channel, "poll: no monitor to reply through");
			return;
		};
		let channel = channel.clone();
		tokio::spawn(async move {
			if let Err(e) = monitor.send_message(&text).await {
				warn!(%channel, error = %e, "poll: chat reply failed");
			}
		});
	}

	fn handle(&self, channel: &ChannelId, msg: &ChatMessage) {
		let Some(parsed) = parse_command(&msg.text) else {
			return;
		};
		let author = &msg.author;

		let cmd = match parsed {
			Ok(cmd) => cmd,
			Err(e) => {
				let err = if self.is_privileged(channel, author) {
					e
				} else {
					PollError::NotWhitelisted
				};
				self.reply(channel, format!("@{author} {err}"));
				return;
			}
		};

		match cmd {
			Command::Vote(key) => match self.engine.vote(channel, author.as_str(), key) {
				Ok(_) => {}
				Err(PollError::NoActivePoll) => {}
				Err(e) => debug!(%channel, %author, key, error = %e, "poll: vote rejected"),
			},
			Command::StartPoll(req) => {
				if !self.is_privileged(channel, author) {
					self.reply(channel, format!("@{author} {}", PollError::NotWhitelisted));
					return;
				}
				match self.engine.start(channel, &req.question, req.options, req.duration) {
					Ok(snapshot) => {
						let options: Vec<String> =
							snapshot.options.iter().map(|o| format!("{}: {}", o.key, o.label)).collect();
						self.reply(
							channel,
							format!(
								"poll started: {} {} ({}s, type the number to vote)",
								snapshot.question,
								options.join(" | "),
								req.duration.as_secs()
							),
						);
					}
					Err(e) => self.reply(channel, format!("@{author} {e}")),
				}
			}
			Command::EndPoll => {
				if !self.is_privileged(channel, author) {
					self.reply(channel, format!("@{author} {}", PollError::NotWhitelisted));
					return;
				}
				match self.engine.end(channel) {
					Ok(snapshot) => self.reply(channel, describe_outcome(&snapshot)),
					Err(e) => self.reply(channel, format!("@{author} {e}")),
				}
			}
			Command::Whitelist(wl) => self.whitelist(channel, author, wl),
		}
	}

	fn whitelist(&self, channel: &ChannelId, author: &AuthorId, cmd: WhitelistCommand) {
		let (id, add) = match cmd {
			WhitelistCommand::Help => {
				self.reply(channel, command::WHITELIST_HELP.to_string());
				return;
			}
			WhitelistCommand::Me => {
				let answer = if self.is_privileged(channel, author) {
					"you can manage polls"
				} else {
					"you are not whitelisted"
				};
				self.reply(channel, format!("@{author} {answer}"));
				return;
			}
			WhitelistCommand::List => {
				let list = self.settings.current(channel).poll.whitelist.clone();
				let text = if list.is_empty() {
					"whitelist is empty".to_string()
				} else {
					format!("whitelist: {}", list.join(", "))
				};
				self.reply(channel, text);
				return;
			}
			WhitelistCommand::Add(id) => (id, true),
			WhitelistCommand::Remove(id) => (id, false),
		};

		if !self.is_privileged(channel, author) {
			self.reply(channel, format!("@{author} {}", PollError::NotWhitelisted));
			return;
		}

		let Some(monitor) = self.channels.lock().get(channel).map(|c| c.monitor.clone()) else {
			return;
		};
		let settings = Arc::clone(&self.settings);
		let writes = Arc::clone(&self.whitelist_writes);
		let channel = channel.clone();

		tokio::spawn(async move {
			let _guard = writes.lock().await;

			let mut next = (*settings.current(&channel)).clone();
			let present = next.poll.is_whitelisted(&id);
			let reply = match (add, present) {
				(true, true) => format!("{id} is already whitelisted"),
				(false, false) => format!("{id} is not whitelisted"),
				(true, false) => {
					next.poll.whitelist.push(id.clone());
					format!("{id} added to the whitelist")
				}
				(false, true) => {
					next.poll.whitelist.retain(|w| w != &id);
					format!("{id} removed from the whitelist")
				}
			};

			if add != present {
				if let Err(e) = settings.update(&channel, &next).await {
					warn!(%channel, error = %e, "poll: whitelist update failed");
					let _ = monitor.send_message("whitelist update failed, try again later").await;
					return;
				}
				info!(%channel, %id, add, "poll: whitelist updated");
			}

			if let Err(e) = monitor.send_message(&reply).await {
				warn!(%channel, error = %e, "poll: chat reply failed");
			}
		});
	}
}

impl MessageHandler for PollService {
	fn on_message(&self, channel: &ChannelId, msg: &ChatMessage) -> anyhow::Result<()> {
		self.handle(channel, msg);
		Ok(())
	}
}

/// One-line chat summary of a finished poll.
pub fn describe_outcome(snapshot: &PollSnapshot) -> String {
	match &snapshot.outcome {
		PollOutcome::NoVotes => format!("poll closed: \"{}\" got no votes", snapshot.question),
		PollOutcome::Winner { label, votes, .. } => {
			format!("poll closed: {label} wins with {votes} of {} votes", snapshot.total_votes)
		}
		PollOutcome::Tie { keys, votes } => {
			let keys: Vec<String> = keys.iter().map(u32::to_string).collect();
			format!("poll closed: tie between options {} ({votes} votes each)", keys.join(", "))
		}
	}
}

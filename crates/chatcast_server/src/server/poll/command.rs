#![forbid(unsafe_code)]

use std::time::Duration;

use super::engine::{PollError, clamp_duration};

pub const WHITELIST_HELP: &str = "usage: /whitelist list | add <id> | remove <id> | me | help";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
	pub question: String,
	pub options: Vec<(u32, String)>,
	pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhitelistCommand {
	List,
	Add(String),
	Remove(String),
	Me,
	Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
	StartPoll(PollRequest),
	EndPoll,
	Whitelist(WhitelistCommand),
	/// A bare option number typed in chat.
	Vote(u32),
}

/// Parse a chat line. `None` for ordinary chat.
pub fn parse_command(text: &str) -> Option<Result<Command, PollError>> {
	let text = text.trim();

	if let Ok(key) = text.parse::<u32>() {
		return Some(Ok(Command::Vote(key)));
	}

	let (head, rest) = match text.split_once(char::is_whitespace) {
		Some((h, r)) => (h, r.trim()),
		None => (text, ""),
	};

	match head.to_ascii_lowercase().as_str() {
		"/poll" => Some(parse_poll(rest)),
		"/whitelist" => Some(Ok(Command::Whitelist(parse_whitelist(rest)))),
		_ => None,
	}
}

/// `"<question>" <n>:<label> ... [seconds]`, or `end`.
fn parse_poll(args: &str) -> Result<Command, PollError> {
	let mut tokens = tokenize(args).into_iter();

	let Some(question) = tokens.next() else {
		return Err(PollError::Usage);
	};
	if question.eq_ignore_ascii_case("end") && tokens.len() == 0 {
		return Ok(Command::EndPoll);
	}
	if question.trim().is_empty() {
		return Err(PollError::MissingQuestion);
	}

	let rest: Vec<String> = tokens.collect();
	let mut options = Vec::new();
	let mut duration_secs = None;

	for (i, tok) in rest.iter().enumerate() {
		if let Some((key, label)) = tok.split_once(':')
			&& let Ok(key) = key.trim().parse::<u32>()
		{
			options.push((key, label.to_string()));
			continue;
		}

		// only the final token may be the duration
		if i + 1 == rest.len()
			&& let Ok(secs) = tok.parse::<u64>()
		{
			duration_secs = Some(secs);
			continue;
		}

		return Err(PollError::UnexpectedArgument(tok.clone()));
	}

	Ok(Command::StartPoll(PollRequest {
		question,
		options,
		duration: clamp_duration(duration_secs),
	}))
}

fn parse_whitelist(args: &str) -> WhitelistCommand {
	let mut parts = args.split_whitespace();
	let sub = parts.next().map(str::to_ascii_lowercase);
	let id = parts.next().map(str::to_string);

	match (sub.as_deref(), id) {
		(Some("list"), _) => WhitelistCommand::List,
		(Some("add"), Some(id)) => WhitelistCommand::Add(id),
		(Some("remove"), Some(id)) => WhitelistCommand::Remove(id),
		(Some("me"), _) => WhitelistCommand::Me,
		_ => WhitelistCommand::Help,
	}
}

/// Whitespace split where double quotes group words; quotes are removed.
fn tokenize(s: &str) -> Vec<String> {
	let mut out = Vec::new();
	let mut cur = String::new();
	let mut in_quotes = false;
	let mut started = false;

	for c in s.chars() {
		match c {
			'"' => {
				in_quotes = !in_quotes;
				started = true;
			}
			c if c.is_whitespace() && !in_quotes => {
				if started {
					out.push(std::mem::take(&mut cur));
					started = false;
				}
			}
			c => {
				cur.push(c);
				started = true;
			}
		}
	}
	if started {
		out.push(cur);
	}
	out
}

#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;

use anyhow::Context as _;
use tracing::info;

use crate::server::settings::AutomodSettings;

/// Spam phrases matched when a channel enables the spam list.
pub const BUILTIN_SPAM_PHRASES: &[&str] = &[
	"free airdrop",
	"claim your tokens",
	"dm me for",
	"check my profile",
	"double your sol",
	"giveaway link",
	"t.me/",
	"discord.gg/",
];

/// Which list produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSource {
	Custom,
	Slur,
	Spam,
}

impl TermSource {
	pub fn as_str(self) -> &'static str {
		match self {
			TermSource::Custom => "custom",
			TermSource::Slur => "slur",
			TermSource::Spam => "spam",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermMatch {
	pub term: String,
	pub source: TermSource,
}

/// Process-wide banned-term lists, read-mostly and shared by every channel.
///
/// Terms are stored lowercased; matching is a case-insensitive substring test.
#[derive(Debug, Clone, Default)]
pub struct TermLists {
	slurs: Vec<String>,
	spam: Vec<String>,
}

impl TermLists {
	pub fn new(slurs: impl IntoIterator<Item = String>, spam: impl IntoIterator<Item = String>) -> Self {
		Self {
			slurs: normalize(slurs),
			spam: normalize(spam),
		}
	}

	/// Built-in spam phrases, plus the optional newline-separated list files.
	pub fn load(slur_path: Option<&Path>, spam_path: Option<&Path>) -> anyhow::Result<Self> {
		let slurs = match slur_path {
			Some(p) => read_list(p)?,
			None => Vec::new(),
		};

		let mut spam: Vec<String> = BUILTIN_SPAM_PHRASES.iter().map(|s| s.to_string()).collect();
		if let Some(p) = spam_path {
			spam.extend(read_list(p)?);
		}

		let lists = Self::new(slurs, spam);
		info!(slurs = lists.slurs.len(), spam = lists.spam.len(), "banned-term lists loaded");
		Ok(lists)
	}

	/// First banned term in `text` under the channel's automod selection.
	pub fn find(&self, automod: &AutomodSettings, text: &str) -> Option<TermMatch> {
		let haystack = text.to_lowercase();

		let custom = automod
			.custom_words
			.iter()
			.map(|w| w.trim().to_lowercase())
			.filter(|w| !w.is_empty())
			.find(|w| haystack.contains(w.as_str()));
		if let Some(term) = custom {
			return Some(TermMatch {
				term,
				source: TermSource::Custom,
			});
		}

		if automod.use_slur_list
			&& let Some(term) = self.slurs.iter().find(|t| haystack.contains(t.as_str()))
		{
			return Some(TermMatch {
				term: term.clone(),
				source: TermSource::Slur,
			});
		}

		if automod.use_spam_list
			&& let Some(term) = self.spam.iter().find(|t| haystack.contains(t.as_str()))
		{
			return Some(TermMatch {
				term: term.clone(),
				source: TermSource::Spam,
			});
		}

		None
	}
}

fn normalize(terms: impl IntoIterator<Item = String>) -> Vec<String> {
	let mut out: Vec<String> = terms
		.into_iter()
		.map(|t| t.trim().to_lowercase())
		.filter(|t| !t.is_empty())
		.collect();
	out.sort();
	out.dedup();
	out
}

fn read_list(path: &Path) -> anyhow::Result<Vec<String>> {
	let raw = fs::read_to_string(path).with_context(|| format!("read term list {}", path.display()))?;
	Ok(raw
		.lines()
		.map(str::trim)
		.filter(|l| !l.is_empty() && !l.starts_with('#'))
		.map(str::to_string)
		.collect())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn automod(custom: &[&str], slurs: bool, spam: bool) -> AutomodSettings {
		AutomodSettings {
			enabled: true,
			custom_words: custom.iter().map(|s| s.to_string()).collect(),
			use_slur_list: slurs,
			use_spam_list: spam,
		}
	}

	#[test]
	fn custom_words_match_case_insensitively() {
		let lists = TermLists::default();
		let m = lists.find(&automod(&["Rug"], false, false), "this is a RUG pull").unwrap();
		assert_eq!(m.term, "rug");
		assert_eq!(m.source, TermSource::Custom);
	}

	#[test]
	fn global_lists_only_apply_when_enabled() {
		let lists = TermLists::new(vec!["badword".to_string()], vec!["free airdrop".to_string()]);
		let text = "FREE AIRDROP for badword holders";

		assert_eq!(lists.find(&automod(&[], false, false), text), None);
		assert_eq!(lists.find(&automod(&[], true, false), text).unwrap().source, TermSource::Slur);
		assert_eq!(lists.find(&automod(&[], false, true), text).unwrap().source, TermSource::Spam);
	}

	#[test]
	fn blank_custom_words_never_match() {
		let lists = TermLists::default();
		assert_eq!(lists.find(&automod(&["  ", ""], false, false), "anything"), None);
	}

	#[test]
	fn load_merges_builtin_spam_with_file() {
		let dir = std::env::temp_dir().join(format!("chatcast-terms-{}", std::process::id()));
		fs::create_dir_all(&dir).unwrap();
		let spam = dir.join("spam.txt");
		fs::write(&spam, "# comment\nBuy Followers\n\n").unwrap();

		let lists = TermLists::load(None, Some(&spam)).unwrap();
		let settings = automod(&[], false, true);
		assert!(lists.find(&settings, "buy followers now").is_some());
		assert!(lists.find(&settings, "join t.me/scam").is_some());

		let _ = fs::remove_dir_all(&dir);
	}
}

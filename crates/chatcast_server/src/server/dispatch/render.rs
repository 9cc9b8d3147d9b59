#![forbid(unsafe_code)]

use chatcast_domain::AuthorId;

use super::TriggerKind;

/// Text spoken for a queue entry.
///
/// Donation entries with a positive amount get a `"{short} donated {amount} {unit}. "`
/// prefix; everything else is the message text unchanged.
pub fn render_text(author: &AuthorId, text: &str, kind: TriggerKind, amount: Option<f64>, unit: &str) -> String {
	match (kind, amount) {
		(TriggerKind::Donation, Some(amount)) if amount > 0.0 => {
			format!("{} donated {} {}. {}", author.short(), amount, unit, text)
		}
		_ => text.to_string(),
	}
}

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chatcast_domain::{AuthorId, ChannelId};
use chatcast_platform::{LedgerClient, detect_donation};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::LedgerSettings;
use crate::server::dispatch::DispatchQueue;

#[derive(Debug, Clone)]
pub struct DonationWatcherConfig {
	pub poll_interval: Duration,

	/// Transactions older than this are ignored.
	pub max_age: Duration,
}

impl Default for DonationWatcherConfig {
	fn default() -> Self {
		Self::from(&LedgerSettings::default())
	}
}

impl From<&LedgerSettings> for DonationWatcherConfig {
	fn from(s: &LedgerSettings) -> Self {
		Self {
			poll_interval: s.poll_interval,
			max_age: s.donation_max_age,
		}
	}
}

/// Poll a payout wallet and register each new donation with the dispatch queue.
///
/// Only a changed latest signature triggers a transaction fetch. Ledger errors
/// are logged and the next tick retries. Abort the handle to stop watching.
pub fn spawn_donation_watcher(
	channel: ChannelId,
	wallet: String,
	ledger: Arc<dyn LedgerClient>,
	queue: Arc<DispatchQueue>,
	cfg: DonationWatcherConfig,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		info!(%channel, %wallet, interval_ms = cfg.poll_interval.as_millis(), "donations: watcher started");

		let mut ticker = tokio::time::interval(cfg.poll_interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let mut last_seen: Option<String> = None;

		loop {
			ticker.tick().await;

			let signature = match ledger.latest_signature(&wallet).await {
				Ok(Some(sig)) => sig,
				Ok(None) => continue,
				Err(e) => {
					metrics::counter!("chatcast_ledger_errors_total").increment(1);
					warn!(%channel, %wallet, error = %e, "donations: signature lookup failed");
					continue;
				}
			};

			if last_seen.as_deref() == Some(signature.as_str()) {
				continue;
			}

			let tx = match ledger.transaction(&signature).await {
				Ok(Some(tx)) => tx,
				Ok(None) => {
					// not yet visible; retry on the next tick
					debug!(%channel, %signature, "donations: transaction not found yet");
					continue;
				}
				Err(e) => {
					metrics::counter!("chatcast_ledger_errors_total").increment(1);
					warn!(%channel, %signature, error = %e, "donations: transaction fetch failed");
					continue;
				}
			};
			last_seen = Some(signature.clone());

			let Some(donation) = detect_donation(&tx, &wallet, SystemTime::now(), cfg.max_age) else {
				debug!(%channel, %signature, "donations: no qualifying transfer");
				continue;
			};

			match AuthorId::new(donation.payer.clone()) {
				Ok(payer) => queue.register_donation(&channel, &payer, donation.amount),
				Err(e) => warn!(%channel, %signature, error = %e, "donations: unusable payer identity"),
			}
		}
	})
}

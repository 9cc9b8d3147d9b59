#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chatcast_domain::ChannelId;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::server::broadcast::{BroadcastHub, BroadcastHubConfig, BroadcastItem, BroadcastKind};
use crate::server::dispatch::{DispatchConfig, DispatchQueue, RejectReason, TriggerKind};
use crate::server::settings::{ChannelSettings, SettingsService, TtsSettings};
use crate::server::store::MemoryStore;
use crate::server::terms::TermLists;
use crate::server::test_support::{author, channel, init_test_logging};

struct Harness {
	channel: ChannelId,
	queue: DispatchQueue,
	store: Arc<MemoryStore>,
	settings: Arc<SettingsService>,
	rx: mpsc::Receiver<BroadcastItem>,
}

async fn harness(tts: TtsSettings) -> Harness {
	init_test_logging();
	let ch = channel("c");
	let store = Arc::new(MemoryStore::new());
	let settings = Arc::new(SettingsService::new(store.clone()));

	let mut s = ChannelSettings::default();
	s.tts = tts;
	s.automod.custom_words = vec!["scam".to_string()];
	settings.update(&ch, &s).await.unwrap();

	let hub = BroadcastHub::new(BroadcastHubConfig::default());
	let rx = hub.subscribe(&ch);
	let cfg = DispatchConfig {
		correlation_window: Duration::from_secs(300),
		unit_symbol: "UNIT".to_string(),
	};
	let queue = DispatchQueue::new(cfg, settings.clone(), Arc::new(TermLists::default()), store.clone(), hub);

	Harness {
		channel: ch,
		queue,
		store,
		settings,
		rx,
	}
}

fn tts(gated: bool, cooldown_secs: u64) -> TtsSettings {
	TtsSettings {
		enabled: true,
		donation_gated: gated,
		cooldown_secs,
		max_length: 20,
	}
}

async fn next_tts(rx: &mut mpsc::Receiver<BroadcastItem>) -> serde_json::Value {
	match rx.recv().await {
		Some(BroadcastItem::Event(env)) => {
			assert_eq!(env.kind, BroadcastKind::Tts);
			env.payload
		}
		other => panic!("expected tts broadcast, got {other:?}"),
	}
}

#[tokio::test(start_paused = true)]
async fn donation_is_read_out_once_with_short_prefix() {
	let mut h = harness(tts(true, 10)).await;
	let donor = author("Addr1");

	h.queue.register_donation(&h.channel, &donor, 0.5);
	assert_eq!(h.queue.offer(&h.channel, &donor, "gg"), Ok(TriggerKind::Donation));

	let payload = next_tts(&mut h.rx).await;
	assert_eq!(payload["text"], "Addr donated 0.5 UNIT. gg");
	assert_eq!(payload["kind"], "donation");
	assert_eq!(payload["author"], "Addr1");

	// the window was consumed by the first message
	assert_eq!(h.queue.offer(&h.channel, &donor, "gg again"), Err(RejectReason::NoDonation));
	assert!(!h.queue.has_open_donation(&h.channel, &donor));

	let records = h.store.records(&h.channel);
	assert_eq!(records.len(), 1);
	assert_eq!(records[0].amount, Some(0.5));
}

#[tokio::test(start_paused = true)]
async fn gated_channel_drops_non_donors() {
	let h = harness(tts(true, 10)).await;
	assert_eq!(
		h.queue.offer(&h.channel, &author("viewer"), "hello"),
		Err(RejectReason::NoDonation)
	);
	assert_eq!(h.queue.queued(&h.channel), 0);
}

#[tokio::test(start_paused = true)]
async fn zero_amount_donation_renders_plain_text() {
	let mut h = harness(tts(true, 10)).await;
	let donor = author("Addr1");
	h.queue.register_donation(&h.channel, &donor, 0.0);

	assert_eq!(h.queue.offer(&h.channel, &donor, "gg"), Ok(TriggerKind::Donation));
	assert_eq!(next_tts(&mut h.rx).await["text"], "gg");
}

#[tokio::test(start_paused = true)]
async fn expired_donation_no_longer_matches() {
	let h = harness(tts(true, 10)).await;
	let donor = author("Addr1");
	h.queue.register_donation(&h.channel, &donor, 1.0);

	tokio::time::advance(Duration::from_secs(300)).await;
	assert_eq!(h.queue.offer(&h.channel, &donor, "late"), Err(RejectReason::NoDonation));
}

#[tokio::test(start_paused = true)]
async fn cooldown_runs_from_last_drain() {
	let mut h = harness(tts(false, 10)).await;
	let viewer = author("viewer");

	assert!(h.queue.offer(&h.channel, &viewer, "first").is_ok());
	assert_eq!(next_tts(&mut h.rx).await["text"], "first");
	let drained_at = Instant::now();

	tokio::time::advance(Duration::from_secs(3)).await;
	assert_eq!(h.queue.offer(&h.channel, &viewer, "too soon"), Err(RejectReason::Cooldown));

	// rejected messages do not restart the cooldown
	tokio::time::advance(Duration::from_secs(7)).await;
	assert!(h.queue.offer(&h.channel, &viewer, "second").is_ok());
	assert_eq!(next_tts(&mut h.rx).await["text"], "second");
	assert!(Instant::now() - drained_at >= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn queued_entries_drain_in_order_one_cooldown_apart() {
	let mut h = harness(tts(false, 10)).await;
	let start = Instant::now();

	for text in ["a", "b", "c"] {
		assert!(h.queue.offer(&h.channel, &author("viewer"), text).is_ok());
	}
	assert_eq!(h.queue.queued(&h.channel), 3);

	let mut seen = Vec::new();
	for _ in 0..3 {
		let payload = next_tts(&mut h.rx).await;
		seen.push((payload["text"].as_str().unwrap().to_string(), Instant::now() - start));
	}

	let texts: Vec<&str> = seen.iter().map(|(t, _)| t.as_str()).collect();
	assert_eq!(texts, vec!["a", "b", "c"]);
	for pair in seen.windows(2) {
		assert!(pair[1].1 - pair[0].1 >= Duration::from_secs(10), "drains too close: {seen:?}");
	}
}

#[tokio::test(start_paused = true)]
async fn filters_reject_without_queueing() {
	let mut h = harness(tts(false, 10)).await;
	let viewer = author("viewer");

	assert_eq!(h.queue.offer(&h.channel, &viewer, "total SCAM"), Err(RejectReason::BannedTerm));
	assert_eq!(
		h.queue.offer(&h.channel, &viewer, "this line is far longer than twenty chars"),
		Err(RejectReason::TooLong)
	);
	assert_eq!(h.queue.offer(&h.channel, &viewer, "   "), Err(RejectReason::Empty));

	// filtered messages leave the channel out of cooldown
	assert!(h.queue.offer(&h.channel, &viewer, "fine").is_ok());
	assert_eq!(next_tts(&mut h.rx).await["text"], "fine");
}

#[tokio::test(start_paused = true)]
async fn disabled_channel_rejects_and_keeps_donations() {
	let h = harness(TtsSettings::default()).await;
	let donor = author("Addr1");
	h.queue.register_donation(&h.channel, &donor, 1.0);

	assert_eq!(h.queue.offer(&h.channel, &donor, "gg"), Err(RejectReason::Disabled));
	assert!(h.queue.has_open_donation(&h.channel, &donor));
}

#[tokio::test(start_paused = true)]
async fn settings_changes_apply_to_the_next_message() {
	let mut h = harness(TtsSettings::default()).await;
	let viewer = author("viewer");
	assert_eq!(h.queue.offer(&h.channel, &viewer, "hi"), Err(RejectReason::Disabled));

	let mut s = (*h.settings.current(&h.channel)).clone();
	s.tts.enabled = true;
	h.settings.update(&h.channel, &s).await.unwrap();

	assert_eq!(h.queue.offer(&h.channel, &viewer, "hi"), Ok(TriggerKind::Regular));
	assert_eq!(next_tts(&mut h.rx).await["text"], "hi");
}

#[tokio::test(start_paused = true)]
async fn forget_drops_pending_entries() {
	let mut h = harness(tts(false, 10)).await;
	for text in ["a", "b"] {
		assert!(h.queue.offer(&h.channel, &author("viewer"), text).is_ok());
	}
	assert_eq!(next_tts(&mut h.rx).await["text"], "a");

	h.queue.forget(&h.channel);
	assert_eq!(h.queue.queued(&h.channel), 0);

	tokio::time::sleep(Duration::from_secs(30)).await;
	assert!(h.rx.try_recv().is_err());
	assert_eq!(h.store.records(&h.channel).len(), 1);
}

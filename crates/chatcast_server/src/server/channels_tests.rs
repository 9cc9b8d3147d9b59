#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chatcast_domain::Channel;
use chatcast_platform::LedgerTransaction;
use tokio::sync::mpsc;

use crate::server::broadcast::{BroadcastEnvelope, BroadcastHub, BroadcastHubConfig, BroadcastItem, BroadcastKind};
use crate::server::channels::{ChannelService, ChannelServiceDeps, SUBSCRIBER_DISPATCH, SUBSCRIBER_MODERATION, SUBSCRIBER_POLL};
use crate::server::dispatch::{DispatchConfig, DispatchQueue};
use crate::server::donations::DonationWatcherConfig;
use crate::server::moderation::ModerationEngine;
use crate::server::poll::{PollEngine, PollService};
use crate::server::registry::{MonitorRegistry, RegistryConfig};
use crate::server::settings::{ChannelSettings, SettingsService, StoredSettings};
use crate::server::store::{MemoryStore, Store};
use crate::server::terms::TermLists;
use crate::server::test_support::{
	FakeFactory, RecordingBanClient, ScriptedLedger, author, channel, chat, init_test_logging, wait_connected,
};

const WALLET: &str = "Wa11etReceiver";
const SETTINGS_REFRESH: Duration = Duration::from_secs(5);

struct Harness {
	service: ChannelService,
	factory: FakeFactory,
	hub: BroadcastHub,
	dispatch: Arc<DispatchQueue>,
	moderation: Arc<ModerationEngine>,
	store: Arc<MemoryStore>,
	settings: Arc<SettingsService>,
	ledger: Arc<ScriptedLedger>,
	ban: Arc<RecordingBanClient>,
}

fn harness() -> Harness {
	init_test_logging();
	let factory = FakeFactory::default();
	let store = Arc::new(MemoryStore::new());
	let settings = Arc::new(SettingsService::new(store.clone()));
	let hub = BroadcastHub::new(BroadcastHubConfig::default());
	let terms = Arc::new(TermLists::default());
	let ban = Arc::new(RecordingBanClient::default());
	let ledger = Arc::new(ScriptedLedger::default());

	let dispatch = Arc::new(DispatchQueue::new(
		DispatchConfig {
			correlation_window: Duration::from_secs(300),
			unit_symbol: "UNIT".to_string(),
		},
		settings.clone(),
		terms.clone(),
		store.clone(),
		hub.clone(),
	));
	let moderation = Arc::new(ModerationEngine::new(
		Some(ban.clone()),
		settings.clone(),
		terms,
		hub.clone(),
	));
	let polls = Arc::new(PollService::new(PollEngine::new(hub.clone()), settings.clone()));
	let registry = Arc::new(MonitorRegistry::new(RegistryConfig::default(), Arc::new(factory.clone())));

	let service = ChannelService::new(ChannelServiceDeps {
		registry,
		settings: settings.clone(),
		dispatch: dispatch.clone(),
		moderation: moderation.clone(),
		polls,
		hub: hub.clone(),
		ledger: Some(ledger.clone()),
		watcher: DonationWatcherConfig {
			poll_interval: Duration::from_secs(10),
			max_age: Duration::from_secs(300),
		},
		settings_refresh: SETTINGS_REFRESH,
	});

	Harness {
		service,
		factory,
		hub,
		dispatch,
		moderation,
		store,
		settings,
		ledger,
		ban,
	}
}

async fn next_of(rx: &mut mpsc::Receiver<BroadcastItem>, kind: BroadcastKind) -> BroadcastEnvelope {
	loop {
		match rx.recv().await {
			Some(BroadcastItem::Event(env)) if env.kind == kind => return env,
			Some(_) => continue,
			None => panic!("broadcast stream closed"),
		}
	}
}

fn donation_tx(signature: &str, payer: &str, lamports: u64) -> LedgerTransaction {
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
	LedgerTransaction {
		signature: signature.to_string(),
		block_time: Some(now),
		failed: false,
		account_keys: vec![payer.to_string(), WALLET.to_string()],
		pre_balances: vec![5_000_000_000, 0],
		post_balances: vec![5_000_000_000 - lamports, lamports],
	}
}

#[tokio::test(start_paused = true)]
async fn register_attaches_all_subscribers_on_one_connection() {
	let h = harness();
	let ch = channel("c");
	let monitor = h.service.register(Channel::new(ch.clone(), "room")).await.unwrap();
	wait_connected(&monitor).await;

	assert_eq!(
		monitor.subscriber_names(),
		vec![SUBSCRIBER_MODERATION, SUBSCRIBER_DISPATCH, SUBSCRIBER_POLL]
	);
	assert_eq!(h.factory.upstream.created(), 1);
	assert_eq!(h.factory.upstream.live(), 1);
	assert_eq!(h.service.registered().await, vec![ch.clone()]);

	h.service.deregister(&ch).await;
	assert_eq!(h.factory.upstream.live(), 0);
	assert_eq!(h.service.registry().monitor_count(), 0);
	assert!(h.service.registered().await.is_empty());

	// unknown ids are ignored
	h.service.deregister(&ch).await;
}

#[tokio::test(start_paused = true)]
async fn donation_gated_tts_end_to_end() {
	let h = harness();
	let ch = channel("c");
	let mut rx = h.hub.subscribe(&ch);

	let mut settings = ChannelSettings::default();
	settings.tts.enabled = true;
	settings.tts.donation_gated = true;
	h.service.update_settings(&ch, &settings).await.unwrap();

	*h.ledger.latest.lock() = Some("sig1".to_string());
	h.ledger.transactions.lock().push(donation_tx("sig1", "Addr1", 500_000_000));

	let monitor = h
		.service
		.register(Channel::new(ch.clone(), "room").with_payout_wallet(WALLET))
		.await
		.unwrap();
	wait_connected(&monitor).await;
	tokio::time::sleep(Duration::from_millis(10)).await;
	assert!(h.dispatch.has_open_donation(&ch, &author("Addr1")));

	h.factory.upstream.emit("room", chat("Addr1", "gg")).await;
	let env = next_of(&mut rx, BroadcastKind::Tts).await;
	assert_eq!(env.payload["text"], "Addr donated 0.5 UNIT. gg");

	// correlation consumed: the second message is dropped
	h.factory.upstream.emit("room", chat("Addr1", "gg again")).await;
	tokio::time::sleep(Duration::from_secs(30)).await;
	assert_eq!(h.store.records(&ch).len(), 1);

	h.service.shutdown().await;
	assert_eq!(h.factory.upstream.live(), 0);
}

#[tokio::test(start_paused = true)]
async fn banned_author_is_banned_once_through_the_pipeline() {
	let h = harness();
	let ch = channel("c");

	let mut settings = ChannelSettings::default();
	settings.automod.enabled = true;
	settings.automod.custom_words = vec!["rugpull".to_string()];
	h.service.update_settings(&ch, &settings).await.unwrap();

	let monitor = h.service.register(Channel::new(ch.clone(), "room")).await.unwrap();
	wait_connected(&monitor).await;

	for _ in 0..2 {
		h.factory.upstream.emit("room", chat("troll", "RUGPULL incoming")).await;
		tokio::time::sleep(Duration::from_millis(10)).await;
	}

	assert_eq!(h.ban.call_count(), 1);
	assert_eq!(h.moderation.bans_issued(&ch), 1);
	h.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reregistering_changed_channel_rebuilds_connection() {
	let h = harness();
	let ch = channel("c");

	let first = h.service.register(Channel::new(ch.clone(), "room-a")).await.unwrap();
	wait_connected(&first).await;

	// same configuration: nothing changes
	let same = h.service.register(Channel::new(ch.clone(), "room-a")).await.unwrap();
	assert!(Arc::ptr_eq(&first, &same));
	assert_eq!(h.factory.upstream.created(), 1);

	let moved = h.service.register(Channel::new(ch.clone(), "room-b")).await.unwrap();
	wait_connected(&moved).await;
	assert!(!Arc::ptr_eq(&first, &moved));
	assert_eq!(h.factory.upstream.connects_for("room-b").len(), 1);
	assert_eq!(h.factory.upstream.live(), 1);
	assert_eq!(h.factory.upstream.max_live(), 1);

	h.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn settings_updates_are_persisted_and_reread() {
	let h = harness();
	let ch = channel("c");
	h.service.register(Channel::new(ch.clone(), "room")).await.unwrap();

	let mut settings = ChannelSettings::default();
	settings.tts.cooldown_secs = 3;
	settings.poll.whitelist = vec!["mod1".to_string()];
	let applied = h.service.update_settings(&ch, &settings).await.unwrap();
	assert_eq!(*applied, settings);

	let stored = h.store.get_settings(&ch).await.unwrap().unwrap();
	assert_eq!(stored.tts.unwrap().cooldown_secs, Some(3));
	h.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn monitor_status_changes_are_broadcast() {
	let h = harness();
	let ch = channel("c");
	let mut rx = h.hub.subscribe(&ch);

	let monitor = h.service.register(Channel::new(ch.clone(), "room")).await.unwrap();
	wait_connected(&monitor).await;

	let mut saw_connected = false;
	while !saw_connected {
		let env = next_of(&mut rx, BroadcastKind::Monitor).await;
		saw_connected = env.payload["state"] == "connected";
	}
	h.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn external_settings_writes_reach_registered_channels() {
	let h = harness();
	let ch = channel("c");
	let mut rx = h.hub.subscribe(&ch);
	let monitor = h.service.register(Channel::new(ch.clone(), "room")).await.unwrap();
	wait_connected(&monitor).await;
	assert!(!h.settings.current(&ch).tts.enabled);

	// another process enables tts behind this one's back
	let mut external = ChannelSettings::default();
	external.tts.enabled = true;
	h.store.put_settings(&ch, &StoredSettings::from(&external)).await.unwrap();

	tokio::time::sleep(SETTINGS_REFRESH + Duration::from_secs(1)).await;
	assert!(h.settings.current(&ch).tts.enabled);

	h.factory.upstream.emit("room", chat("viewer", "hello there")).await;
	let env = next_of(&mut rx, BroadcastKind::Tts).await;
	assert_eq!(env.payload["text"], "hello there");

	h.service.shutdown().await;
}

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chatcast_domain::ChannelId;
use chatcast_platform::ChatMessage;
use parking_lot::Mutex;

use crate::server::monitor::{ConnectionState, MessageHandler};
use crate::server::registry::{MonitorRegistry, RegistryConfig};
use crate::server::test_support::{FakeFactory, chat, channel, init_test_logging, wait_connected, wait_status};

fn registry(factory: &FakeFactory) -> MonitorRegistry {
	MonitorRegistry::new(RegistryConfig::default(), Arc::new(factory.clone()))
}

fn counter(hits: &Arc<Mutex<Vec<String>>>) -> Arc<dyn MessageHandler> {
	let hits = Arc::clone(hits);
	Arc::new(move |_: &ChannelId, msg: &ChatMessage| -> anyhow::Result<()> {
		hits.lock().push(msg.text.clone());
		Ok(())
	})
}

#[tokio::test(start_paused = true)]
async fn startup_connections_are_staggered() {
	init_test_logging();
	let factory = FakeFactory::default();
	let reg = registry(&factory);
	let hits = Arc::new(Mutex::new(Vec::new()));

	let start = tokio::time::Instant::now();
	let mut monitors = Vec::new();
	for i in 0..5 {
		let id = channel(&format!("ch{i}"));
		monitors.push(reg.subscribe(&id, &format!("room{i}"), "dispatch", counter(&hits)).await);
	}

	for m in &monitors {
		wait_connected(m).await;
	}

	let offsets: Vec<u64> = (0..5)
		.map(|i| {
			let t = factory.upstream.connects_for(&format!("room{i}"));
			assert_eq!(t.len(), 1);
			(t[0] - start).as_secs()
		})
		.collect();
	assert_eq!(offsets, vec![0, 2, 4, 6, 8]);
	assert_eq!(reg.monitor_count(), 5);

	reg.shutdown_all().await;
	assert_eq!(factory.upstream.live(), 0);
	assert_eq!(reg.monitor_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn subscribers_share_one_connection() {
	init_test_logging();
	let factory = FakeFactory::default();
	let reg = registry(&factory);
	let id = channel("c");

	let a_hits = Arc::new(Mutex::new(Vec::new()));
	let b_hits = Arc::new(Mutex::new(Vec::new()));

	let m1 = reg.subscribe(&id, "room", "moderation", counter(&a_hits)).await;
	let m2 = reg.subscribe(&id, "room", "poll", counter(&b_hits)).await;
	assert!(Arc::ptr_eq(&m1, &m2));

	// duplicate subscribe is a no-op returning the same monitor
	let m3 = reg.subscribe(&id, "room", "poll", counter(&b_hits)).await;
	assert!(Arc::ptr_eq(&m1, &m3));
	assert_eq!(m1.subscriber_names(), vec!["moderation".to_string(), "poll".to_string()]);

	wait_connected(&m1).await;
	factory.upstream.emit("room", chat("viewer", "hello")).await;
	tokio::time::sleep(Duration::from_millis(50)).await;

	assert_eq!(*a_hits.lock(), vec!["hello"]);
	assert_eq!(*b_hits.lock(), vec!["hello"], "duplicate subscribe must not double-deliver");
	assert_eq!(factory.upstream.created(), 1);
	assert_eq!(factory.upstream.max_live(), 1);

	reg.unsubscribe(&id, "moderation").await;
	assert_eq!(factory.upstream.live(), 1, "connection stays while subscribers remain");

	reg.unsubscribe(&id, "poll").await;
	assert_eq!(factory.upstream.live(), 0, "last unsubscribe tears the connection down");
	assert!(reg.get(&id).await.is_none());
	assert_eq!(reg.monitor_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn churn_never_opens_a_second_connection() {
	init_test_logging();
	let factory = FakeFactory::default();
	let reg = registry(&factory);
	let id = channel("c");
	let hits = Arc::new(Mutex::new(Vec::new()));

	for round in 0..4 {
		let m = reg.subscribe(&id, "room", "a", counter(&hits)).await;
		reg.subscribe(&id, "room", "b", counter(&hits)).await;
		wait_connected(&m).await;
		if round % 2 == 0 {
			let mut status = m.watch_status();
			factory.upstream.drop_connection("room").await;
			wait_status(&mut status, |s| s.attempt == 1).await;
			wait_status(&mut status, |s| s.state == ConnectionState::Connected).await;
		}
		reg.unsubscribe(&id, "a").await;
		reg.unsubscribe(&id, "b").await;
		assert_eq!(factory.upstream.live(), 0);
	}

	assert_eq!(factory.upstream.max_live(), 1);
}

#[tokio::test(start_paused = true)]
async fn resubscribe_restarts_exhausted_monitor() {
	init_test_logging();
	let factory = FakeFactory::default();
	factory.upstream.set_fail_connects(true);
	let reg = registry(&factory);
	let id = channel("c");
	let hits = Arc::new(Mutex::new(Vec::new()));

	let m = reg.subscribe(&id, "room", "dispatch", counter(&hits)).await;
	let mut status = m.watch_status();
	wait_status(&mut status, |s| s.gave_up).await;
	// let the exhausted task wind down
	tokio::time::sleep(Duration::from_secs(1)).await;
	assert!(!m.is_running());
	let attempts = factory.upstream.connects_for("room").len();

	factory.upstream.set_fail_connects(false);
	let again = reg.subscribe(&id, "room", "dispatch", counter(&hits)).await;
	assert!(Arc::ptr_eq(&m, &again));
	wait_connected(&again).await;

	assert_eq!(factory.upstream.connects_for("room").len(), attempts + 1);
	assert!(!again.status().gave_up);
	reg.shutdown_all().await;
}

#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chatcast_domain::ChannelId;
use parking_lot::Mutex;

use crate::server::dispatch::TtsRecord;
use crate::server::settings::StoredSettings;
use crate::util::time::unix_ms_now;

/// Key-by-channel persistence for settings and drained records.
#[async_trait]
pub trait Store: Send + Sync + 'static {
	/// `None` when the channel has never been configured.
	async fn get_settings(&self, channel: &ChannelId) -> anyhow::Result<Option<StoredSettings>>;

	async fn put_settings(&self, channel: &ChannelId, settings: &StoredSettings) -> anyhow::Result<()>;

	async fn save_record(&self, record: &TtsRecord) -> anyhow::Result<()>;
}

/// Records kept per channel when no limit is configured.
pub const DEFAULT_MEMORY_RECORD_LIMIT: usize = 1000;

/// Process-local store; contents are lost on restart.
///
/// Only the newest `record_limit` records of each channel are kept.
pub struct MemoryStore {
	settings: Mutex<HashMap<ChannelId, StoredSettings>>,
	records: Mutex<HashMap<ChannelId, VecDeque<TtsRecord>>>,
	record_limit: usize,
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::with_record_limit(DEFAULT_MEMORY_RECORD_LIMIT)
	}

	pub fn with_record_limit(record_limit: usize) -> Self {
		Self {
			settings: Mutex::new(HashMap::new()),
			records: Mutex::new(HashMap::new()),
			record_limit: record_limit.max(1),
		}
	}

	/// Oldest first.
	pub fn records(&self, channel: &ChannelId) -> Vec<TtsRecord> {
		self.records
			.lock()
			.get(channel)
			.map(|q| q.iter().cloned().collect())
			.unwrap_or_default()
	}
}

#[async_trait]
impl Store for MemoryStore {
	async fn get_settings(&self, channel: &ChannelId) -> anyhow::Result<Option<StoredSettings>> {
		Ok(self.settings.lock().get(channel).cloned())
	}

	async fn put_settings(&self, channel: &ChannelId, settings: &StoredSettings) -> anyhow::Result<()> {
		self.settings.lock().insert(channel.clone(), settings.clone());
		Ok(())
	}

	async fn save_record(&self, record: &TtsRecord) -> anyhow::Result<()> {
		let mut records = self.records.lock();
		let queue = records.entry(record.channel.clone()).or_default();
		if queue.len() >= self.record_limit {
			queue.pop_front();
		}
		queue.push_back(record.clone());
		Ok(())
	}
}

/// SQL-backed store (sqlite or postgres) with embedded migrations.
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}
}

fn decode_settings(raw: Option<(String,)>) -> anyhow::Result<Option<StoredSettings>> {
	raw.map(|(json,)| serde_json::from_str(&json).context("decode stored settings"))
		.transpose()
}

#[async_trait]
impl Store for SqlStore {
	async fn get_settings(&self, channel: &ChannelId) -> anyhow::Result<Option<StoredSettings>> {
		let row: Option<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT settings FROM channel_settings WHERE channel_id = ?")
				.bind(channel.as_str())
				.fetch_optional(pool)
				.await
				.context("select settings (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT settings FROM channel_settings WHERE channel_id = $1")
				.bind(channel.as_str())
				.fetch_optional(pool)
				.await
				.context("select settings (postgres)")?,
		};
		decode_settings(row)
	}

	async fn put_settings(&self, channel: &ChannelId, settings: &StoredSettings) -> anyhow::Result<()> {
		let json = serde_json::to_string(settings).context("encode settings")?;
		let now = unix_ms_now();

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO channel_settings (channel_id, settings, updated_at) VALUES (?, ?, ?) \
					ON CONFLICT(channel_id) DO UPDATE SET settings = excluded.settings, updated_at = excluded.updated_at",
				)
				.bind(channel.as_str())
				.bind(&json)
				.bind(now)
				.execute(pool)
				.await
				.context("upsert settings (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO channel_settings (channel_id, settings, updated_at) VALUES ($1, $2, $3) \
					ON CONFLICT (channel_id) DO UPDATE SET settings = EXCLUDED.settings, updated_at = EXCLUDED.updated_at",
				)
				.bind(channel.as_str())
				.bind(&json)
				.bind(now)
				.execute(pool)
				.await
				.context("upsert settings (postgres)")?;
			}
		}
		Ok(())
	}

	async fn save_record(&self, record: &TtsRecord) -> anyhow::Result<()> {
		let id = record.id.to_string();
		let kind = record.kind.as_str();

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO tts_records (id, channel_id, author, text, kind, amount, created_at) \
					VALUES (?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(&id)
				.bind(record.channel.as_str())
				.bind(record.author.as_str())
				.bind(&record.text)
				.bind(kind)
				.bind(record.amount)
				.bind(record.created_at_ms)
				.execute(pool)
				.await
				.context("insert tts_record (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO tts_records (id, channel_id, author, text, kind, amount, created_at) \
					VALUES ($1, $2, $3, $4, $5, $6, $7)",
				)
				.bind(&id)
				.bind(record.channel.as_str())
				.bind(record.author.as_str())
				.bind(&record.text)
				.bind(kind)
				.bind(record.amount)
				.bind(record.created_at_ms)
				.execute(pool)
				.await
				.context("insert tts_record (postgres)")?;
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use chatcast_domain::{AuthorId, ChannelId};
	use uuid::Uuid;

	use super::*;
	use crate::server::dispatch::TriggerKind;
	use crate::server::settings::{ChannelSettings, merge_defaults};

	fn record(channel: &ChannelId, text: &str) -> TtsRecord {
		TtsRecord {
			id: Uuid::new_v4(),
			channel: channel.clone(),
			author: AuthorId::new("viewer").unwrap(),
			text: text.to_string(),
			kind: TriggerKind::Regular,
			amount: None,
			created_at_ms: 1,
		}
	}

	#[tokio::test]
	async fn memory_store_roundtrips_settings_and_records() {
		let store = MemoryStore::new();
		let ch = ChannelId::new("c").unwrap();
		assert!(store.get_settings(&ch).await.unwrap().is_none());

		let mut settings = ChannelSettings::default();
		settings.tts.enabled = true;
		store.put_settings(&ch, &StoredSettings::from(&settings)).await.unwrap();
		let loaded = merge_defaults(store.get_settings(&ch).await.unwrap());
		assert!(loaded.tts.enabled);

		store.save_record(&record(&ch, "one")).await.unwrap();
		store.save_record(&record(&ChannelId::new("other").unwrap(), "two")).await.unwrap();
		let records = store.records(&ch);
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].text, "one");
	}

	#[tokio::test]
	async fn memory_store_keeps_only_newest_records_per_channel() {
		let store = MemoryStore::with_record_limit(3);
		let ch = ChannelId::new("c").unwrap();
		let other = ChannelId::new("other").unwrap();

		for i in 0..5 {
			store.save_record(&record(&ch, &format!("m{i}"))).await.unwrap();
		}
		store.save_record(&record(&other, "kept")).await.unwrap();

		let texts: Vec<String> = store.records(&ch).into_iter().map(|r| r.text).collect();
		assert_eq!(texts, vec!["m2", "m3", "m4"]);
		assert_eq!(store.records(&other).len(), 1);
	}

	#[tokio::test]
	async fn sqlite_store_persists_settings_and_records() {
		let store = SqlStore::connect("sqlite::memory:").await.unwrap();
		let ch = ChannelId::new("c").unwrap();
		assert!(store.get_settings(&ch).await.unwrap().is_none());

		let mut settings = ChannelSettings::default();
		settings.automod.custom_words = vec!["spam".to_string()];
		store.put_settings(&ch, &StoredSettings::from(&settings)).await.unwrap();
		settings.automod.enabled = true;
		store.put_settings(&ch, &StoredSettings::from(&settings)).await.unwrap();

		let loaded = merge_defaults(store.get_settings(&ch).await.unwrap());
		assert_eq!(loaded, settings);

		store.save_record(&record(&ch, "hello")).await.unwrap();
	}
}

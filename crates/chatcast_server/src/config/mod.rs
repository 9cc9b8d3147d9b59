#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use chatcast_domain::{Channel, ChannelId};
use chatcast_platform::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.chatcast/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chatcast").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub monitor: MonitorSettings,
	pub transport: TransportSettings,
	pub moderation: ModerationSettings,
	pub ledger: LedgerSettings,
	pub dispatch: DispatchSettings,
	pub persistence: PersistenceSettings,
	pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

/// Shared Monitor connection policy.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
	/// Delay added per already-existing monitor before its first connect.
	pub stagger: Duration,
	pub reconnect_base: Duration,
	pub reconnect_max: Duration,
	pub reconnect_max_attempts: u32,

	pub display_name: String,
	pub history_limit: u32,
	pub proxy: Option<String>,
	pub auth_cookie: Option<SecretString>,
}

impl Default for MonitorSettings {
	fn default() -> Self {
		Self {
			stagger: Duration::from_millis(2000),
			reconnect_base: Duration::from_millis(1000),
			reconnect_max: Duration::from_millis(120_000),
			reconnect_max_attempts: 5,
			display_name: "chatcast".to_string(),
			history_limit: 0,
			proxy: None,
			auth_cookie: None,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct TransportSettings {
	/// Chat WebSocket endpoint. Without it no upstream chat is ingested.
	pub ws_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModerationSettings {
	pub api_base_url: Option<String>,
	pub auth_token: Option<SecretString>,
	pub request_timeout: Duration,
	/// Newline-separated global slur list.
	pub slur_list_path: Option<PathBuf>,
	/// Newline-separated extra spam phrases, merged with the built-in list.
	pub spam_list_path: Option<PathBuf>,
}

impl Default for ModerationSettings {
	fn default() -> Self {
		Self {
			api_base_url: None,
			auth_token: None,
			request_timeout: Duration::from_secs(10),
			slur_list_path: None,
			spam_list_path: None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct LedgerSettings {
	pub rpc_url: Option<String>,
	pub poll_interval: Duration,
	pub donation_max_age: Duration,
	pub request_timeout: Duration,
}

impl Default for LedgerSettings {
	fn default() -> Self {
		Self {
			rpc_url: None,
			poll_interval: Duration::from_secs(10),
			donation_max_age: Duration::from_secs(300),
			request_timeout: Duration::from_secs(10),
		}
	}
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
	pub correlation_window: Duration,
	/// Currency label used in donation-prefixed records.
	pub unit_symbol: String,
}

impl Default for DispatchSettings {
	fn default() -> Self {
		Self {
			correlation_window: Duration::from_secs(300),
			unit_symbol: "SOL".to_string(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// Database URL (sqlite: or postgres:). In-memory store when unset.
	pub database_url: Option<String>,

	/// How often registered channels re-read their settings from the store.
	pub settings_refresh: Duration,

	/// Records kept per channel by the in-memory store.
	pub memory_record_limit: usize,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			database_url: None,
			settings_refresh: Duration::from_secs(5),
			memory_record_limit: crate::server::store::DEFAULT_MEMORY_RECORD_LIMIT,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	monitor: FileMonitorSettings,

	#[serde(default)]
	transport: FileTransportSettings,

	#[serde(default)]
	moderation: FileModerationSettings,

	#[serde(default)]
	ledger: FileLedgerSettings,

	#[serde(default)]
	dispatch: FileDispatchSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	channels: Vec<FileChannel>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileMonitorSettings {
	stagger_ms: Option<u64>,
	reconnect_base_ms: Option<u64>,
	reconnect_max_ms: Option<u64>,
	reconnect_max_attempts: Option<u32>,
	display_name: Option<String>,
	history_limit: Option<u32>,
	proxy: Option<String>,
	auth_cookie: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTransportSettings {
	ws_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileModerationSettings {
	api_base_url: Option<String>,
	auth_token: Option<String>,
	request_timeout_secs: Option<u64>,
	slur_list_path: Option<String>,
	spam_list_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLedgerSettings {
	rpc_url: Option<String>,
	poll_interval_secs: Option<u64>,
	donation_max_age_secs: Option<u64>,
	request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDispatchSettings {
	correlation_window_secs: Option<u64>,
	unit_symbol: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
	settings_refresh_secs: Option<u64>,
	memory_record_limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileChannel {
	id: String,
	room_token: String,
	payout_wallet: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let monitor_defaults = MonitorSettings::default();
		let mut monitor = MonitorSettings {
			stagger: file
				.monitor
				.stagger_ms
				.map(Duration::from_millis)
				.unwrap_or(monitor_defaults.stagger),
			reconnect_base: file
				.monitor
				.reconnect_base_ms
				.map(Duration::from_millis)
				.unwrap_or(monitor_defaults.reconnect_base),
			reconnect_max: file
				.monitor
				.reconnect_max_ms
				.map(Duration::from_millis)
				.unwrap_or(monitor_defaults.reconnect_max),
			reconnect_max_attempts: file
				.monitor
				.reconnect_max_attempts
				.unwrap_or(monitor_defaults.reconnect_max_attempts),
			display_name: non_empty(file.monitor.display_name).unwrap_or(monitor_defaults.display_name),
			history_limit: file.monitor.history_limit.unwrap_or(monitor_defaults.history_limit),
			proxy: non_empty(file.monitor.proxy),
			auth_cookie: non_empty(file.monitor.auth_cookie).map(SecretString::new),
		};
		swap_inverted_backoff(&mut monitor);

		let moderation_defaults = ModerationSettings::default();
		let moderation = ModerationSettings {
			api_base_url: non_empty(file.moderation.api_base_url),
			auth_token: non_empty(file.moderation.auth_token).map(SecretString::new),
			request_timeout: file
				.moderation
				.request_timeout_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(moderation_defaults.request_timeout),
			slur_list_path: non_empty(file.moderation.slur_list_path).map(PathBuf::from),
			spam_list_path: non_empty(file.moderation.spam_list_path).map(PathBuf::from),
		};

		let ledger_defaults = LedgerSettings::default();
		let ledger = LedgerSettings {
			rpc_url: non_empty(file.ledger.rpc_url),
			poll_interval: file
				.ledger
				.poll_interval_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(ledger_defaults.poll_interval),
			donation_max_age: file
				.ledger
				.donation_max_age_secs
				.map(Duration::from_secs)
				.unwrap_or(ledger_defaults.donation_max_age),
			request_timeout: file
				.ledger
				.request_timeout_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(ledger_defaults.request_timeout),
		};

		let dispatch_defaults = DispatchSettings::default();
		let dispatch = DispatchSettings {
			correlation_window: file
				.dispatch
				.correlation_window_secs
				.map(Duration::from_secs)
				.unwrap_or(dispatch_defaults.correlation_window),
			unit_symbol: non_empty(file.dispatch.unit_symbol).unwrap_or(dispatch_defaults.unit_symbol),
		};

		let persistence_defaults = PersistenceSettings::default();
		let persistence = PersistenceSettings {
			database_url: non_empty(file.persistence.database_url),
			settings_refresh: file
				.persistence
				.settings_refresh_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(persistence_defaults.settings_refresh),
			memory_record_limit: file
				.persistence
				.memory_record_limit
				.filter(|v| *v > 0)
				.unwrap_or(persistence_defaults.memory_record_limit),
		};

		let mut channels = Vec::with_capacity(file.channels.len());
		for ch in file.channels {
			let id = ChannelId::new(ch.id.clone()).with_context(|| format!("invalid channel id {:?}", ch.id))?;
			let room_token = ch.room_token.trim().to_string();
			if room_token.is_empty() {
				return Err(anyhow!("channel {id} has an empty room_token"));
			}
			let mut channel = Channel::new(id, room_token);
			if let Some(wallet) = ch.payout_wallet {
				channel = channel.with_payout_wallet(wallet.trim());
			}
			channels.push(channel);
		}

		Ok(Self {
			server: ServerSettings {
				metrics_bind: non_empty(file.server.metrics_bind),
				health_bind: non_empty(file.server.health_bind),
			},
			monitor,
			transport: TransportSettings {
				ws_url: non_empty(file.transport.ws_url),
			},
			moderation,
			ledger,
			dispatch,
			persistence,
			channels,
		})
	}
}

fn swap_inverted_backoff(monitor: &mut MonitorSettings) {
	if monitor.reconnect_base > monitor.reconnect_max {
		warn!(
			base_ms = monitor.reconnect_base.as_millis(),
			max_ms = monitor.reconnect_max.as_millis(),
			"monitor config: reconnect_base > reconnect_max; swapping"
		);
		std::mem::swap(&mut monitor.reconnect_base, &mut monitor.reconnect_max);
	}
}

pub fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn env_string(key: &str) -> Option<String> {
	std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_string("CHATCAST_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("CHATCAST_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = env_string("CHATCAST_MONITOR_STAGGER_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.monitor.stagger = Duration::from_millis(ms);
		info!(ms, "monitor config: stagger overridden by env");
	}

	if let Some(v) = env_string("CHATCAST_RECONNECT_BASE_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.monitor.reconnect_base = Duration::from_millis(ms);
		info!(ms, "monitor config: reconnect_base overridden by env");
	}

	if let Some(v) = env_string("CHATCAST_RECONNECT_MAX_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.monitor.reconnect_max = Duration::from_millis(ms);
		info!(ms, "monitor config: reconnect_max overridden by env");
	}

	if let Some(v) = env_string("CHATCAST_RECONNECT_MAX_ATTEMPTS")
		&& let Ok(attempts) = v.parse::<u32>()
	{
		cfg.monitor.reconnect_max_attempts = attempts;
		info!(attempts, "monitor config: reconnect_max_attempts overridden by env");
	}

	if let Some(v) = env_string("CHATCAST_AUTH_COOKIE") {
		cfg.monitor.auth_cookie = Some(SecretString::new(v));
		info!("monitor config: auth_cookie overridden by env");
	}

	if let Some(v) = env_string("CHATCAST_PROXY") {
		cfg.monitor.proxy = Some(v);
		info!("monitor config: proxy overridden by env");
	}

	if let Some(v) = env_string("CHATCAST_WS_URL") {
		cfg.transport.ws_url = Some(v);
		info!("transport config: ws_url overridden by env");
	}

	if let Some(v) = env_string("CHATCAST_MODERATION_API_BASE_URL") {
		cfg.moderation.api_base_url = Some(v);
		info!("moderation config: api_base_url overridden by env");
	}

	if let Some(v) = env_string("CHATCAST_MODERATION_AUTH_TOKEN") {
		cfg.moderation.auth_token = Some(SecretString::new(v));
		info!("moderation config: auth_token overridden by env");
	}

	if let Some(v) = env_string("CHATCAST_LEDGER_RPC_URL") {
		cfg.ledger.rpc_url = Some(v);
		info!("ledger config: rpc_url overridden by env");
	}

	if let Some(v) = env_string("CHATCAST_LEDGER_POLL_INTERVAL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
		&& secs > 0
	{
		cfg.ledger.poll_interval = Duration::from_secs(secs);
		info!(secs, "ledger config: poll_interval overridden by env");
	}

	if let Some(v) = env_string("CHATCAST_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = env_string("CHATCAST_SETTINGS_REFRESH_SECS")
		&& let Ok(secs) = v.parse::<u64>()
		&& secs > 0
	{
		cfg.persistence.settings_refresh = Duration::from_secs(secs);
		info!(secs, "persistence: settings_refresh overridden by env");
	}

	swap_inverted_backoff(&mut cfg.monitor);

	if cfg.transport.ws_url.is_none() {
		warn!("transport config: no ws_url configured; channels will not receive upstream chat");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse(s: &str) -> anyhow::Result<ServerConfig> {
		let file: FileConfig = toml::from_str(s)?;
		ServerConfig::from_file(file)
	}

	#[test]
	fn empty_file_yields_defaults() {
		let cfg = parse("").unwrap();
		assert_eq!(cfg.monitor.stagger, Duration::from_secs(2));
		assert_eq!(cfg.monitor.reconnect_base, Duration::from_secs(1));
		assert_eq!(cfg.monitor.reconnect_max, Duration::from_secs(120));
		assert_eq!(cfg.monitor.reconnect_max_attempts, 5);
		assert_eq!(cfg.moderation.request_timeout, Duration::from_secs(10));
		assert_eq!(cfg.dispatch.correlation_window, Duration::from_secs(300));
		assert_eq!(cfg.ledger.donation_max_age, Duration::from_secs(300));
		assert_eq!(cfg.ledger.request_timeout, Duration::from_secs(10));
		assert_eq!(cfg.persistence.settings_refresh, Duration::from_secs(5));
		assert_eq!(cfg.persistence.memory_record_limit, 1000);
		assert!(cfg.channels.is_empty());
	}

	#[test]
	fn parses_channels_and_sections() {
		let cfg = parse(
			r#"
			[monitor]
			stagger_ms = 500
			auth_cookie = "  "

			[dispatch]
			unit_symbol = "UNIT"

			[[channels]]
			id = "alpha"
			room_token = "room-a"
			payout_wallet = "Wallet111"

			[[channels]]
			id = "beta"
			room_token = "room-b"
			"#,
		)
		.unwrap();

		assert_eq!(cfg.monitor.stagger, Duration::from_millis(500));
		assert!(cfg.monitor.auth_cookie.is_none());
		assert_eq!(cfg.dispatch.unit_symbol, "UNIT");
		assert_eq!(cfg.channels.len(), 2);
		assert_eq!(cfg.channels[0].payout_wallet.as_deref(), Some("Wallet111"));
		assert!(cfg.channels[1].payout_wallet.is_none());
	}

	#[test]
	fn zero_timeouts_fall_back_to_defaults() {
		let cfg = parse(
			r#"
			[ledger]
			request_timeout_secs = 0

			[persistence]
			settings_refresh_secs = 0
			memory_record_limit = 0
			"#,
		)
		.unwrap();
		assert_eq!(cfg.ledger.request_timeout, Duration::from_secs(10));
		assert_eq!(cfg.persistence.settings_refresh, Duration::from_secs(5));
		assert_eq!(cfg.persistence.memory_record_limit, 1000);
	}

	#[test]
	fn inverted_backoff_is_swapped() {
		let cfg = parse(
			r#"
			[monitor]
			reconnect_base_ms = 9000
			reconnect_max_ms = 3000
			"#,
		)
		.unwrap();
		assert_eq!(cfg.monitor.reconnect_base, Duration::from_millis(3000));
		assert_eq!(cfg.monitor.reconnect_max, Duration::from_millis(9000));
	}

	#[test]
	fn rejects_channel_without_room() {
		let err = parse(
			r#"
			[[channels]]
			id = "alpha"
			room_token = " "
			"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("room_token"));
	}

	#[test]
	fn env_bool_parsing() {
		assert_eq!(parse_env_bool("Yes"), Some(true));
		assert_eq!(parse_env_bool("off"), Some(false));
		assert_eq!(parse_env_bool("maybe"), None);
	}
}

#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use chatcast_platform::{
	BanClient, DemoTransportFactory, HttpBanClient, JsonRpcLedgerClient, LedgerClient, SecretString, TransportFactory,
	WsTransportFactory,
};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::server::broadcast::{BroadcastHub, BroadcastHubConfig};
use crate::server::channels::{ChannelService, ChannelServiceDeps};
use crate::server::dispatch::{DispatchConfig, DispatchQueue};
use crate::server::donations::DonationWatcherConfig;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::moderation::ModerationEngine;
use crate::server::poll::{PollEngine, PollService};
use crate::server::registry::{MonitorRegistry, RegistryConfig};
use crate::server::settings::SettingsService;
use crate::server::store::{MemoryStore, SqlStore, Store};
use crate::server::terms::TermLists;

/// Dev-only synthetic chat transport enable flag.
const CHATCAST_ENABLE_DEMO_TRANSPORT_ENV: &str = "CHATCAST_ENABLE_DEMO_TRANSPORT";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chatcast_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.chatcast/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chatcast_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("chatcast_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn transport_factory(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn TransportFactory>> {
	let demo_enabled = cfg!(debug_assertions)
		&& std::env::var(CHATCAST_ENABLE_DEMO_TRANSPORT_ENV)
			.ok()
			.and_then(|v| crate::config::parse_env_bool(&v))
			.unwrap_or(false);

	if demo_enabled {
		info!(
			env = CHATCAST_ENABLE_DEMO_TRANSPORT_ENV,
			"starting dev-only demo transport (enabled by env)"
		);
		return Ok(Arc::new(DemoTransportFactory::new()));
	}

	let Some(ws_url) = cfg.transport.ws_url.as_deref() else {
		return Err(anyhow!("no chat transport configured (set transport.ws_url or CHATCAST_WS_URL)"));
	};
	let url = url::Url::parse(ws_url).with_context(|| format!("invalid transport.ws_url {ws_url:?}"))?;
	Ok(Arc::new(WsTransportFactory::new(url)))
}

async fn open_store(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn Store>> {
	match cfg.persistence.database_url.as_deref() {
		Some(url) => {
			let store = SqlStore::connect(url).await?;
			info!("persistence: sql store ready");
			Ok(Arc::new(store))
		}
		None => {
			info!("persistence: no database_url; settings and records are kept in memory");
			Ok(Arc::new(MemoryStore::with_record_limit(cfg.persistence.memory_record_limit)))
		}
	}
}

fn ban_client(cfg: &ServerConfig) -> Option<Arc<dyn BanClient>> {
	let base_url = cfg.moderation.api_base_url.clone()?;
	let token = cfg
		.moderation
		.auth_token
		.clone()
		.unwrap_or_else(|| SecretString::new(String::new()));
	if token.is_empty() {
		warn!("moderation: api_base_url set without auth_token; bans will be rejected as unauthorized");
	}
	Some(Arc::new(
		HttpBanClient::new(base_url, token).with_timeout(cfg.moderation.request_timeout),
	))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(p) => p,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(
		path = %config_path.display(),
		channels = server_cfg.channels.len(),
		"loaded server config (toml + env overrides)"
	);

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let factory = transport_factory(&server_cfg)?;
	let registry = Arc::new(MonitorRegistry::new(RegistryConfig::from(&server_cfg.monitor), factory));

	let health_state = HealthState::new(Arc::clone(&registry));
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let store = open_store(&server_cfg).await?;
	let terms = Arc::new(TermLists::load(
		server_cfg.moderation.slur_list_path.as_deref(),
		server_cfg.moderation.spam_list_path.as_deref(),
	)?);

	let hub = BroadcastHub::new(BroadcastHubConfig::default());
	let settings = Arc::new(SettingsService::new(Arc::clone(&store)));

	let dispatch = Arc::new(DispatchQueue::new(
		DispatchConfig::from(&server_cfg.dispatch),
		Arc::clone(&settings),
		Arc::clone(&terms),
		Arc::clone(&store),
		hub.clone(),
	));
	let moderation = Arc::new(ModerationEngine::new(
		ban_client(&server_cfg),
		Arc::clone(&settings),
		terms,
		hub.clone(),
	));
	let polls = Arc::new(PollService::new(PollEngine::new(hub.clone()), Arc::clone(&settings)));

	let ledger: Option<Arc<dyn LedgerClient>> = server_cfg.ledger.rpc_url.clone().map(|url| {
		Arc::new(JsonRpcLedgerClient::new(url).with_timeout(server_cfg.ledger.request_timeout)) as Arc<dyn LedgerClient>
	});

	let channels = ChannelService::new(ChannelServiceDeps {
		registry: Arc::clone(&registry),
		settings,
		dispatch,
		moderation,
		polls,
		hub,
		ledger,
		watcher: DonationWatcherConfig::from(&server_cfg.ledger),
		settings_refresh: server_cfg.persistence.settings_refresh,
	});

	for channel in server_cfg.channels.iter().cloned() {
		let id = channel.id.clone();
		if let Err(e) = channels.register(channel).await {
			warn!(channel = %id, error = %e, "failed to register channel");
		}
	}

	health_state.mark_ready();
	info!(channels = channels.registered().await.len(), "chatcast_server: running");

	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	info!("chatcast_server: shutting down");
	health_state.mark_not_ready();

	channels.shutdown().await;
	registry.shutdown_all().await;

	Ok(())
}

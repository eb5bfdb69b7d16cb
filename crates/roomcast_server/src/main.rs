#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use roomcast_server::config;
use roomcast_server::server::connection::ConnectionSettings;
use roomcast_server::server::health::HealthState;
use roomcast_server::server::room_hub::{RoomHub, RoomHubConfig};
use roomcast_server::server::router::{RouterConfig, spawn_change_router};
use roomcast_server::server::state::SubscriptionState;
use roomcast_server::server::store::Store;
use roomcast_server::server::{AppState, build_router};
use tokio::sync::RwLock;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

struct Args {
	bind: Option<SocketAddr>,
	config: Option<PathBuf>,
}

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: roomcast_server [--bind host:port] [--config path]\n\
\n\
Options:\n\
\t--bind    Listen address (default: 127.0.0.1:8203, or the config value)\n\
\t--config  Config file path (default: ~/.roomcast/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Args {
	let mut args = Args {
		bind: None,
		config: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				match v.trim().parse::<SocketAddr>() {
					Ok(addr) => args.bind = Some(addr),
					Err(e) => {
						eprintln!("invalid --bind address {v:?} (expected host:port): {e}");
						usage_and_exit();
					}
				}
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,roomcast_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("roomcast_server");
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let mut cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(bind) = args.bind {
		cfg.bind = bind;
	}

	init_metrics(cfg.server.metrics_bind.as_deref());

	let Some(hmac_secret) = cfg.auth.hmac_secret.clone() else {
		anyhow::bail!("auth.hmac_secret must be configured (config file or ROOMCAST_AUTH_HMAC_SECRET)");
	};

	let store = Store::connect(&cfg.persistence.database_url, cfg.limits.max_message_chars)
		.await
		.context("open persistence gateway")?;

	let hub = RoomHub::new(RoomHubConfig {
		subscriber_queue_capacity: cfg.server.subscriber_queue_capacity,
		debug_logs: false,
	});
	let subs = Arc::new(RwLock::new(SubscriptionState::default()));

	spawn_change_router(&store, hub.clone(), Arc::clone(&subs), RouterConfig::default());

	let health = HealthState::new();
	let state = AppState {
		store,
		hub,
		subs,
		health: health.clone(),
		settings: ConnectionSettings {
			max_frame_bytes: cfg.server.max_frame_bytes,
			auth_hmac_secret: hmac_secret,
			token_ttl: cfg.auth.token_ttl,
		},
	};

	let app = build_router(state);

	let listener = tokio::net::TcpListener::bind(cfg.bind)
		.await
		.with_context(|| format!("bind {}", cfg.bind))?;
	let addr = listener.local_addr().context("local_addr")?;

	health.mark_ready();
	info!(%addr, "roomcast server listening");

	axum::serve(listener, app).await.context("serve")?;

	Ok(())
}

#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use parley_store::{MemoryStore, MySqlStore, Storage};
use parley_util::endpoint::TcpEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::bus::{Bus, NullBus, RedisBus};
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::registry::ConnectionRegistry;
use crate::server::service::{ChatService, spawn_bus_bridge};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--bind tcp://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: tcp://127.0.0.1:6000)\n\
\t         Format: tcp://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "tcp://127.0.0.1:6000".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected tcp://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = TcpEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let addr: SocketAddr = bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	addr
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("parley_server");
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

	let bind_addr = parse_args();

	let config_path = config::default_config_path()?;
	let cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let store: Arc<dyn Storage> = match cfg.database.url.as_deref() {
		Some(url) => Arc::new(MySqlStore::connect(url).await.context("connect database")?),
		None => {
			warn!("no database.url configured; using in-memory store (dev only, state is lost on restart)");
			Arc::new(MemoryStore::new())
		}
	};

	// A bus failure at startup is not fatal: cross-instance delivery is
	// disabled and purely-local chat keeps working.
	let (bus, bus_rx): (Arc<dyn Bus>, _) = if cfg.bus.enabled {
		match RedisBus::connect(&cfg.bus.url).await {
			Ok((bus, rx)) => {
				info!(url = %cfg.bus.url, "connected to presence bus");
				(bus, Some(rx))
			}
			Err(e) => {
				warn!(error = %e, "presence bus unavailable; cross-instance delivery disabled");
				(Arc::new(NullBus), None)
			}
		}
	} else {
		info!("presence bus disabled by config");
		(Arc::new(NullBus), None)
	};

	let registry = Arc::new(ConnectionRegistry::new());
	let service = Arc::new(ChatService::new(registry, store, bus));

	service.reset_on_startup().await;

	if let Some(rx) = bus_rx {
		spawn_bus_bridge(Arc::clone(&service), rx);
	}

	let listener = TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind {bind_addr}"))?;
	info!(bind = %bind_addr, "parley_server: listening");

	health_state.mark_ready();

	let conn_settings = ConnectionSettings {
		max_frame_size: cfg.server.max_frame_size,
		outbound_queue_capacity: cfg.server.outbound_queue_capacity,
	};

	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, remote) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!(error = %e, "accept failed");
				continue;
			}
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("parley_server_connections_total").increment(1);
		info!(conn_id, remote = %remote, "accepted connection");

		let service = Arc::clone(&service);
		let conn_settings = conn_settings.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_connection(conn_id, stream, service, conn_settings).await {
				warn!(conn_id, error = %e, "connection handler exited with error");
			}
		});
	}
}

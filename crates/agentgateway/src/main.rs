use std::path::PathBuf;
use std::sync::Arc;

use agentgateway::client::Client;
use agentgateway::config::ConfigHandle;
use agentgateway::health::HealthRegistry;
use agentgateway::llm::Registry;
use agentgateway::proxy::{AppState, build_router};
use agentgateway::telemetry::{self, RingBufferSink};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "agentgateway", about = "LLM chat-completion reverse proxy")]
struct Args {
	/// Path to the YAML config file. Watched for changes and hot-reloaded.
	#[arg(short, long, default_value = "config.yaml")]
	config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	telemetry::init();
	let args = Args::parse();

	let config_handle = ConfigHandle::watching(&args.config)?;
	let listen_addr = config_handle.current().listen_addr.clone();

	// Leaked once at startup: adapters never change for the life of the
	// process, and a streaming response body must be `'static`.
	let adapters: &'static Registry = Box::leak(Box::new(Registry::new()));

	let state = Arc::new(AppState {
		config: config_handle,
		health: HealthRegistry::new(),
		client: Client::new(),
		adapters,
		body_log: Arc::new(RingBufferSink::default()),
	});

	let app = build_router(state);

	let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
	tracing::info!(addr = %listen_addr, "listening");

	axum::serve(listener, app)
		.with_graceful_shutdown(shutdown_signal())
		.await?;

	Ok(())
}

async fn shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
	tracing::info!("shutdown signal received");
}

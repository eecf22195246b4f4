use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use quire_core::{
	config::{default_data_dir, SyncConfig},
	infra::{logging::init_tracing, sync::SystemTimeSource},
	Core,
};
use tracing::{info, warn};

mod api;

/// Quire sync server
#[derive(Debug, Parser)]
#[command(name = "quire-server", version)]
struct Args {
	/// Data directory (config, SQLite files, logs)
	#[arg(long)]
	data_dir: Option<PathBuf>,

	/// Address to listen on, overriding the config
	#[arg(long)]
	bind: Option<String>,

	/// Provision these tenants before serving
	#[arg(long = "provision", value_name = "TENANT")]
	provision: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let data_dir = match args.data_dir {
		Some(dir) => dir,
		None => default_data_dir()?,
	};

	let mut config = SyncConfig::load_or_create(&data_dir)?;
	if let Some(bind) = args.bind {
		config.server.bind_addr = bind;
	}

	init_tracing(&config)?;

	let bind_addr = config.server.bind_addr.clone();
	let core = Arc::new(Core::from_config(config, Arc::new(SystemTimeSource)).await?);

	for tenant in &args.provision {
		let namespace = core.provision_tenant(tenant).await?;
		info!(tenant, %namespace, "Tenant ready");
	}

	let app = api::router(core);

	let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
	info!("Listening on http://{}", listener.local_addr()?);

	axum::serve(listener, app)
		.with_graceful_shutdown(shutdown_signal())
		.await?;

	info!("Server stopped");

	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			warn!("Failed to listen for Ctrl+C: {}", e);
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut signal) => {
				signal.recv().await;
			}
			Err(e) => {
				warn!("Failed to listen for SIGTERM: {}", e);
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}

	info!("Shutdown signal received");
}

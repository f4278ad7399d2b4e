//! Avalink HTTP server
//!
//! Exposes the upload intake and the connect operation over HTTP and wires
//! them to the session lifecycle core.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use av_core::{Core, CoreConfig, SandboxMessenger};

mod routes;

#[derive(Debug, Parser)]
#[command(name = "av-server", about = "Avalink pairing and avatar provisioning server")]
struct Args {
	/// Port to listen on
	#[arg(long, env = "PORT", default_value_t = 3000)]
	port: u16,

	/// Root directory for per-session auth state stores
	#[arg(long, env = "AVALINK_SESSION_ROOT")]
	session_root: Option<PathBuf>,

	/// Directory uploaded images are written to
	#[arg(long, env = "AVALINK_UPLOAD_DIR")]
	upload_dir: Option<PathBuf>,

	/// Settling delay before pairing codes are requested, in milliseconds
	#[arg(long, env = "AVALINK_PAIRING_DELAY_MS")]
	pairing_delay_ms: Option<u64>,

	/// Grace period before session storage is deleted, in milliseconds
	#[arg(long, env = "AVALINK_CLEANUP_GRACE_MS")]
	cleanup_grace_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();

	let args = Args::parse();

	let mut config = CoreConfig::default();
	if let Some(root) = args.session_root {
		config.session_root = root;
	}
	if let Some(dir) = args.upload_dir {
		config.upload_dir = dir;
	}
	if let Some(ms) = args.pairing_delay_ms {
		config.pairing_delay_ms = ms;
	}
	if let Some(ms) = args.cleanup_grace_ms {
		config.cleanup_grace_ms = ms;
	}

	// The real wire transport is deployment-provided; the bundled sandbox
	// keeps local development self-contained.
	let messenger = Arc::new(SandboxMessenger::default());
	let core = Arc::new(Core::new(config, messenger).await?);

	let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
	let listener = tokio::net::TcpListener::bind(addr).await?;
	tracing::info!(%addr, "avalink server listening");

	axum::serve(listener, routes::router(core)).await?;

	Ok(())
}

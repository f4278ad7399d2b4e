//! Avalink core
//!
//! Provisions short-lived login sessions against a real-time messaging
//! service: each session requests a one-time pairing code for a phone
//! number and, once the connection authenticates, replaces the account's
//! profile picture with a pre-uploaded image before logging out and
//! deleting its own persisted state.

pub mod config;
pub mod infra;
pub mod service;

use std::sync::Arc;

pub use config::{BrowserIdentity, CoreConfig};
pub use service::messenger::{Messenger, SandboxBehavior, SandboxMessenger};
pub use service::session::{
	PairingOutcome, Session, SessionError, SessionManager, SessionState,
};

/// Owns configuration and the session manager for one running instance.
pub struct Core {
	pub config: CoreConfig,
	pub sessions: SessionManager,
}

impl Core {
	/// Create a core instance, making sure the storage roots exist.
	pub async fn new(
		config: CoreConfig,
		messenger: Arc<dyn Messenger>,
	) -> std::io::Result<Self> {
		tokio::fs::create_dir_all(&config.session_root).await?;
		tokio::fs::create_dir_all(&config.upload_dir).await?;

		Ok(Self {
			sessions: SessionManager::new(config.clone(), messenger),
			config,
		})
	}
}

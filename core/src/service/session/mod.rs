//! Ephemeral login session lifecycle
//!
//! One session is provisioned per incoming connect request: it owns a fresh
//! auth state store, opens a transport connection, and requests a pairing
//! code for the caller. Once the connection authenticates it replaces the
//! account's profile picture, logs out, and removes its own storage.
//!
//! Sessions never share mutable state with each other. Each lives in the
//! manager's registry until the cleanup scheduler retires it. There is no
//! overall session timeout: a session whose transport never emits an open or
//! a fatal close stays resident indefinitely.

pub mod cleanup;
pub mod machine;
pub mod pairing;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, RwLock};
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::infra::{AuthStateStore, AuthStoreError};
use crate::service::messenger::{ConnectOptions, Messenger, MessengerError};

pub use pairing::format_pairing_code;

#[derive(Debug, Error)]
pub enum SessionError {
	#[error("invalid input: {0}")]
	InvalidInput(&'static str),

	#[error("pairing request refused: {0}")]
	PairingRefused(String),

	#[error("transport failure: {0}")]
	Transport(#[from] MessengerError),

	#[error("auth state store failure: {0}")]
	AuthStore(#[from] AuthStoreError),

	#[error("session ended before a pairing outcome was delivered")]
	SessionClosed,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Connection machine states.
///
/// `Terminated` is the success terminal, `Failed` the alternate terminal;
/// both schedule cleanup of the session's auth state store.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
pub enum SessionState {
	Init,
	Handshaking,
	Authenticated,
	Finalizing,
	Terminated,
	Failed,
}

/// Outcome delivered exactly once to the caller that provisioned a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
	/// Formatted pairing code to enter on the phone
	Code(String),

	/// The loaded credentials already represent a logged-in account; no
	/// pairing request was issued
	AlreadyRegistered,
}

/// Registry entry for one live session.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
	pub id: Uuid,
	pub phone_number: String,
	pub state: SessionState,
	pub storage_dir: PathBuf,
	pub registered: bool,
	pub pending_pairing_request: bool,
	pub cleanup_scheduled: bool,
	pub avatar_applied: bool,
	pub created_at: DateTime<Utc>,
}

pub(crate) type SessionMap = Arc<RwLock<HashMap<Uuid, Session>>>;

/// Session lifecycle controller.
///
/// Owns the session registry and composes the pairing coordinator, the
/// connection state machine, and the cleanup scheduler per request.
pub struct SessionManager {
	config: CoreConfig,
	messenger: Arc<dyn Messenger>,
	sessions: SessionMap,
}

impl SessionManager {
	pub fn new(config: CoreConfig, messenger: Arc<dyn Messenger>) -> Self {
		Self {
			config,
			messenger,
			sessions: Arc::new(RwLock::new(HashMap::new())),
		}
	}

	/// Provision a session for `phone_number` and return its pairing outcome.
	///
	/// Resolves after the pairing settling delay on the success path, or
	/// immediately on the fast-fail paths (invalid input, already-registered
	/// credentials, provider refusal). The connection state machine keeps
	/// running after this returns; post-authentication failures are only
	/// observable through logs.
	pub async fn connect(
		&self,
		phone_number: &str,
		image_filename: &str,
	) -> Result<PairingOutcome> {
		let digits = sanitize_phone_number(phone_number);
		if digits.is_empty() {
			return Err(SessionError::InvalidInput(
				"phone number must contain digits",
			));
		}

		// The filename is caller-supplied; only its terminal component is
		// ever joined onto the upload directory.
		let file_name = std::path::Path::new(image_filename.trim())
			.file_name()
			.and_then(|n| n.to_str())
			.ok_or(SessionError::InvalidInput("image filename is required"))?;
		let image_path = self.config.upload_dir.join(file_name);

		let session_id = Uuid::new_v4();
		let created_at = Utc::now();
		let storage_dir = self.config.session_root.join(format!(
			"{}-{}-{}",
			self.config.session_dir_prefix,
			created_at.timestamp_millis(),
			session_id.simple()
		));

		let store = AuthStateStore::load(storage_dir.clone()).await?;
		let registered = store.registered();

		let (handle, events) = self
			.messenger
			.open_session(
				store.credentials().clone(),
				ConnectOptions {
					browser: self.config.browser.clone(),
				},
			)
			.await?;

		self.sessions.write().await.insert(
			session_id,
			Session {
				id: session_id,
				phone_number: digits.clone(),
				state: SessionState::Init,
				storage_dir,
				registered,
				pending_pairing_request: false,
				cleanup_scheduled: false,
				avatar_applied: false,
				created_at,
			},
		);

		tracing::info!(%session_id, registered, "session provisioned");

		let (outcome_tx, outcome_rx) = oneshot::channel();

		machine::spawn(machine::MachineContext {
			session_id,
			sessions: self.sessions.clone(),
			store,
			handle: handle.clone(),
			events,
			image_path,
			avatar_edge: self.config.avatar_edge,
			cleanup_grace: self.config.cleanup_grace(),
		});

		pairing::spawn(pairing::CoordinatorContext {
			session_id,
			sessions: self.sessions.clone(),
			handle,
			phone_number: digits,
			delay: self.config.pairing_delay(),
			cleanup_grace: self.config.cleanup_grace(),
			registered,
			outcome_tx,
		});

		outcome_rx.await.map_err(|_| SessionError::SessionClosed)?
	}

	/// Snapshot of every session still in the registry.
	pub async fn get_active_sessions(&self) -> Vec<Session> {
		self.sessions.read().await.values().cloned().collect()
	}

	pub async fn session_state(&self, session_id: Uuid) -> Option<SessionState> {
		self.sessions
			.read()
			.await
			.get(&session_id)
			.map(|s| s.state)
	}
}

/// Strip everything but digits; the transport only accepts bare numbers.
fn sanitize_phone_number(raw: &str) -> String {
	raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

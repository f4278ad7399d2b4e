//! Messaging transport capability
//!
//! The real-time messaging protocol (framing, encryption, multi-device
//! crypto) lives behind this boundary. The session core only depends on the
//! small surface below: open a session from persisted credentials, watch its
//! connection events, request a pairing code, issue protocol queries, and
//! log out.

pub mod sandbox;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::BrowserIdentity;
use crate::infra::Credentials;

pub use sandbox::{SandboxBehavior, SandboxMessenger};

#[derive(Debug, Error)]
pub enum MessengerError {
	#[error("failed to open transport session: {0}")]
	Connect(String),

	#[error("pairing request refused: {0}")]
	PairingRefused(String),

	#[error("protocol query rejected: {0}")]
	QueryRejected(String),

	#[error("transport session already closed")]
	SessionClosed,
}

pub type Result<T> = std::result::Result<T, MessengerError>;

/// Reason codes attached to a connection close.
///
/// Mirrors the status codes the messaging service sends on stream errors;
/// anything we have no dedicated handling for arrives as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
	/// The transport restarts its own socket and will re-emit events.
	RestartRequired,
	LoggedOut,
	BadSession,
	ConnectionLost,
	ConnectionReplaced,
	Other(u16),
}

impl DisconnectReason {
	/// Transient conditions recover inside the transport; the session must
	/// stay alive and keep watching the event stream.
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::RestartRequired)
	}
}

/// Asynchronous events emitted by an open transport session.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
	/// The connection reached the authenticated state
	Open,

	/// The connection closed; `reason` decides whether the session fails
	Close { reason: DisconnectReason },

	/// The transport mutated the credential state and expects it persisted
	CredentialsUpdate(Credentials),
}

/// Protocol queries issued over an authenticated session.
#[derive(Debug, Clone)]
pub enum ProtocolQuery {
	/// Replace the account's own profile picture with a pre-encoded JPEG
	SetProfilePicture { image: Bytes },
}

/// Options supplied when opening a transport session.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
	pub browser: BrowserIdentity,
}

/// Factory for transport sessions.
#[async_trait]
pub trait Messenger: Send + Sync + 'static {
	/// Open a session from persisted credentials. Returns the command handle
	/// and the event stream for this one connection.
	async fn open_session(
		&self,
		credentials: Credentials,
		options: ConnectOptions,
	) -> Result<(
		std::sync::Arc<dyn MessengerSession>,
		mpsc::UnboundedReceiver<ConnectionEvent>,
	)>;
}

/// Command surface of one open transport session.
#[async_trait]
pub trait MessengerSession: Send + Sync {
	/// Request a one-time pairing code for `phone_number` (digits only).
	async fn request_pairing_code(&self, phone_number: &str) -> Result<String>;

	/// Issue a protocol query on the authenticated connection.
	async fn query(&self, query: ProtocolQuery) -> Result<()>;

	/// Log the account out and drop the connection.
	async fn logout(&self) -> Result<()>;
}

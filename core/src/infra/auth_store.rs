//! Per-session durable credential storage
//!
//! Every login session owns one store directory, created when the session is
//! provisioned and deleted by the cleanup scheduler once the session reaches
//! a terminal state. The directory is never shared between sessions; the
//! session manager embeds a uniqueness token in the path so repeated requests
//! for the same phone number cannot collide.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

const CREDS_FILE: &str = "creds.json";

#[derive(Debug, Error)]
pub enum AuthStoreError {
	#[error("auth store io: {0}")]
	Io(#[from] std::io::Error),

	#[error("auth store serialization: {0}")]
	Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AuthStoreError>;

/// Credential state for one messaging account login.
///
/// Starts empty for a fresh session and is filled in incrementally as the
/// transport signals credential mutations during the handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
	/// Account identity assigned by the service once the login completes
	pub account_id: Option<String>,

	/// Whether these credentials already represent a logged-in account
	#[serde(default)]
	pub registered: bool,

	/// Opaque key material the transport asks us to retain between writes
	#[serde(default)]
	pub key_material: BTreeMap<String, String>,
}

/// File-backed auth state for a single session.
///
/// `persist` must complete a durable write before returning; the transport
/// relies on the previous credential snapshot surviving a crash.
#[derive(Debug)]
pub struct AuthStateStore {
	dir: PathBuf,
	creds: Credentials,
}

impl AuthStateStore {
	/// Open the store at `dir`, creating the directory if needed and loading
	/// any credentials a previous process left behind.
	pub async fn load(dir: PathBuf) -> Result<Self> {
		tokio::fs::create_dir_all(&dir).await?;

		let creds_path = dir.join(CREDS_FILE);
		let creds = match tokio::fs::read(&creds_path).await {
			Ok(bytes) => serde_json::from_slice(&bytes)?,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Credentials::default(),
			Err(e) => return Err(e.into()),
		};

		Ok(Self { dir, creds })
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	pub fn credentials(&self) -> &Credentials {
		&self.creds
	}

	pub fn registered(&self) -> bool {
		self.creds.registered
	}

	/// Replace the in-memory credential snapshot. Callers follow up with
	/// [`persist`](Self::persist) to make the mutation durable.
	pub fn apply(&mut self, creds: Credentials) {
		self.creds = creds;
	}

	/// Durably write the current credentials: temp file, fsync, then rename
	/// over the live copy so a crash never leaves a torn snapshot.
	pub async fn persist(&self) -> Result<()> {
		let payload = serde_json::to_vec_pretty(&self.creds)?;

		let tmp_path = self.dir.join(format!("{CREDS_FILE}.tmp"));
		let mut tmp = tokio::fs::File::create(&tmp_path).await?;
		tmp.write_all(&payload).await?;
		tmp.sync_all().await?;
		drop(tmp);

		tokio::fs::rename(&tmp_path, self.dir.join(CREDS_FILE)).await?;

		tracing::debug!(dir = %self.dir.display(), "persisted session credentials");
		Ok(())
	}
}

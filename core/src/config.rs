//! Core configuration

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Browser identity advertised to the messaging service during the handshake.
///
/// The service shows this tuple to the user on their phone when they enter a
/// pairing code, so it is deployment branding rather than behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserIdentity {
	pub name: String,
	pub client: String,
	pub version: String,
}

impl Default for BrowserIdentity {
	fn default() -> Self {
		Self {
			name: "Avalink".to_string(),
			client: "Chrome".to_string(),
			version: "1.0".to_string(),
		}
	}
}

/// Configuration for the session lifecycle core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
	/// Root directory under which per-session auth state stores are created
	#[serde(default = "default_session_root")]
	pub session_root: PathBuf,

	/// Directory the upload intake writes images to
	#[serde(default = "default_upload_dir")]
	pub upload_dir: PathBuf,

	/// Settling delay before the one-shot pairing code request is issued.
	/// The transport needs time after connect before it accepts the request.
	#[serde(default = "default_pairing_delay_ms")]
	pub pairing_delay_ms: u64,

	/// Grace period between a session reaching a terminal state and its auth
	/// state store being deleted, so in-flight credential writes settle
	#[serde(default = "default_cleanup_grace_ms")]
	pub cleanup_grace_ms: u64,

	/// Edge length of the square profile picture canvas
	#[serde(default = "default_avatar_edge")]
	pub avatar_edge: u32,

	/// Prefix for per-session storage directory names
	#[serde(default = "default_session_dir_prefix")]
	pub session_dir_prefix: String,

	/// Browser identity presented during login
	#[serde(default)]
	pub browser: BrowserIdentity,
}

impl Default for CoreConfig {
	fn default() -> Self {
		Self {
			session_root: default_session_root(),
			upload_dir: default_upload_dir(),
			pairing_delay_ms: default_pairing_delay_ms(),
			cleanup_grace_ms: default_cleanup_grace_ms(),
			avatar_edge: default_avatar_edge(),
			session_dir_prefix: default_session_dir_prefix(),
			browser: BrowserIdentity::default(),
		}
	}
}

impl CoreConfig {
	pub fn pairing_delay(&self) -> Duration {
		Duration::from_millis(self.pairing_delay_ms)
	}

	pub fn cleanup_grace(&self) -> Duration {
		Duration::from_millis(self.cleanup_grace_ms)
	}
}

fn default_session_root() -> PathBuf {
	std::env::temp_dir().join("avalink").join("sessions")
}

fn default_upload_dir() -> PathBuf {
	std::env::temp_dir().join("avalink").join("uploads")
}

fn default_pairing_delay_ms() -> u64 {
	3000
}

fn default_cleanup_grace_ms() -> u64 {
	2000
}

fn default_avatar_edge() -> u32 {
	640
}

fn default_session_dir_prefix() -> String {
	"session".to_string()
}

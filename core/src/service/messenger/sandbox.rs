//! Simulated messaging transport
//!
//! Stands in for the real protocol stack during local development and in the
//! integration tests. The handshake choreography matches the real service:
//! an unregistered session stays silent until a pairing code is requested,
//! then reports a credential mutation followed by the open event, as if the
//! user had entered the code on their phone. Scripted close reasons and
//! pairing refusals let tests drive the failure paths.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, Notify};

use super::{
	ConnectOptions, ConnectionEvent, DisconnectReason, Messenger, MessengerError,
	MessengerSession, ProtocolQuery, Result,
};
use crate::infra::Credentials;

/// Scripted behavior for a sandbox transport.
#[derive(Debug, Clone)]
pub struct SandboxBehavior {
	/// Delay before the first connection event is emitted
	pub connect_latency: Duration,

	/// Delay between a successful pairing request and the open event
	pub login_latency: Duration,

	/// Emit this close reason before anything else
	pub close_before_open: Option<DisconnectReason>,

	/// Whether the handshake proceeds after a scripted close
	pub complete_handshake: bool,

	/// Refuse pairing code requests
	pub refuse_pairing: bool,
}

impl Default for SandboxBehavior {
	fn default() -> Self {
		Self {
			connect_latency: Duration::from_millis(50),
			login_latency: Duration::from_millis(50),
			close_before_open: None,
			complete_handshake: true,
			refuse_pairing: false,
		}
	}
}

/// Call counters shared by every session a [`SandboxMessenger`] opens.
#[derive(Debug, Default)]
pub struct SandboxCounters {
	pairing_requests: AtomicUsize,
	profile_updates: AtomicUsize,
	logouts: AtomicUsize,
}

impl SandboxCounters {
	pub fn pairing_requests(&self) -> usize {
		self.pairing_requests.load(Ordering::SeqCst)
	}

	pub fn profile_updates(&self) -> usize {
		self.profile_updates.load(Ordering::SeqCst)
	}

	pub fn logouts(&self) -> usize {
		self.logouts.load(Ordering::SeqCst)
	}
}

/// In-process transport factory with scripted behavior.
pub struct SandboxMessenger {
	behavior: SandboxBehavior,
	counters: Arc<SandboxCounters>,
}

impl SandboxMessenger {
	pub fn new(behavior: SandboxBehavior) -> Self {
		Self {
			behavior,
			counters: Arc::new(SandboxCounters::default()),
		}
	}

	pub fn counters(&self) -> Arc<SandboxCounters> {
		self.counters.clone()
	}
}

impl Default for SandboxMessenger {
	fn default() -> Self {
		Self::new(SandboxBehavior::default())
	}
}

#[async_trait]
impl Messenger for SandboxMessenger {
	async fn open_session(
		&self,
		credentials: Credentials,
		_options: ConnectOptions,
	) -> Result<(
		Arc<dyn MessengerSession>,
		mpsc::UnboundedReceiver<ConnectionEvent>,
	)> {
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		let paired = Arc::new(Notify::new());
		let paired_number = Arc::new(Mutex::new(None::<String>));

		let session = Arc::new(SandboxSession {
			behavior: self.behavior.clone(),
			counters: self.counters.clone(),
			paired: paired.clone(),
			paired_number: paired_number.clone(),
		});

		let behavior = self.behavior.clone();
		tokio::spawn(async move {
			tokio::time::sleep(behavior.connect_latency).await;

			if let Some(reason) = behavior.close_before_open {
				if events_tx.send(ConnectionEvent::Close { reason }).is_err() {
					return;
				}
				if !behavior.complete_handshake {
					return;
				}
			}

			let mut creds = credentials;
			if !creds.registered {
				// A fresh login only opens after the user enters the pairing
				// code on their phone.
				paired.notified().await;
				tokio::time::sleep(behavior.login_latency).await;

				creds.registered = true;
				if creds.account_id.is_none() {
					let number = paired_number.lock().expect("paired number lock");
					creds.account_id = number
						.as_deref()
						.map(|n| format!("{n}@sandbox"));
				}
			}

			if events_tx
				.send(ConnectionEvent::CredentialsUpdate(creds))
				.is_err()
			{
				return;
			}
			let _ = events_tx.send(ConnectionEvent::Open);
		});

		Ok((session, events_rx))
	}
}

struct SandboxSession {
	behavior: SandboxBehavior,
	counters: Arc<SandboxCounters>,
	paired: Arc<Notify>,
	paired_number: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl MessengerSession for SandboxSession {
	async fn request_pairing_code(&self, phone_number: &str) -> Result<String> {
		self.counters.pairing_requests.fetch_add(1, Ordering::SeqCst);

		if self.behavior.refuse_pairing {
			return Err(MessengerError::PairingRefused(
				"sandbox transport configured to refuse pairing".to_string(),
			));
		}

		{
			let mut number = self.paired_number.lock().expect("paired number lock");
			*number = Some(phone_number.to_string());
		}
		self.paired.notify_one();

		Ok(generate_code())
	}

	async fn query(&self, query: ProtocolQuery) -> Result<()> {
		match query {
			ProtocolQuery::SetProfilePicture { image } => {
				if image.is_empty() {
					return Err(MessengerError::QueryRejected(
						"empty profile picture payload".to_string(),
					));
				}
				self.counters.profile_updates.fetch_add(1, Ordering::SeqCst);
				Ok(())
			}
		}
	}

	async fn logout(&self) -> Result<()> {
		self.counters.logouts.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}

// Alphabet without the lookalike characters the real service also avoids.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 8;

fn generate_code() -> String {
	let mut rng = rand::thread_rng();
	(0..CODE_LEN)
		.map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
		.collect()
}

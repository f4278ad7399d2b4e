//! Connection state machine
//!
//! One task per session consumes the transport's event stream and drives the
//! session forward: credential mutations are persisted as they arrive, the
//! first open event triggers the profile picture update followed by logout
//! and cleanup, and a non-transient close fails the session. Once a terminal
//! state is reached the task exits, so later events are ignored rather than
//! re-processed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::{cleanup, SessionMap, SessionState};
use crate::infra::AuthStateStore;
use crate::service::media;
use crate::service::messenger::{ConnectionEvent, MessengerSession, ProtocolQuery};

pub(crate) struct MachineContext {
	pub session_id: Uuid,
	pub sessions: SessionMap,
	pub store: AuthStateStore,
	pub handle: Arc<dyn MessengerSession>,
	pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
	pub image_path: PathBuf,
	pub avatar_edge: u32,
	pub cleanup_grace: Duration,
}

pub(crate) fn spawn(ctx: MachineContext) {
	tokio::spawn(run(ctx));
}

pub(crate) async fn run(mut ctx: MachineContext) {
	set_state(&ctx.sessions, ctx.session_id, SessionState::Handshaking).await;

	while let Some(event) = ctx.events.recv().await {
		match event {
			ConnectionEvent::CredentialsUpdate(creds) => {
				let registered = creds.registered;
				ctx.store.apply(creds);
				if let Err(e) = ctx.store.persist().await {
					tracing::warn!(
						session_id = %ctx.session_id,
						error = %e,
						"failed to persist credential mutation"
					);
				}
				if let Some(session) = ctx.sessions.write().await.get_mut(&ctx.session_id) {
					session.registered = registered;
				}
			}

			ConnectionEvent::Open => {
				// Edge-triggered: a repeated open for the same session must
				// not re-run the picture update.
				let proceed = {
					let mut sessions = ctx.sessions.write().await;
					match sessions.get_mut(&ctx.session_id) {
						Some(session)
							if !session.avatar_applied
								&& matches!(
									session.state,
									SessionState::Init | SessionState::Handshaking
								) =>
						{
							session.state = SessionState::Authenticated;
							session.avatar_applied = true;
							true
						}
						Some(_) => false,
						// Record already retired; nothing left to drive.
						None => break,
					}
				};
				if !proceed {
					continue;
				}

				tracing::info!(
					session_id = %ctx.session_id,
					"connection open, applying profile picture"
				);
				apply_profile_picture(&ctx).await;

				if let Err(e) = ctx.handle.logout().await {
					tracing::warn!(session_id = %ctx.session_id, error = %e, "logout failed");
				}

				set_state(&ctx.sessions, ctx.session_id, SessionState::Finalizing).await;
				cleanup::schedule(ctx.sessions.clone(), ctx.session_id, ctx.cleanup_grace);
				set_state(&ctx.sessions, ctx.session_id, SessionState::Terminated).await;
				break;
			}

			ConnectionEvent::Close { reason } => {
				if reason.is_transient() {
					// The transport restarts its own socket and re-emits
					// events; the session stays pending.
					tracing::debug!(
						session_id = %ctx.session_id,
						?reason,
						"transient close, awaiting reconnect"
					);
					continue;
				}

				let failed = {
					let mut sessions = ctx.sessions.write().await;
					match sessions.get_mut(&ctx.session_id) {
						Some(session)
							if matches!(
								session.state,
								SessionState::Init
									| SessionState::Handshaking
									| SessionState::Authenticated
							) =>
						{
							session.state = SessionState::Failed;
							true
						}
						_ => false,
					}
				};
				if failed {
					tracing::warn!(
						session_id = %ctx.session_id,
						?reason,
						"connection closed, session failed"
					);
					cleanup::schedule(ctx.sessions.clone(), ctx.session_id, ctx.cleanup_grace);
					break;
				}
			}
		}
	}
}

/// Render and submit the profile picture. Every failure here is soft: the
/// session still proceeds to logout and cleanup.
async fn apply_profile_picture(ctx: &MachineContext) {
	let buffer =
		match media::render_profile_picture(ctx.image_path.clone(), ctx.avatar_edge).await {
			Ok(buffer) => buffer,
			Err(e) => {
				tracing::warn!(
					session_id = %ctx.session_id,
					error = %e,
					"skipping profile picture update"
				);
				return;
			}
		};

	if let Err(e) = ctx
		.handle
		.query(ProtocolQuery::SetProfilePicture { image: buffer })
		.await
	{
		tracing::warn!(
			session_id = %ctx.session_id,
			error = %e,
			"profile picture update rejected"
		);
	}
}

async fn set_state(sessions: &SessionMap, session_id: Uuid, state: SessionState) {
	if let Some(session) = sessions.write().await.get_mut(&session_id) {
		tracing::debug!(%session_id, from = %session.state, to = %state, "state transition");
		session.state = state;
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use async_trait::async_trait;
	use chrono::Utc;
	use tokio::sync::RwLock;

	use super::*;
	use crate::infra::Credentials;
	use crate::service::messenger::{DisconnectReason, MessengerError, Result as MessengerResult};
	use crate::service::session::Session;

	#[derive(Default)]
	struct StubSession {
		profile_updates: AtomicUsize,
		logouts: AtomicUsize,
	}

	#[async_trait]
	impl MessengerSession for StubSession {
		async fn request_pairing_code(&self, _phone_number: &str) -> MessengerResult<String> {
			Err(MessengerError::SessionClosed)
		}

		async fn query(&self, query: ProtocolQuery) -> MessengerResult<()> {
			match query {
				ProtocolQuery::SetProfilePicture { .. } => {
					self.profile_updates.fetch_add(1, Ordering::SeqCst);
					Ok(())
				}
			}
		}

		async fn logout(&self) -> MessengerResult<()> {
			self.logouts.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
	}

	struct Harness {
		sessions: SessionMap,
		session_id: Uuid,
		storage_dir: PathBuf,
		handle: Arc<StubSession>,
		events_tx: mpsc::UnboundedSender<ConnectionEvent>,
		_root: tempfile::TempDir,
	}

	async fn start_machine(image_path: PathBuf) -> Harness {
		let root = tempfile::tempdir().unwrap();
		let session_id = Uuid::new_v4();
		let storage_dir = root.path().join(format!("session-{}", session_id.simple()));
		let store = AuthStateStore::load(storage_dir.clone()).await.unwrap();

		let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));
		sessions.write().await.insert(
			session_id,
			Session {
				id: session_id,
				phone_number: "15551234567".to_string(),
				state: SessionState::Init,
				storage_dir: storage_dir.clone(),
				registered: false,
				pending_pairing_request: false,
				cleanup_scheduled: false,
				avatar_applied: false,
				created_at: Utc::now(),
			},
		);

		let handle = Arc::new(StubSession::default());
		let (events_tx, events_rx) = mpsc::unbounded_channel();

		spawn(MachineContext {
			session_id,
			sessions: sessions.clone(),
			store,
			handle: handle.clone(),
			events: events_rx,
			image_path,
			avatar_edge: 640,
			cleanup_grace: Duration::from_millis(10),
		});

		Harness {
			sessions,
			session_id,
			storage_dir,
			handle,
			events_tx,
			_root: root,
		}
	}

	async fn wait_until_retired(harness: &Harness) {
		for _ in 0..100 {
			tokio::time::sleep(Duration::from_millis(10)).await;
			let retired = !harness
				.sessions
				.read()
				.await
				.contains_key(&harness.session_id);
			if retired && !harness.storage_dir.exists() {
				return;
			}
		}
		panic!("session was not retired in time");
	}

	fn write_test_image(dir: &std::path::Path) -> PathBuf {
		let path = dir.join("photo.png");
		image::RgbImage::from_pixel(64, 64, image::Rgb([200, 40, 40]))
			.save(&path)
			.unwrap();
		path
	}

	#[tokio::test]
	async fn duplicate_open_applies_picture_once() {
		let upload = tempfile::tempdir().unwrap();
		let image_path = write_test_image(upload.path());
		let harness = start_machine(image_path).await;

		harness.events_tx.send(ConnectionEvent::Open).unwrap();
		harness.events_tx.send(ConnectionEvent::Open).unwrap();

		wait_until_retired(&harness).await;
		assert_eq!(harness.handle.profile_updates.load(Ordering::SeqCst), 1);
		assert_eq!(harness.handle.logouts.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn missing_image_still_logs_out_and_cleans_up() {
		let upload = tempfile::tempdir().unwrap();
		let harness = start_machine(upload.path().join("missing.png")).await;

		harness.events_tx.send(ConnectionEvent::Open).unwrap();

		wait_until_retired(&harness).await;
		assert_eq!(harness.handle.profile_updates.load(Ordering::SeqCst), 0);
		assert_eq!(harness.handle.logouts.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn transient_close_keeps_session_pending() {
		let upload = tempfile::tempdir().unwrap();
		let image_path = write_test_image(upload.path());
		let harness = start_machine(image_path).await;

		harness
			.events_tx
			.send(ConnectionEvent::Close {
				reason: DisconnectReason::RestartRequired,
			})
			.unwrap();

		tokio::time::sleep(Duration::from_millis(100)).await;
		{
			let sessions = harness.sessions.read().await;
			let session = sessions.get(&harness.session_id).expect("still resident");
			assert_eq!(session.state, SessionState::Handshaking);
			assert!(!session.cleanup_scheduled);
		}
		assert!(harness.storage_dir.exists());

		// The transport restarts and the handshake eventually succeeds.
		harness.events_tx.send(ConnectionEvent::Open).unwrap();
		wait_until_retired(&harness).await;
		assert_eq!(harness.handle.profile_updates.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn fatal_close_fails_session_and_cleans_up() {
		let upload = tempfile::tempdir().unwrap();
		let image_path = write_test_image(upload.path());
		let harness = start_machine(image_path).await;

		harness
			.events_tx
			.send(ConnectionEvent::Close {
				reason: DisconnectReason::LoggedOut,
			})
			.unwrap();

		wait_until_retired(&harness).await;
		assert_eq!(harness.handle.profile_updates.load(Ordering::SeqCst), 0);
		assert_eq!(harness.handle.logouts.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn credential_mutation_is_persisted() {
		let upload = tempfile::tempdir().unwrap();
		let image_path = write_test_image(upload.path());
		let harness = start_machine(image_path).await;

		harness
			.events_tx
			.send(ConnectionEvent::CredentialsUpdate(Credentials {
				account_id: Some("15551234567@acct".to_string()),
				registered: true,
				key_material: Default::default(),
			}))
			.unwrap();

		for _ in 0..100 {
			tokio::time::sleep(Duration::from_millis(10)).await;
			if harness.storage_dir.join("creds.json").exists() {
				break;
			}
		}
		// The registry update lands right after the durable write.
		tokio::time::sleep(Duration::from_millis(50)).await;
		let raw = std::fs::read_to_string(harness.storage_dir.join("creds.json")).unwrap();
		assert!(raw.contains("15551234567@acct"));

		let registered = harness.sessions.read().await[&harness.session_id].registered;
		assert!(registered);
	}
}

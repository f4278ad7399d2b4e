//! Pairing code coordinator
//!
//! Issues the one-shot pairing code request for a session and delivers the
//! outcome to the waiting caller. Runs independently of the connection state
//! machine so a slow transport event stream never delays the code, and vice
//! versa.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use super::{cleanup, PairingOutcome, Result, SessionError, SessionMap, SessionState};
use crate::service::messenger::{MessengerError, MessengerSession};

pub(crate) struct CoordinatorContext {
	pub session_id: Uuid,
	pub sessions: SessionMap,
	pub handle: Arc<dyn MessengerSession>,
	pub phone_number: String,
	pub delay: Duration,
	pub cleanup_grace: Duration,
	pub registered: bool,
	pub outcome_tx: oneshot::Sender<Result<PairingOutcome>>,
}

pub(crate) fn spawn(ctx: CoordinatorContext) {
	if ctx.registered {
		// Nothing further is meaningful for an already-registered account
		// reached through the pairing flow.
		tracing::info!(
			session_id = %ctx.session_id,
			"credentials already registered, skipping pairing request"
		);
		cleanup::schedule(ctx.sessions, ctx.session_id, ctx.cleanup_grace);
		let _ = ctx.outcome_tx.send(Ok(PairingOutcome::AlreadyRegistered));
		return;
	}

	tokio::spawn(run(ctx));
}

async fn run(ctx: CoordinatorContext) {
	// The transport needs a settling period after connect before it will
	// accept a pairing request.
	tokio::time::sleep(ctx.delay).await;

	let fire = {
		let mut sessions = ctx.sessions.write().await;
		match sessions.get_mut(&ctx.session_id) {
			Some(session)
				if !session.pending_pairing_request
					&& matches!(
						session.state,
						SessionState::Init | SessionState::Handshaking
					) =>
			{
				session.pending_pairing_request = true;
				true
			}
			_ => false,
		}
	};
	if !fire {
		// The session completed or failed before the request could be
		// issued; dropping the sender surfaces `SessionClosed` upstream.
		tracing::debug!(session_id = %ctx.session_id, "pairing request skipped");
		return;
	}

	match ctx.handle.request_pairing_code(&ctx.phone_number).await {
		Ok(raw) => {
			let _ = ctx
				.outcome_tx
				.send(Ok(PairingOutcome::Code(format_pairing_code(&raw))));
		}
		Err(e) => {
			// A failed pairing request has no reason to keep the session
			// alive.
			tracing::warn!(session_id = %ctx.session_id, error = %e, "pairing request failed");
			cleanup::schedule(ctx.sessions.clone(), ctx.session_id, ctx.cleanup_grace);
			let err = match e {
				MessengerError::PairingRefused(reason) => SessionError::PairingRefused(reason),
				other => SessionError::Transport(other),
			};
			let _ = ctx.outcome_tx.send(Err(err));
		}
	}
}

/// Format a raw pairing code into 4-character groups joined by hyphens.
/// Codes whose length does not divide cleanly are returned unmodified.
pub fn format_pairing_code(raw: &str) -> String {
	let chars: Vec<char> = raw.chars().collect();
	if chars.is_empty() || chars.len() % 4 != 0 {
		return raw.to_string();
	}
	chars
		.chunks(4)
		.map(|group| group.iter().collect::<String>())
		.collect::<Vec<_>>()
		.join("-")
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;
	use std::path::PathBuf;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use async_trait::async_trait;
	use chrono::Utc;
	use tokio::sync::RwLock;

	use super::*;
	use crate::service::messenger::{ProtocolQuery, Result as MessengerResult};
	use crate::service::session::Session;

	#[test]
	fn formats_divisible_codes_into_groups() {
		assert_eq!(format_pairing_code("ABCDEFGH"), "ABCD-EFGH");
		assert_eq!(format_pairing_code("ABCDEFGHIJKL"), "ABCD-EFGH-IJKL");
	}

	#[test]
	fn leaves_indivisible_codes_unmodified() {
		assert_eq!(format_pairing_code("ABCDEFG"), "ABCDEFG");
		assert_eq!(format_pairing_code("ABC"), "ABC");
		assert_eq!(format_pairing_code(""), "");
	}

	struct StubSession {
		pairing_requests: AtomicUsize,
		refuse: bool,
	}

	impl StubSession {
		fn new(refuse: bool) -> Arc<Self> {
			Arc::new(Self {
				pairing_requests: AtomicUsize::new(0),
				refuse,
			})
		}
	}

	#[async_trait]
	impl MessengerSession for StubSession {
		async fn request_pairing_code(&self, _phone_number: &str) -> MessengerResult<String> {
			self.pairing_requests.fetch_add(1, Ordering::SeqCst);
			if self.refuse {
				Err(MessengerError::PairingRefused("rate limited".to_string()))
			} else {
				Ok("ABCDEFGH".to_string())
			}
		}

		async fn query(&self, _query: ProtocolQuery) -> MessengerResult<()> {
			Ok(())
		}

		async fn logout(&self) -> MessengerResult<()> {
			Ok(())
		}
	}

	struct Harness {
		sessions: SessionMap,
		session_id: Uuid,
		storage_dir: PathBuf,
		_root: tempfile::TempDir,
	}

	async fn seed_session(state: SessionState, pending: bool) -> Harness {
		let root = tempfile::tempdir().unwrap();
		let session_id = Uuid::new_v4();
		let storage_dir = root.path().join(format!("session-{}", session_id.simple()));
		std::fs::create_dir_all(&storage_dir).unwrap();

		let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));
		sessions.write().await.insert(
			session_id,
			Session {
				id: session_id,
				phone_number: "15551234567".to_string(),
				state,
				storage_dir: storage_dir.clone(),
				registered: false,
				pending_pairing_request: pending,
				cleanup_scheduled: false,
				avatar_applied: false,
				created_at: Utc::now(),
			},
		);

		Harness {
			sessions,
			session_id,
			storage_dir,
			_root: root,
		}
	}

	fn coordinator(
		harness: &Harness,
		handle: Arc<StubSession>,
		registered: bool,
	) -> (
		CoordinatorContext,
		oneshot::Receiver<Result<PairingOutcome>>,
	) {
		let (outcome_tx, outcome_rx) = oneshot::channel();
		(
			CoordinatorContext {
				session_id: harness.session_id,
				sessions: harness.sessions.clone(),
				handle,
				phone_number: "15551234567".to_string(),
				delay: Duration::from_millis(10),
				cleanup_grace: Duration::from_millis(10),
				registered,
				outcome_tx,
			},
			outcome_rx,
		)
	}

	async fn wait_for_cleanup(harness: &Harness) {
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
		panic!("cleanup did not run in time");
	}

	#[tokio::test]
	async fn registered_credentials_short_circuit() {
		let harness = seed_session(SessionState::Handshaking, false).await;
		let handle = StubSession::new(false);
		let (ctx, outcome_rx) = coordinator(&harness, handle.clone(), true);

		spawn(ctx);

		let outcome = outcome_rx.await.unwrap().unwrap();
		assert_eq!(outcome, PairingOutcome::AlreadyRegistered);
		assert_eq!(handle.pairing_requests.load(Ordering::SeqCst), 0);
		wait_for_cleanup(&harness).await;
	}

	#[tokio::test]
	async fn delivers_formatted_code_after_delay() {
		let harness = seed_session(SessionState::Handshaking, false).await;
		let handle = StubSession::new(false);
		let (ctx, outcome_rx) = coordinator(&harness, handle.clone(), false);

		spawn(ctx);

		let outcome = outcome_rx.await.unwrap().unwrap();
		assert_eq!(outcome, PairingOutcome::Code("ABCD-EFGH".to_string()));
		assert_eq!(handle.pairing_requests.load(Ordering::SeqCst), 1);

		let pending = harness.sessions.read().await[&harness.session_id].pending_pairing_request;
		assert!(pending);
	}

	#[tokio::test]
	async fn refusal_surfaces_error_and_schedules_cleanup() {
		let harness = seed_session(SessionState::Handshaking, false).await;
		let handle = StubSession::new(true);
		let (ctx, outcome_rx) = coordinator(&harness, handle.clone(), false);

		spawn(ctx);

		let err = outcome_rx.await.unwrap().unwrap_err();
		assert!(matches!(err, SessionError::PairingRefused(_)));
		wait_for_cleanup(&harness).await;
	}

	#[tokio::test]
	async fn never_issues_a_second_request() {
		let harness = seed_session(SessionState::Handshaking, true).await;
		let handle = StubSession::new(false);
		let (ctx, outcome_rx) = coordinator(&harness, handle.clone(), false);

		spawn(ctx);

		// The pending flag is already set, so the coordinator must not fire
		// and the caller observes the dropped channel.
		assert!(outcome_rx.await.is_err());
		assert_eq!(handle.pairing_requests.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn skips_request_for_terminated_session() {
		let harness = seed_session(SessionState::Terminated, false).await;
		let handle = StubSession::new(false);
		let (ctx, outcome_rx) = coordinator(&harness, handle.clone(), false);

		spawn(ctx);

		assert!(outcome_rx.await.is_err());
		assert_eq!(handle.pairing_requests.load(Ordering::SeqCst), 0);
	}
}

//! Deferred session cleanup
//!
//! Removes a session's auth state store after a grace period and retires the
//! session from the registry. Invoked from the success path and the failure
//! path; the scheduled flag makes a duplicate invocation a no-op, and a
//! store directory that is already gone is not an error.

use std::time::Duration;

use uuid::Uuid;

use super::SessionMap;

/// Schedule removal of `session_id`'s auth state store. Fire-and-forget:
/// the caller's own progression never blocks on the deletion.
pub(crate) fn schedule(sessions: SessionMap, session_id: Uuid, grace: Duration) {
	tokio::spawn(async move {
		let storage_dir = {
			let mut map = sessions.write().await;
			let Some(session) = map.get_mut(&session_id) else {
				return;
			};
			if session.cleanup_scheduled {
				return;
			}
			session.cleanup_scheduled = true;
			session.storage_dir.clone()
		};

		// Let in-flight credential writes settle before deleting.
		tokio::time::sleep(grace).await;

		match tokio::fs::remove_dir_all(&storage_dir).await {
			Ok(()) => {
				tracing::debug!(%session_id, dir = %storage_dir.display(), "removed session storage");
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
			Err(e) => {
				tracing::warn!(
					%session_id,
					dir = %storage_dir.display(),
					error = %e,
					"failed to remove session storage"
				);
			}
		}

		sessions.write().await.remove(&session_id);
	});
}

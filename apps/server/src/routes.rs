//! HTTP surface: upload intake and the connect operation

use std::sync::Arc;

use axum::extract::{Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use av_core::{Core, PairingOutcome, SessionError};

pub fn router(core: Arc<Core>) -> Router {
	Router::new()
		.route("/upload", post(upload))
		.route("/connect", get(connect))
		.with_state(core)
}

/// Store an uploaded image under the upload directory.
///
/// The stored name is our own timestamp plus the original extension; the
/// client-supplied name is untrusted and never used as a path.
async fn upload(State(core): State<Arc<Core>>, mut multipart: Multipart) -> Response {
	while let Ok(Some(field)) = multipart.next_field().await {
		if field.name() != Some("image") {
			continue;
		}

		let extension = field
			.file_name()
			.and_then(|name| std::path::Path::new(name).extension())
			.and_then(|ext| ext.to_str())
			.map(|ext| format!(".{ext}"))
			.unwrap_or_default();
		let filename = format!("{}{}", chrono::Utc::now().timestamp_millis(), extension);

		let bytes = match field.bytes().await {
			Ok(bytes) => bytes,
			Err(e) => {
				return (
					StatusCode::BAD_REQUEST,
					Json(json!({ "error": e.to_string() })),
				)
					.into_response()
			}
		};

		let path = core.config.upload_dir.join(&filename);
		if let Err(e) = tokio::fs::write(&path, &bytes).await {
			tracing::error!(error = %e, path = %path.display(), "failed to store upload");
			return (
				StatusCode::INTERNAL_SERVER_ERROR,
				Json(json!({ "error": "failed to store upload" })),
			)
				.into_response();
		}

		tracing::info!(%filename, bytes = bytes.len(), "stored uploaded image");
		return Json(json!({ "filename": filename })).into_response();
	}

	(
		StatusCode::BAD_REQUEST,
		Json(json!({ "error": "no image file in request" })),
	)
		.into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectParams {
	#[serde(default)]
	phone_number: String,
	#[serde(default)]
	filename: String,
}

/// Provision a session and answer with its pairing outcome.
async fn connect(State(core): State<Arc<Core>>, Query(params): Query<ConnectParams>) -> Response {
	match core
		.sessions
		.connect(&params.phone_number, &params.filename)
		.await
	{
		Ok(PairingOutcome::Code(code)) => Json(json!({ "code": code })).into_response(),
		Ok(PairingOutcome::AlreadyRegistered) => {
			Json(json!({ "status": "already_registered" })).into_response()
		}
		Err(e) => {
			let status = match &e {
				SessionError::InvalidInput(_) => StatusCode::BAD_REQUEST,
				SessionError::PairingRefused(_) => StatusCode::BAD_GATEWAY,
				_ => StatusCode::INTERNAL_SERVER_ERROR,
			};
			(status, Json(json!({ "error": e.to_string() }))).into_response()
		}
	}
}

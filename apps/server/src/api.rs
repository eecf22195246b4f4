//! HTTP surface: push, pull and the poke stream
//!
//! Identity comes from headers set by the authenticating proxy in front of
//! the server; the core trusts them as given.

use std::sync::Arc;

use axum::{
	async_trait,
	extract::{FromRequestParts, State},
	http::{request::Parts, StatusCode},
	response::{
		sse::{Event, KeepAlive, Sse},
		IntoResponse, Response,
	},
	routing::{get, post},
	Json, Router,
};
use futures::{stream, Stream};
use quire_core::{
	infra::sync::{Actor, PullRequest, PullResponse, PushRequest, SyncError},
	Core,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

pub const USER_HEADER: &str = "x-quire-user";
pub const ROLE_HEADER: &str = "x-quire-role";
pub const TENANT_HEADER: &str = "x-quire-tenant";

#[derive(Clone)]
pub struct AppState {
	core: Arc<Core>,
}

pub fn router(core: Arc<Core>) -> Router {
	Router::new()
		.route("/push", post(push))
		.route("/pull", post(pull))
		.route("/poke", get(poke))
		.route("/health", get(|| async { "OK" }))
		.with_state(AppState { core })
}

#[derive(Debug, Error)]
pub enum ApiError {
	#[error("Missing identity header {0}")]
	MissingIdentity(&'static str),

	#[error(transparent)]
	Sync(#[from] SyncError),
}

impl ApiError {
	fn kind(&self) -> &'static str {
		match self {
			ApiError::MissingIdentity(_) => "Unauthenticated",
			ApiError::Sync(e) => match e {
				SyncError::ClockSkew { .. } => "ClockSkew",
				SyncError::ClientStateNotFound { .. } => "ClientStateNotFound",
				SyncError::ClientGroupMismatch { .. } | SyncError::ClientMismatch { .. } => {
					"Forbidden"
				}
				SyncError::InvalidNamespace(_) => "InvalidTenant",
				SyncError::TenantNotProvisioned(_) => "TenantNotProvisioned",
				_ => "Internal",
			},
		}
	}

	fn status(&self) -> StatusCode {
		match self {
			ApiError::MissingIdentity(_) => StatusCode::UNAUTHORIZED,
			ApiError::Sync(e) => match e {
				SyncError::ClockSkew { .. } => StatusCode::CONFLICT,
				SyncError::ClientStateNotFound { .. } => StatusCode::GONE,
				SyncError::ClientGroupMismatch { .. } | SyncError::ClientMismatch { .. } => {
					StatusCode::FORBIDDEN
				}
				SyncError::InvalidNamespace(_) => StatusCode::BAD_REQUEST,
				SyncError::TenantNotProvisioned(_) => StatusCode::NOT_FOUND,
				_ => StatusCode::INTERNAL_SERVER_ERROR,
			},
		}
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = self.status();

		// Storage details stay in the logs
		let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
			error!(error = %self, "Request failed");
			"Internal error".to_string()
		} else {
			self.to_string()
		};

		(status, Json(json!({ "error": self.kind(), "message": message }))).into_response()
	}
}

/// Caller identity from the proxy headers
pub struct Identity(pub Actor);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Identity {
	type Rejection = ApiError;

	async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
		let header = |name: &'static str| {
			parts
				.headers
				.get(name)
				.and_then(|value| value.to_str().ok())
				.filter(|value| !value.is_empty())
				.map(str::to_string)
				.ok_or(ApiError::MissingIdentity(name))
		};

		Ok(Identity(Actor::new(
			header(USER_HEADER)?,
			header(ROLE_HEADER)?,
			header(TENANT_HEADER)?,
		)))
	}
}

async fn push(
	State(state): State<AppState>,
	Identity(actor): Identity,
	Json(request): Json<PushRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
	state.core.push.push(&actor, &request).await?;
	Ok(Json(json!({})))
}

async fn pull(
	State(state): State<AppState>,
	Identity(actor): Identity,
	Json(request): Json<PullRequest>,
) -> Result<Json<PullResponse>, ApiError> {
	Ok(Json(state.core.pull.pull(&actor, &request).await?))
}

/// Server-sent "pull now" events for the caller's tenant
async fn poke(
	State(state): State<AppState>,
	Identity(actor): Identity,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
	let session = state.core.sessions.register(&actor.tenant_id, &actor.user_id);

	// The session lives inside the stream and unregisters when the client goes
	let events = stream::unfold(session, |mut session| async move {
		let event = session.recv().await?;
		Some((Event::default().event("poke").json_data(&event), session))
	});

	Sse::new(events).keep_alive(KeepAlive::default())
}

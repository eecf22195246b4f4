//! Mutation registry
//!
//! Maps mutation names ("createNote", "updateNote", ...) to the handlers that
//! apply them. Feature modules register their handlers at startup; the push
//! pipeline only ever dispatches by name, so adding a content type never
//! touches the pipeline.

use async_trait::async_trait;
use std::{collections::HashMap, fmt, sync::Arc};

use super::{
	error::{MutationError, VersionConflict},
	history::HistoryLedger,
	permission::Actor,
	tenant::TenantTx,
};

/// Everything a handler may use while applying one mutation
pub struct MutationContext<'a> {
	/// Transaction pinned to the caller's tenant namespace
	pub tx: &'a TenantTx,

	/// Caller identity
	pub actor: &'a Actor,

	/// Packed HLC the handler must stamp as `global_version` on every row it
	/// writes
	pub causal_version: &'a str,

	/// Server wall-clock time of the push, in milliseconds
	pub now: i64,

	/// Audit trail for the handler's entity
	pub history: &'a HistoryLedger,
}

/// A pluggable mutation implementation
///
/// Handlers decode and validate their own arguments. They must compare the
/// submitted `version` with the stored one before writing and return
/// [`MutationError::VersionConflict`] on mismatch.
#[async_trait]
pub trait MutationHandler: Send + Sync {
	async fn apply(
		&self,
		ctx: &MutationContext<'_>,
		args: &serde_json::Value,
	) -> Result<(), MutationError>;

	/// Merge a visible conflict marker into the live entity
	///
	/// Called after [`MutationHandler::apply`] reported a conflict. Returns
	/// whether a marker was placed. Handlers whose entities have no place to
	/// show a marker keep the default.
	async fn inject_conflict(
		&self,
		ctx: &MutationContext<'_>,
		conflict: &VersionConflict,
		message: &str,
	) -> Result<bool, MutationError> {
		let _ = (ctx, conflict, message);
		Ok(false)
	}
}

/// Name -> handler lookup table
#[derive(Clone, Default)]
pub struct MutationRegistry {
	handlers: HashMap<String, Arc<dyn MutationHandler>>,
}

impl MutationRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a handler, replacing any previous handler for `name`
	pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn MutationHandler>) -> &mut Self {
		self.handlers.insert(name.into(), handler);
		self
	}

	pub fn get(&self, name: &str) -> Option<&Arc<dyn MutationHandler>> {
		self.handlers.get(name)
	}

	pub fn contains(&self, name: &str) -> bool {
		self.handlers.contains_key(name)
	}

	pub fn names(&self) -> Vec<&str> {
		let mut names: Vec<_> = self.handlers.keys().map(String::as_str).collect();
		names.sort_unstable();
		names
	}
}

impl fmt::Debug for MutationRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MutationRegistry")
			.field("handlers", &self.names())
			.finish()
	}
}

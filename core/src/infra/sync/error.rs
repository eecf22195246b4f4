//! Error types for the sync pipelines and mutation handlers

use sea_orm::DbErr;
use thiserror::Error;

use super::hlc::HlcError;

/// Pipeline-level failures
///
/// Every variant here is a hard failure for the request: the surrounding
/// transaction is rolled back and the client has to retry (or, for
/// [`SyncError::ClientStateNotFound`], reset its cache).
#[derive(Debug, Error)]
pub enum SyncError {
	#[error("Clock skew: mutation clock {physical}ms is beyond the admission limit {limit}ms")]
	ClockSkew { physical: u64, limit: u64 },

	#[error("Database error: {0}")]
	Database(#[from] DbErr),

	#[error("Client state not found: cookie {cookie} is ahead of server watermark {watermark}")]
	ClientStateNotFound { cookie: String, watermark: String },

	#[error("Tenant namespace not provisioned: {0}")]
	TenantNotProvisioned(String),

	#[error("Invalid namespace: {0}")]
	InvalidNamespace(String),

	#[error("Client group {client_group_id} belongs to another user")]
	ClientGroupMismatch { client_group_id: String },

	#[error("Client {client_id} belongs to another client group")]
	ClientMismatch { client_id: String },

	#[error("Clock error: {0}")]
	Clock(#[from] HlcError),

	#[error("Serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Details of a rejected optimistic-lock write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConflict {
	/// Syncable entity type of the row that was written ("note")
	pub entity_type: String,

	/// Row the write targeted
	pub entity_id: String,

	/// Document the row belongs to, for history grouping
	pub note_id: String,

	/// Node inside the entity's document tree the write targeted, if any
	pub target_id: Option<String>,

	/// Version the client based its write on
	pub submitted: i64,

	/// Version currently stored
	pub stored: i64,
}

/// Domain failures raised by mutation handlers
///
/// Apart from [`MutationError::Database`], these never abort a push: the
/// mutation is dropped and the batch continues.
#[derive(Debug, Error)]
pub enum MutationError {
	#[error("Validation error: {0}")]
	Validation(String),

	#[error(
		"Version conflict on {}/{}: submitted {}, stored {}",
		.0.entity_type,
		.0.entity_id,
		.0.submitted,
		.0.stored
	)]
	VersionConflict(VersionConflict),

	#[error("Not found: {0}")]
	NotFound(String),

	#[error("Database error: {0}")]
	Database(#[from] DbErr),

	#[error("Serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

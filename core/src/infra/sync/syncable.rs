//! Syncable entities: the per-collection delta producers behind pull
//!
//! Every table that clients replicate is described by one [`SyncableEntity`].
//! Rows carry an integer `version` (optimistic lock) and a `global_version`
//! (packed HLC of the write that produced them); an entity only has to answer
//! "which rows changed after this cookie" and the pull pipeline does the rest.
//!
//! ```rust,ignore
//! let mut entities = SyncableRegistry::new();
//! entities.register(Arc::new(NoteEntity));
//!
//! db.provision_namespace(&namespace, entities.schema(&namespace)).await?;
//! ```

use async_trait::async_trait;
use sea_orm::{sea_query::TableCreateStatement, DbErr};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

use super::{pull::PatchOperation, tenant::Namespace, tenant::TenantTx, tombstone};

/// Content filter ("lens") narrowing what a client replicates
///
/// Entities interpret the fields they understand and ignore the rest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullFilter {
	/// Only rows carrying at least one of these tags
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tags: Option<Vec<String>>,

	/// Filter fields for entities outside the core
	#[serde(flatten)]
	pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A replicated collection
#[async_trait]
pub trait SyncableEntity: Send + Sync {
	/// Stable identifier, also the prefix of every patch key ("note")
	fn entity_type(&self) -> &'static str;

	/// Tables this entity needs inside a tenant namespace
	fn schema(&self, namespace: &Namespace) -> Vec<TableCreateStatement>;

	/// Highest `global_version` stored for this entity
	async fn watermark(&self, tx: &TenantTx) -> Result<Option<String>, DbErr>;

	/// `put` operations for rows written after `cookie` that pass `filter`
	async fn patch_since(
		&self,
		tx: &TenantTx,
		cookie: &str,
		filter: &PullFilter,
	) -> Result<Vec<PatchOperation>, DbErr>;

	/// `del` operations for rows deleted after `cookie`
	async fn deletions_since(&self, tx: &TenantTx, cookie: &str) -> Result<Vec<PatchOperation>, DbErr> {
		Ok(tombstone::deleted_since(tx, self.entity_type(), cookie)
			.await?
			.into_iter()
			.map(|id| PatchOperation::Del {
				key: self.key(&id),
			})
			.collect())
	}

	fn key(&self, id: &str) -> String {
		format!("{}/{}", self.entity_type(), id)
	}
}

/// All entities the pull pipeline walks
#[derive(Clone, Default)]
pub struct SyncableRegistry {
	entities: Vec<Arc<dyn SyncableEntity>>,
}

impl SyncableRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, entity: Arc<dyn SyncableEntity>) -> &mut Self {
		self.entities.push(entity);
		self
	}

	pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SyncableEntity>> {
		self.entities.iter()
	}

	/// Table statements of every registered entity
	pub fn schema(&self, namespace: &Namespace) -> Vec<TableCreateStatement> {
		self.entities
			.iter()
			.flat_map(|entity| entity.schema(namespace))
			.collect()
	}
}

impl fmt::Debug for SyncableRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_list()
			.entries(self.entities.iter().map(|entity| entity.entity_type()))
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_filter_keeps_unknown_fields() {
		let filter: PullFilter =
			serde_json::from_value(json!({ "tags": ["work"], "folder": "inbox" })).unwrap();

		assert_eq!(filter.tags, Some(vec!["work".to_string()]));
		assert_eq!(filter.extra["folder"], "inbox");
		assert_eq!(PullFilter::default().tags, None);
	}
}

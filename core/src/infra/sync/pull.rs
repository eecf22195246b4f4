//! Pull pipeline
//!
//! Answers "what changed since my cookie" for one client group. The response
//! cookie is the namespace watermark at the time of the pull; the patch holds
//! every row written after the request cookie (`put`) and every row deleted
//! after it (`del`), filtered through the client's lens.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, info, instrument};

use super::{
	client,
	error::{Result, SyncError},
	permission::Actor,
	syncable::{PullFilter, SyncableRegistry},
	tenant::{TenantGate, TenantTx},
	time_source::TimeSource,
	watermarks::{self, Cookie, ZERO_WATERMARK},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
	#[serde(alias = "clientGroupID")]
	pub client_group_id: String,

	/// Pulling client, registered in its group if new
	#[serde(default, skip_serializing_if = "Option::is_none", alias = "clientID")]
	pub client_id: Option<String>,

	/// Last watermark the client synced to; absent or zero for a fresh client
	#[serde(default)]
	pub cookie: Option<Cookie>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub filter: Option<PullFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
	pub cookie: String,
	pub last_mutation_id_changes: BTreeMap<String, i64>,
	pub patch: Vec<PatchOperation>,
}

impl PullResponse {
	/// Response for a tenant with no namespace yet
	pub fn empty() -> Self {
		Self {
			cookie: ZERO_WATERMARK.to_string(),
			last_mutation_id_changes: BTreeMap::new(),
			patch: Vec::new(),
		}
	}
}

/// One step for the client to apply to its cache
///
/// Keys are `"<entity_type>/<id>"`. Apart from `clear`, which always comes
/// first, operations are a keyed set and may be applied in any order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
	Clear,
	Put { key: String, value: Value },
	Del { key: String },
}

/// Orchestrates pulls; cheap to clone and share
#[derive(Clone)]
pub struct PullPipeline {
	gate: TenantGate,
	entities: Arc<SyncableRegistry>,
	time: Arc<dyn TimeSource>,
}

impl PullPipeline {
	pub fn new(gate: TenantGate, entities: Arc<SyncableRegistry>, time: Arc<dyn TimeSource>) -> Self {
		Self {
			gate,
			entities,
			time,
		}
	}

	#[instrument(
		skip_all,
		fields(
			tenant_id = %actor.tenant_id,
			user_id = %actor.user_id,
			client_group_id = %request.client_group_id,
		)
	)]
	pub async fn pull(&self, actor: &Actor, request: &PullRequest) -> Result<PullResponse> {
		let namespace = self.gate.resolve(&actor.tenant_id)?;

		let tx = match self.gate.begin(&namespace).await {
			Ok(tx) => tx,
			Err(SyncError::TenantNotProvisioned(namespace)) => {
				info!(%namespace, "Tenant not provisioned yet, returning empty patch");
				return Ok(PullResponse::empty());
			}
			Err(e) => return Err(e),
		};

		let response = match self.process(&tx, actor, request).await {
			Ok(response) => response,
			Err(e) => {
				if let Err(rollback) = tx.rollback().await {
					error!(error = %rollback, "Failed to roll back pull transaction");
				}
				return Err(e);
			}
		};

		tx.commit().await?;

		Ok(response)
	}

	async fn process(&self, tx: &TenantTx, actor: &Actor, request: &PullRequest) -> Result<PullResponse> {
		let current = watermarks::current_watermark(tx, &self.entities).await?;
		let cookie = watermarks::normalize(request.cookie.as_ref());

		if let Some(cookie) = &cookie {
			if cookie.as_str() > current.as_str() {
				return Err(SyncError::ClientStateNotFound {
					cookie: cookie.clone(),
					watermark: current,
				});
			}
		}

		let now = i64::try_from(self.time.current_time_ms()).unwrap_or(i64::MAX);
		client::ensure_group(tx, &request.client_group_id, &actor.user_id, now).await?;
		if let Some(client_id) = &request.client_id {
			client::load_client(tx, client_id, &request.client_group_id, now).await?;
		}
		let last_mutation_id_changes = client::last_mutation_ids(tx, &request.client_group_id).await?;

		let filter = request.filter.clone().unwrap_or_default();
		let since = cookie.as_deref().unwrap_or(ZERO_WATERMARK);

		let mut patch = Vec::new();

		// A fresh client wipes its cache first, so an old unfiltered cache
		// never mixes with a new lens
		if cookie.is_none() {
			patch.push(PatchOperation::Clear);
		}

		for entity in self.entities.iter() {
			patch.extend(entity.patch_since(tx, since, &filter).await?);

			// Nothing to delete from a cache that was just cleared
			if cookie.is_some() {
				patch.extend(entity.deletions_since(tx, since).await?);
			}
		}

		debug!(
			cookie = %since,
			watermark = %current,
			operations = patch.len(),
			"Assembled pull patch"
		);

		Ok(PullResponse {
			cookie: current,
			last_mutation_id_changes,
			patch,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_patch_wire_format() {
		let patch = vec![
			PatchOperation::Clear,
			PatchOperation::Put {
				key: "note/N1".into(),
				value: json!({ "title": "A" }),
			},
			PatchOperation::Del {
				key: "note/N2".into(),
			},
		];

		assert_eq!(
			serde_json::to_value(&patch).unwrap(),
			json!([
				{ "op": "clear" },
				{ "op": "put", "key": "note/N1", "value": { "title": "A" } },
				{ "op": "del", "key": "note/N2" }
			])
		);
	}

	#[test]
	fn test_request_accepts_any_cookie_form() {
		let request: PullRequest = serde_json::from_value(json!({
			"clientGroupID": "g1",
			"cookie": 42,
			"filter": { "tags": ["work"] }
		}))
		.unwrap();

		assert_eq!(request.client_group_id, "g1");
		assert_eq!(request.cookie, Some(Cookie::Int(42)));
		assert_eq!(request.filter.unwrap().tags, Some(vec!["work".into()]));
	}
}

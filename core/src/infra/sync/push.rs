//! Push pipeline
//!
//! Applies one client group's batch of mutations inside a single tenant
//! transaction. Mutations are processed strictly in submission order, each
//! going through:
//!
//! 1. clock admission (server HLC advanced past the client's, skew checked)
//! 2. the idempotency gate (`sequence_id` must be `last_mutation_id + 1`)
//! 3. the authorization gate
//! 4. dispatch to the registered handler, inside a savepoint
//! 5. conflict handling (rejected history row, visible conflict marker)
//! 6. bookkeeping (`last_mutation_id` advanced whatever the outcome)
//!
//! Only clock skew and storage failures abort the batch; everything else drops
//! the single mutation. Live sessions are poked after the commit.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, error, info, instrument, warn};

use super::{
	client::{self, ClientRecord},
	error::{MutationError, Result, SyncError, VersionConflict},
	event_bus::Notifier,
	history::{HistoryLedger, NewHistoryEntry},
	hlc::{ClockRegistry, Hlc},
	permission::{Actor, PermissionPolicy},
	registry::{MutationContext, MutationHandler, MutationRegistry},
	syncable::SyncableRegistry,
	tenant::{Namespace, TenantGate, TenantTx},
	time_source::TimeSource,
	watermarks,
};

/// Default admission limit for client clocks running ahead (24 hours)
pub const DEFAULT_CLOCK_SKEW_THRESHOLD_MS: u64 = 24 * 60 * 60 * 1000;

/// A batch of mutations from one client group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
	#[serde(alias = "clientGroupID")]
	pub client_group_id: String,

	#[serde(default)]
	pub mutations: Vec<Mutation>,
}

/// One client-side write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
	/// Monotonic per client, starting at 1
	#[serde(alias = "id")]
	pub sequence_id: i64,

	#[serde(alias = "clientID")]
	pub client_id: String,

	pub name: String,

	#[serde(default)]
	pub args: Value,

	/// Packed HLC of the client when it made the write, if it keeps one
	#[serde(default, skip_serializing_if = "Option::is_none", alias = "hlc")]
	pub timestamp: Option<String>,
}

/// What happened to each mutation of a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushReport {
	/// Handler ran and its writes were kept
	pub applied: usize,

	/// Already applied by an earlier push
	pub replayed: usize,

	/// Ahead of the client's next expected sequence id, dropped
	pub gaps: usize,

	pub denied: usize,

	/// Lost an optimistic-lock race
	pub conflicts: usize,

	/// Handler rejected the mutation (bad args, missing row, ...)
	pub failed: usize,

	/// No handler registered under the mutation's name
	pub unknown: usize,
}

/// Orchestrates pushes; cheap to clone and share
#[derive(Clone)]
pub struct PushPipeline {
	gate: TenantGate,
	mutations: Arc<MutationRegistry>,
	entities: Arc<SyncableRegistry>,
	policy: Arc<dyn PermissionPolicy>,
	clocks: Arc<ClockRegistry>,
	history: HistoryLedger,
	time: Arc<dyn TimeSource>,
	notifier: Option<Arc<dyn Notifier>>,
	skew_threshold_ms: u64,
}

impl PushPipeline {
	pub fn new(
		gate: TenantGate,
		mutations: Arc<MutationRegistry>,
		entities: Arc<SyncableRegistry>,
		policy: Arc<dyn PermissionPolicy>,
		clocks: Arc<ClockRegistry>,
		history: HistoryLedger,
		time: Arc<dyn TimeSource>,
	) -> Self {
		Self {
			gate,
			mutations,
			entities,
			policy,
			clocks,
			history,
			time,
			notifier: None,
			skew_threshold_ms: DEFAULT_CLOCK_SKEW_THRESHOLD_MS,
		}
	}

	pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
		self.notifier = Some(notifier);
		self
	}

	pub fn with_skew_threshold(mut self, threshold_ms: u64) -> Self {
		self.skew_threshold_ms = threshold_ms;
		self
	}

	/// Apply a batch atomically
	///
	/// On error nothing of the batch is stored, bookkeeping included, so the
	/// client can resend it as is.
	#[instrument(
		skip_all,
		fields(
			tenant_id = %actor.tenant_id,
			user_id = %actor.user_id,
			client_group_id = %request.client_group_id,
			mutations = request.mutations.len(),
		)
	)]
	pub async fn push(&self, actor: &Actor, request: &PushRequest) -> Result<PushReport> {
		let namespace = self.gate.resolve(&actor.tenant_id)?;

		// Held until after the commit so versions commit in clock order
		let (_writer, tx) = self.gate.begin_write(&namespace).await?;

		let report = match self.process(&tx, &namespace, actor, request).await {
			Ok(report) => report,
			Err(e) => {
				if let Err(rollback) = tx.rollback().await {
					error!(error = %rollback, "Failed to roll back push transaction");
				}
				warn!(error = %e, "Push aborted");
				return Err(e);
			}
		};

		tx.commit().await?;

		info!(?report, "Push committed");

		// Strictly after commit: pokes must never announce uncommitted state
		if let Some(notifier) = &self.notifier {
			notifier.notify(actor);
		}

		Ok(report)
	}

	async fn process(
		&self,
		tx: &TenantTx,
		namespace: &Namespace,
		actor: &Actor,
		request: &PushRequest,
	) -> Result<PushReport> {
		let mut report = PushReport::default();

		self.seed_clock(tx, namespace).await?;
		client::ensure_group(tx, &request.client_group_id, &actor.user_id, self.now()).await?;

		let mut clients: HashMap<&str, ClientRecord> = HashMap::new();

		for mutation in &request.mutations {
			let causal_version = self.admit(namespace, mutation)?;

			let record = match clients.get(mutation.client_id.as_str()) {
				Some(record) => record.clone(),
				None => {
					client::load_client(
						tx,
						&mutation.client_id,
						&request.client_group_id,
						self.now(),
					)
					.await?
				}
			};

			let expected = record.expected();
			if mutation.sequence_id < expected {
				debug!(
					client_id = %mutation.client_id,
					sequence_id = mutation.sequence_id,
					expected,
					"Skipping already applied mutation"
				);
				report.replayed += 1;
				clients.insert(&mutation.client_id, record);
				continue;
			}
			if mutation.sequence_id > expected {
				warn!(
					client_id = %mutation.client_id,
					sequence_id = mutation.sequence_id,
					expected,
					"Mutation gap, dropping until the client resends in order"
				);
				report.gaps += 1;
				clients.insert(&mutation.client_id, record);
				continue;
			}

			if !self.policy.allows(actor, &mutation.name) {
				warn!(
					client_id = %mutation.client_id,
					sequence_id = mutation.sequence_id,
					mutation = %mutation.name,
					role = %actor.role,
					required = ?self.policy.required_permission(&mutation.name),
					"Permission denied"
				);
				report.denied += 1;
			} else {
				match self.mutations.get(&mutation.name) {
					Some(handler) => {
						let causal_version = causal_version.pack();
						self.dispatch(tx, actor, handler.as_ref(), mutation, &causal_version, &mut report)
							.await?;
					}
					None => {
						warn!(
							client_id = %mutation.client_id,
							sequence_id = mutation.sequence_id,
							mutation = %mutation.name,
							"Unknown mutation"
						);
						report.unknown += 1;
					}
				}
			}

			client::set_last_mutation_id(tx, &mutation.client_id, mutation.sequence_id, self.now())
				.await?;
			clients.insert(
				&mutation.client_id,
				ClientRecord {
					last_mutation_id: mutation.sequence_id,
					..record
				},
			);
		}

		Ok(report)
	}

	/// Make sure the namespace clock starts above everything already stored
	async fn seed_clock(&self, tx: &TenantTx, namespace: &Namespace) -> Result<()> {
		if self.clocks.is_seeded(namespace.as_str()) {
			return Ok(());
		}

		let watermark = watermarks::current_watermark(tx, &self.entities).await?;
		let seed = Hlc::unpack(&watermark).ok();
		self.clocks.seed(namespace.as_str(), seed.as_ref());

		debug!(namespace = %namespace, %watermark, "Seeded namespace clock");

		Ok(())
	}

	/// Advance the namespace clock for one mutation, rejecting skewed clients
	fn admit(&self, namespace: &Namespace, mutation: &Mutation) -> Result<Hlc> {
		let now = self.time.current_time_ms();
		let limit = now.saturating_add(self.skew_threshold_ms);

		self.clocks.try_advance(namespace.as_str(), |local| {
			let next = match mutation.timestamp.as_deref().map(str::parse::<Hlc>) {
				Some(Ok(remote)) => local.receive_hlc(&remote, now),
				Some(Err(e)) => {
					warn!(
						client_id = %mutation.client_id,
						sequence_id = mutation.sequence_id,
						error = %e,
						"Ignoring malformed client clock"
					);
					local.tick(now)
				}
				None => local.tick(now),
			};

			if next.physical > limit {
				return Err(SyncError::ClockSkew {
					physical: next.physical,
					limit,
				});
			}

			Ok(next)
		})
	}

	async fn dispatch(
		&self,
		tx: &TenantTx,
		actor: &Actor,
		handler: &dyn MutationHandler,
		mutation: &Mutation,
		causal_version: &str,
		report: &mut PushReport,
	) -> Result<()> {
		let savepoint = tx.savepoint().await?;
		let ctx = MutationContext {
			tx: &savepoint,
			actor,
			causal_version,
			now: self.now(),
			history: &self.history,
		};

		let result = handler.apply(&ctx, &mutation.args).await;

		match result {
			Ok(()) => {
				savepoint.commit().await?;
				debug!(
					client_id = %mutation.client_id,
					sequence_id = mutation.sequence_id,
					mutation = %mutation.name,
					%causal_version,
					"Applied mutation"
				);
				report.applied += 1;
			}
			Err(MutationError::VersionConflict(conflict)) => {
				savepoint.rollback().await?;
				warn!(
					client_id = %mutation.client_id,
					sequence_id = mutation.sequence_id,
					mutation = %mutation.name,
					entity_id = %conflict.entity_id,
					submitted = conflict.submitted,
					stored = conflict.stored,
					"Version conflict"
				);
				self.handle_conflict(tx, actor, handler, mutation, causal_version, &conflict)
					.await?;
				report.conflicts += 1;
			}
			Err(MutationError::Database(e)) => {
				if let Err(rollback) = savepoint.rollback().await {
					error!(error = %rollback, "Failed to roll back savepoint");
				}
				return Err(SyncError::Database(e));
			}
			Err(e) => {
				savepoint.rollback().await?;
				warn!(
					client_id = %mutation.client_id,
					sequence_id = mutation.sequence_id,
					mutation = %mutation.name,
					args = %mutation.args,
					error = %e,
					"Mutation failed, dropping it"
				);
				report.failed += 1;
			}
		}

		Ok(())
	}

	/// Audit the rejected write and make the loss visible in the live entity
	async fn handle_conflict(
		&self,
		tx: &TenantTx,
		actor: &Actor,
		handler: &dyn MutationHandler,
		mutation: &Mutation,
		causal_version: &str,
		conflict: &VersionConflict,
	) -> Result<()> {
		let history_id = self
			.history
			.log_rejected(
				tx,
				NewHistoryEntry {
					entity_id: conflict.entity_id.clone(),
					note_id: conflict.note_id.clone(),
					user_id: actor.user_id.clone(),
					mutation_type: mutation.name.clone(),
					args: mutation.args.clone(),
					snapshot: None,
				},
			)
			.await?;

		let message = format!(
			"{} by {} was rejected: it was based on version {} but version {} was already stored",
			mutation.name, actor.user_id, conflict.submitted, conflict.stored
		);

		// Best effort: a failed marker must not cost the rest of the batch
		let savepoint = tx.savepoint().await?;
		let ctx = MutationContext {
			tx: &savepoint,
			actor,
			causal_version,
			now: self.now(),
			history: &self.history,
		};

		match handler.inject_conflict(&ctx, conflict, &message).await {
			Ok(true) => {
				savepoint.commit().await?;
				debug!(%history_id, entity_id = %conflict.entity_id, "Injected conflict marker");
			}
			Ok(false) => {
				savepoint.rollback().await?;
				debug!(%history_id, entity_id = %conflict.entity_id, "No place for a conflict marker");
			}
			Err(MutationError::Database(e)) => {
				if let Err(rollback) = savepoint.rollback().await {
					error!(error = %rollback, "Failed to roll back savepoint");
				}
				return Err(SyncError::Database(e));
			}
			Err(e) => {
				savepoint.rollback().await?;
				error!(
					%history_id,
					entity_id = %conflict.entity_id,
					error = %e,
					"Failed to inject conflict marker"
				);
			}
		}

		Ok(())
	}

	fn now(&self) -> i64 {
		i64::try_from(self.time.current_time_ms()).unwrap_or(i64::MAX)
	}
}

//! History ledger
//!
//! Audit trail of every write, one row per (entity, actor, mutation type,
//! editing session). Rapid edits by the same actor fold into the row of their
//! session; the first edit after the merge window opens a new one, so coarse
//! restore points survive while the table stays compact.

use sea_orm::{
	sea_query::{Expr, Order, Query},
	DbErr, QueryResult,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::{
	tenant::TenantTx,
	time_source::{SystemTimeSource, TimeSource},
};
use crate::infra::db::schema::HistoryEntries;

/// Default session merge window (20 minutes)
pub const DEFAULT_MERGE_WINDOW_MS: u64 = 20 * 60 * 1000;

/// A write to record
#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
	pub entity_id: String,
	pub note_id: String,
	pub user_id: String,
	pub mutation_type: String,
	pub args: Value,
	pub snapshot: Option<Value>,
}

/// A stored history row
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
	pub id: String,
	pub entity_id: String,
	pub note_id: String,
	pub user_id: String,
	pub mutation_type: String,
	pub change_delta: Value,
	pub snapshot: Option<Value>,
	pub was_rejected: bool,
	pub timestamp: i64,
}

impl HistoryEntry {
	fn from_row(row: &QueryResult) -> Result<Self, DbErr> {
		let change_delta: String = row.try_get("", "change_delta")?;
		let snapshot: Option<String> = row.try_get("", "snapshot")?;

		Ok(Self {
			id: row.try_get("", "id")?,
			entity_id: row.try_get("", "entity_id")?,
			note_id: row.try_get("", "note_id")?,
			user_id: row.try_get("", "user_id")?,
			mutation_type: row.try_get("", "mutation_type")?,
			change_delta: parse_json(&change_delta)?,
			snapshot: snapshot.as_deref().map(parse_json).transpose()?,
			was_rejected: row.try_get("", "was_rejected")?,
			timestamp: row.try_get("", "timestamp")?,
		})
	}
}

fn parse_json(raw: &str) -> Result<Value, DbErr> {
	serde_json::from_str(raw).map_err(|e| DbErr::Json(e.to_string()))
}

fn to_json(value: &Value) -> String {
	value.to_string()
}

/// Append/merge logic for the audit trail
#[derive(Clone)]
pub struct HistoryLedger {
	merge_window_ms: u64,
	time: Arc<dyn TimeSource>,
}

impl Default for HistoryLedger {
	fn default() -> Self {
		Self::new(DEFAULT_MERGE_WINDOW_MS, Arc::new(SystemTimeSource))
	}
}

impl HistoryLedger {
	pub fn new(merge_window_ms: u64, time: Arc<dyn TimeSource>) -> Self {
		Self {
			merge_window_ms,
			time,
		}
	}

	pub fn merge_window_ms(&self) -> u64 {
		self.merge_window_ms
	}

	/// Record a write, folding it into the actor's open session when there is one
	///
	/// Returns the id of the row that now holds the write.
	pub async fn log_entry(&self, tx: &TenantTx, entry: NewHistoryEntry) -> Result<String, DbErr> {
		let now = self.now();

		if let Some((id, timestamp)) = self.latest_session(tx, &entry).await? {
			if now.saturating_sub(timestamp) < self.merge_window_ms as i64 {
				self.merge_into(tx, &id, &entry, now).await?;
				debug!(
					history_id = %id,
					entity_id = %entry.entity_id,
					mutation = %entry.mutation_type,
					"Merged write into open history session"
				);
				return Ok(id);
			}
		}

		self.append(tx, entry).await
	}

	/// Insert a new row, never merging
	pub async fn append(&self, tx: &TenantTx, entry: NewHistoryEntry) -> Result<String, DbErr> {
		let id = Uuid::new_v4().to_string();

		let stmt = Query::insert()
			.into_table(tx.table(HistoryEntries::Table))
			.columns([
				HistoryEntries::Id,
				HistoryEntries::EntityId,
				HistoryEntries::NoteId,
				HistoryEntries::UserId,
				HistoryEntries::MutationType,
				HistoryEntries::ChangeDelta,
				HistoryEntries::Snapshot,
				HistoryEntries::WasRejected,
				HistoryEntries::Timestamp,
			])
			.values_panic([
				id.clone().into(),
				entry.entity_id.into(),
				entry.note_id.into(),
				entry.user_id.into(),
				entry.mutation_type.into(),
				to_json(&entry.args).into(),
				entry.snapshot.as_ref().map(to_json).into(),
				false.into(),
				self.now().into(),
			])
			.to_owned();

		tx.execute(&stmt).await?;

		Ok(id)
	}

	pub async fn mark_rejected(&self, tx: &TenantTx, history_id: &str) -> Result<(), DbErr> {
		let stmt = Query::update()
			.table(tx.table(HistoryEntries::Table))
			.value(HistoryEntries::WasRejected, true)
			.and_where(Expr::col(HistoryEntries::Id).eq(history_id))
			.to_owned();

		tx.execute(&stmt).await?;

		Ok(())
	}

	/// Record an attempted write that lost an optimistic-lock race
	///
	/// Always a row of its own so it can never be folded into an accepted
	/// session.
	pub async fn log_rejected(&self, tx: &TenantTx, entry: NewHistoryEntry) -> Result<String, DbErr> {
		let id = self.append(tx, entry).await?;
		self.mark_rejected(tx, &id).await?;
		Ok(id)
	}

	pub async fn get(&self, tx: &TenantTx, history_id: &str) -> Result<Option<HistoryEntry>, DbErr> {
		let stmt = Query::select()
			.columns(all_columns())
			.from(tx.table(HistoryEntries::Table))
			.and_where(Expr::col(HistoryEntries::Id).eq(history_id))
			.to_owned();

		tx.query_one(&stmt)
			.await?
			.as_ref()
			.map(HistoryEntry::from_row)
			.transpose()
	}

	/// All rows for an entity, oldest first
	pub async fn entries_for_entity(
		&self,
		tx: &TenantTx,
		entity_id: &str,
	) -> Result<Vec<HistoryEntry>, DbErr> {
		let stmt = Query::select()
			.columns(all_columns())
			.from(tx.table(HistoryEntries::Table))
			.and_where(Expr::col(HistoryEntries::EntityId).eq(entity_id))
			.order_by(HistoryEntries::Timestamp, Order::Asc)
			.to_owned();

		tx.query_all(&stmt)
			.await?
			.iter()
			.map(HistoryEntry::from_row)
			.collect()
	}

	/// Latest accepted row of this actor's session, as (id, timestamp)
	async fn latest_session(
		&self,
		tx: &TenantTx,
		entry: &NewHistoryEntry,
	) -> Result<Option<(String, i64)>, DbErr> {
		let stmt = Query::select()
			.columns([HistoryEntries::Id, HistoryEntries::Timestamp])
			.from(tx.table(HistoryEntries::Table))
			.and_where(Expr::col(HistoryEntries::NoteId).eq(entry.note_id.as_str()))
			.and_where(Expr::col(HistoryEntries::EntityId).eq(entry.entity_id.as_str()))
			.and_where(Expr::col(HistoryEntries::UserId).eq(entry.user_id.as_str()))
			.and_where(Expr::col(HistoryEntries::MutationType).eq(entry.mutation_type.as_str()))
			.and_where(Expr::col(HistoryEntries::WasRejected).eq(false))
			.order_by(HistoryEntries::Timestamp, Order::Desc)
			.limit(1)
			.to_owned();

		match tx.query_one(&stmt).await? {
			Some(row) => Ok(Some((
				row.try_get("", "id")?,
				row.try_get("", "timestamp")?,
			))),
			None => Ok(None),
		}
	}

	async fn merge_into(
		&self,
		tx: &TenantTx,
		history_id: &str,
		entry: &NewHistoryEntry,
		now: i64,
	) -> Result<(), DbErr> {
		let mut stmt = Query::update();
		stmt.table(tx.table(HistoryEntries::Table))
			.value(HistoryEntries::ChangeDelta, to_json(&entry.args))
			.value(HistoryEntries::Timestamp, now)
			.and_where(Expr::col(HistoryEntries::Id).eq(history_id));

		// Keep the last known snapshot when this write carries none
		if let Some(snapshot) = &entry.snapshot {
			stmt.value(HistoryEntries::Snapshot, to_json(snapshot));
		}

		tx.execute(&stmt).await?;

		Ok(())
	}

	fn now(&self) -> i64 {
		i64::try_from(self.time.current_time_ms()).unwrap_or(i64::MAX)
	}
}

fn all_columns() -> [HistoryEntries; 9] {
	[
		HistoryEntries::Id,
		HistoryEntries::EntityId,
		HistoryEntries::NoteId,
		HistoryEntries::UserId,
		HistoryEntries::MutationType,
		HistoryEntries::ChangeDelta,
		HistoryEntries::Snapshot,
		HistoryEntries::WasRejected,
		HistoryEntries::Timestamp,
	]
}

//! Client group and client bookkeeping
//!
//! A client group is one user's set of local replicas (tabs, devices sharing
//! storage). Each client inside it carries the id of the last mutation the
//! server has resolved for it, which is what makes pushes idempotent.

use sea_orm::{
	sea_query::{Expr, OnConflict, Query},
	DbErr, QueryResult,
};
use std::collections::BTreeMap;

use super::{
	error::{Result, SyncError},
	tenant::TenantTx,
};
use crate::infra::db::schema::{SyncClientGroups, SyncClients};

/// One client's idempotency state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
	pub client_id: String,
	pub client_group_id: String,
	pub last_mutation_id: i64,
}

impl ClientRecord {
	fn from_row(row: &QueryResult) -> std::result::Result<Self, DbErr> {
		Ok(Self {
			client_id: row.try_get("", "client_id")?,
			client_group_id: row.try_get("", "client_group_id")?,
			last_mutation_id: row.try_get("", "last_mutation_id")?,
		})
	}

	/// Sequence id the server will accept next
	pub fn expected(&self) -> i64 {
		self.last_mutation_id + 1
	}
}

/// Create the group on first sight, or check it belongs to `user_id`
pub async fn ensure_group(tx: &TenantTx, client_group_id: &str, user_id: &str, now: i64) -> Result<()> {
	let insert = Query::insert()
		.into_table(tx.table(SyncClientGroups::Table))
		.columns([
			SyncClientGroups::ClientGroupId,
			SyncClientGroups::UserId,
			SyncClientGroups::CreatedAt,
		])
		.values_panic([client_group_id.into(), user_id.into(), now.into()])
		.on_conflict(
			OnConflict::column(SyncClientGroups::ClientGroupId)
				.do_nothing()
				.to_owned(),
		)
		.to_owned();

	tx.execute(&insert).await?;

	let select = Query::select()
		.column(SyncClientGroups::UserId)
		.from(tx.table(SyncClientGroups::Table))
		.and_where(Expr::col(SyncClientGroups::ClientGroupId).eq(client_group_id))
		.to_owned();

	let owner: Option<String> = match tx.query_one(&select).await? {
		Some(row) => Some(row.try_get("", "user_id")?),
		None => None,
	};

	match owner {
		Some(owner) if owner != user_id => Err(SyncError::ClientGroupMismatch {
			client_group_id: client_group_id.to_string(),
		}),
		_ => Ok(()),
	}
}

/// Resolve a client, creating it with `last_mutation_id = 0` if absent
///
/// On backends with row locks the row stays locked until the transaction
/// ends, so two pushes from one client cannot race its `last_mutation_id`.
pub async fn load_client(
	tx: &TenantTx,
	client_id: &str,
	client_group_id: &str,
	now: i64,
) -> Result<ClientRecord> {
	let insert = Query::insert()
		.into_table(tx.table(SyncClients::Table))
		.columns([
			SyncClients::ClientId,
			SyncClients::ClientGroupId,
			SyncClients::LastMutationId,
			SyncClients::UpdatedAt,
		])
		.values_panic([
			client_id.into(),
			client_group_id.into(),
			0i64.into(),
			now.into(),
		])
		.on_conflict(
			OnConflict::column(SyncClients::ClientId)
				.do_nothing()
				.to_owned(),
		)
		.to_owned();

	tx.execute(&insert).await?;

	let mut select = Query::select();
	select
		.columns([
			SyncClients::ClientId,
			SyncClients::ClientGroupId,
			SyncClients::LastMutationId,
		])
		.from(tx.table(SyncClients::Table))
		.and_where(Expr::col(SyncClients::ClientId).eq(client_id));

	if tx.supports_row_locks() {
		select.lock_exclusive();
	}

	let record = match tx.query_one(&select).await? {
		Some(row) => ClientRecord::from_row(&row)?,
		None => {
			return Err(SyncError::Database(DbErr::RecordNotFound(format!(
				"client {client_id}"
			))))
		}
	};

	if record.client_group_id != client_group_id {
		return Err(SyncError::ClientMismatch {
			client_id: client_id.to_string(),
		});
	}

	Ok(record)
}

pub async fn set_last_mutation_id(
	tx: &TenantTx,
	client_id: &str,
	last_mutation_id: i64,
	now: i64,
) -> std::result::Result<(), DbErr> {
	let stmt = Query::update()
		.table(tx.table(SyncClients::Table))
		.value(SyncClients::LastMutationId, last_mutation_id)
		.value(SyncClients::UpdatedAt, now)
		.and_where(Expr::col(SyncClients::ClientId).eq(client_id))
		.to_owned();

	tx.execute(&stmt).await?;

	Ok(())
}

/// `client_id -> last_mutation_id` for every client in the group
pub async fn last_mutation_ids(
	tx: &TenantTx,
	client_group_id: &str,
) -> std::result::Result<BTreeMap<String, i64>, DbErr> {
	let stmt = Query::select()
		.columns([SyncClients::ClientId, SyncClients::LastMutationId])
		.from(tx.table(SyncClients::Table))
		.and_where(Expr::col(SyncClients::ClientGroupId).eq(client_group_id))
		.to_owned();

	tx.query_all(&stmt)
		.await?
		.iter()
		.map(|row| {
			Ok((
				row.try_get("", "client_id")?,
				row.try_get("", "last_mutation_id")?,
			))
		})
		.collect()
}

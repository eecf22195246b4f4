//! Deletion markers
//!
//! A deleted row leaves a tombstone stamped with the causal version of the
//! delete. Pulls turn tombstones newer than the client's cookie into `del`
//! operations.

use sea_orm::{
	sea_query::{Alias, Expr, OnConflict, Order, Query},
	DbErr,
};

use super::tenant::TenantTx;
use crate::infra::db::schema::Tombstones;

/// Record that `entity_id` was deleted at `version`
///
/// Deleting an entity twice keeps the later version.
pub async fn record(
	tx: &TenantTx,
	entity_type: &str,
	entity_id: &str,
	version: &str,
) -> Result<(), DbErr> {
	let stmt = Query::insert()
		.into_table(tx.table(Tombstones::Table))
		.columns([
			Tombstones::EntityType,
			Tombstones::EntityId,
			Tombstones::DeletedAtVersion,
		])
		.values_panic([entity_type.into(), entity_id.into(), version.into()])
		.on_conflict(
			OnConflict::columns([Tombstones::EntityType, Tombstones::EntityId])
				.update_column(Tombstones::DeletedAtVersion)
				.to_owned(),
		)
		.to_owned();

	tx.execute(&stmt).await?;

	Ok(())
}

/// Remove a tombstone when its entity is recreated
pub async fn clear(tx: &TenantTx, entity_type: &str, entity_id: &str) -> Result<(), DbErr> {
	let stmt = Query::delete()
		.from_table(tx.table(Tombstones::Table))
		.and_where(Expr::col(Tombstones::EntityType).eq(entity_type))
		.and_where(Expr::col(Tombstones::EntityId).eq(entity_id))
		.to_owned();

	tx.execute(&stmt).await?;

	Ok(())
}

/// Ids of `entity_type` rows deleted after `cookie`
pub async fn deleted_since(
	tx: &TenantTx,
	entity_type: &str,
	cookie: &str,
) -> Result<Vec<String>, DbErr> {
	let stmt = Query::select()
		.column(Tombstones::EntityId)
		.from(tx.table(Tombstones::Table))
		.and_where(Expr::col(Tombstones::EntityType).eq(entity_type))
		.and_where(Expr::col(Tombstones::DeletedAtVersion).gt(cookie))
		.order_by(Tombstones::DeletedAtVersion, Order::Asc)
		.to_owned();

	tx.query_all(&stmt)
		.await?
		.iter()
		.map(|row| row.try_get("", "entity_id"))
		.collect()
}

/// Highest deletion version in the namespace
pub async fn max_version(tx: &TenantTx) -> Result<Option<String>, DbErr> {
	let stmt = Query::select()
		.expr_as(
			Expr::col(Tombstones::DeletedAtVersion).max(),
			Alias::new("watermark"),
		)
		.from(tx.table(Tombstones::Table))
		.to_owned();

	match tx.query_one(&stmt).await? {
		Some(row) => row.try_get("", "watermark"),
		None => Ok(None),
	}
}

//! Core tables every tenant namespace carries
//!
//! Entity tables (notes, ...) are contributed by the registered syncable
//! entities; see [`crate::infra::sync::SyncableEntity::schema`].

use sea_orm::{
	sea_query::{ColumnDef, Index, Table, TableCreateStatement},
	DeriveIden,
};

use crate::infra::sync::Namespace;

#[derive(DeriveIden)]
pub enum SyncClientGroups {
	Table,
	ClientGroupId,
	UserId,
	CreatedAt,
}

#[derive(DeriveIden)]
pub enum SyncClients {
	Table,
	ClientId,
	ClientGroupId,
	LastMutationId,
	UpdatedAt,
}

#[derive(DeriveIden)]
pub enum HistoryEntries {
	Table,
	Id,
	EntityId,
	NoteId,
	UserId,
	MutationType,
	ChangeDelta,
	Snapshot,
	WasRejected,
	Timestamp,
}

#[derive(DeriveIden)]
pub enum Tombstones {
	Table,
	EntityType,
	EntityId,
	DeletedAtVersion,
}

/// `CREATE TABLE` statements for the core tables of `namespace`
pub fn core_tables(namespace: &Namespace) -> Vec<TableCreateStatement> {
	vec![
		Table::create()
			.table(namespace.table(SyncClientGroups::Table))
			.if_not_exists()
			.col(
				ColumnDef::new(SyncClientGroups::ClientGroupId)
					.string()
					.not_null()
					.primary_key(),
			)
			.col(ColumnDef::new(SyncClientGroups::UserId).string().not_null())
			.col(
				ColumnDef::new(SyncClientGroups::CreatedAt)
					.big_integer()
					.not_null(),
			)
			.to_owned(),
		Table::create()
			.table(namespace.table(SyncClients::Table))
			.if_not_exists()
			.col(
				ColumnDef::new(SyncClients::ClientId)
					.string()
					.not_null()
					.primary_key(),
			)
			.col(ColumnDef::new(SyncClients::ClientGroupId).string().not_null())
			.col(
				ColumnDef::new(SyncClients::LastMutationId)
					.big_integer()
					.not_null()
					.default(0),
			)
			.col(ColumnDef::new(SyncClients::UpdatedAt).big_integer().not_null())
			.to_owned(),
		Table::create()
			.table(namespace.table(HistoryEntries::Table))
			.if_not_exists()
			.col(
				ColumnDef::new(HistoryEntries::Id)
					.string()
					.not_null()
					.primary_key(),
			)
			.col(ColumnDef::new(HistoryEntries::EntityId).string().not_null())
			.col(ColumnDef::new(HistoryEntries::NoteId).string().not_null())
			.col(ColumnDef::new(HistoryEntries::UserId).string().not_null())
			.col(ColumnDef::new(HistoryEntries::MutationType).string().not_null())
			.col(ColumnDef::new(HistoryEntries::ChangeDelta).text().not_null())
			.col(ColumnDef::new(HistoryEntries::Snapshot).text())
			.col(
				ColumnDef::new(HistoryEntries::WasRejected)
					.boolean()
					.not_null()
					.default(false),
			)
			.col(
				ColumnDef::new(HistoryEntries::Timestamp)
					.big_integer()
					.not_null(),
			)
			.to_owned(),
		Table::create()
			.table(namespace.table(Tombstones::Table))
			.if_not_exists()
			.col(ColumnDef::new(Tombstones::EntityType).string().not_null())
			.col(ColumnDef::new(Tombstones::EntityId).string().not_null())
			.col(
				ColumnDef::new(Tombstones::DeletedAtVersion)
					.string()
					.not_null(),
			)
			.primary_key(
				Index::create()
					.col(Tombstones::EntityType)
					.col(Tombstones::EntityId),
			)
			.to_owned(),
	]
}

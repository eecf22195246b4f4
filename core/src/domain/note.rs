//! Notes: the reference content type
//!
//! A note is a title, a set of tags and a JSON block tree (`content`). Its
//! mutations (`createNote`, `updateNote`, `deleteNote`, `revertNote`) plug
//! into the mutation registry and [`NoteEntity`] plugs into pull, where the
//! `tags` filter acts as the lens.

use async_trait::async_trait;
use sea_orm::{
	sea_query::{Alias, ColumnDef, Expr, Query, Table, TableCreateStatement},
	DbErr, DeriveIden, QueryResult,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::infra::sync::{
	conflict::inject_marker, tombstone, MutationContext, MutationError, MutationHandler,
	MutationRegistry, Namespace, NewHistoryEntry, PatchOperation, PullFilter, SyncableEntity,
	SyncableRegistry, TenantTx, VersionConflict, ZERO_WATERMARK,
};

pub const ENTITY_TYPE: &str = "note";

#[derive(DeriveIden)]
pub enum Notes {
	Table,
	Id,
	Title,
	Content,
	Tags,
	OwnerId,
	Version,
	GlobalVersion,
	CreatedAt,
	UpdatedAt,
}

/// A stored note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
	pub id: String,
	pub title: String,
	pub content: Value,
	pub tags: Vec<String>,
	pub owner_id: String,
	pub version: i64,
	pub global_version: String,
	pub created_at: i64,
	pub updated_at: i64,
}

impl Note {
	fn from_row(row: &QueryResult) -> Result<Self, DbErr> {
		let content: String = row.try_get("", "content")?;
		let tags: String = row.try_get("", "tags")?;

		Ok(Self {
			id: row.try_get("", "id")?,
			title: row.try_get("", "title")?,
			content: serde_json::from_str(&content).map_err(|e| DbErr::Json(e.to_string()))?,
			tags: serde_json::from_str(&tags).map_err(|e| DbErr::Json(e.to_string()))?,
			owner_id: row.try_get("", "owner_id")?,
			version: row.try_get("", "version")?,
			global_version: row.try_get("", "global_version")?,
			created_at: row.try_get("", "created_at")?,
			updated_at: row.try_get("", "updated_at")?,
		})
	}

	fn to_value(&self) -> Result<Value, MutationError> {
		Ok(serde_json::to_value(self)?)
	}

	/// Whether the note is visible through a tag lens
	pub fn matches(&self, filter: &PullFilter) -> bool {
		match &filter.tags {
			Some(allowed) => self.tags.iter().any(|tag| allowed.contains(tag)),
			None => true,
		}
	}
}

fn columns() -> [Notes; 9] {
	[
		Notes::Id,
		Notes::Title,
		Notes::Content,
		Notes::Tags,
		Notes::OwnerId,
		Notes::Version,
		Notes::GlobalVersion,
		Notes::CreatedAt,
		Notes::UpdatedAt,
	]
}

fn empty_document() -> Value {
	json!({ "children": [] })
}

fn decode<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T, MutationError> {
	serde_json::from_value(args.clone()).map_err(|e| MutationError::Validation(e.to_string()))
}

fn require_id(id: &str) -> Result<(), MutationError> {
	if id.trim().is_empty() {
		return Err(MutationError::Validation("note id must not be empty".to_string()));
	}
	Ok(())
}

/// Read a note without locking it
pub async fn get(tx: &TenantTx, id: &str) -> Result<Option<Note>, DbErr> {
	select(tx, id, false).await
}

/// Load a note for writing, locking its row where the backend can
async fn load(tx: &TenantTx, id: &str) -> Result<Option<Note>, DbErr> {
	select(tx, id, tx.supports_row_locks()).await
}

async fn select(tx: &TenantTx, id: &str, lock: bool) -> Result<Option<Note>, DbErr> {
	let mut select = Query::select();
	select
		.columns(columns())
		.from(tx.table(Notes::Table))
		.and_where(Expr::col(Notes::Id).eq(id));

	if lock {
		select.lock_exclusive();
	}

	tx.query_one(&select).await?.as_ref().map(Note::from_row).transpose()
}

async fn insert(tx: &TenantTx, note: &Note) -> Result<(), MutationError> {
	let stmt = Query::insert()
		.into_table(tx.table(Notes::Table))
		.columns(columns())
		.values_panic([
			note.id.clone().into(),
			note.title.clone().into(),
			note.content.to_string().into(),
			serde_json::to_string(&note.tags)?.into(),
			note.owner_id.clone().into(),
			note.version.into(),
			note.global_version.clone().into(),
			note.created_at.into(),
			note.updated_at.into(),
		])
		.to_owned();

	tx.execute(&stmt).await?;
	tombstone::clear(tx, ENTITY_TYPE, &note.id).await?;

	Ok(())
}

async fn update(tx: &TenantTx, note: &Note) -> Result<(), MutationError> {
	let stmt = Query::update()
		.table(tx.table(Notes::Table))
		.value(Notes::Title, note.title.clone())
		.value(Notes::Content, note.content.to_string())
		.value(Notes::Tags, serde_json::to_string(&note.tags)?)
		.value(Notes::Version, note.version)
		.value(Notes::GlobalVersion, note.global_version.clone())
		.value(Notes::UpdatedAt, note.updated_at)
		.and_where(Expr::col(Notes::Id).eq(note.id.as_str()))
		.to_owned();

	tx.execute(&stmt).await?;

	Ok(())
}

/// Compare the client's base version with the stored one
fn check_version(
	note: &Note,
	submitted: i64,
	target_id: Option<&str>,
) -> Result<(), MutationError> {
	if submitted == note.version {
		return Ok(());
	}

	Err(MutationError::VersionConflict(VersionConflict {
		entity_type: ENTITY_TYPE.to_string(),
		entity_id: note.id.clone(),
		note_id: note.id.clone(),
		target_id: target_id.map(str::to_string),
		submitted,
		stored: note.version,
	}))
}

async fn log(
	ctx: &MutationContext<'_>,
	note_id: &str,
	mutation_type: &str,
	args: &Value,
	snapshot: Value,
) -> Result<String, MutationError> {
	Ok(ctx
		.history
		.log_entry(
			ctx.tx,
			NewHistoryEntry {
				entity_id: note_id.to_string(),
				note_id: note_id.to_string(),
				user_id: ctx.actor.user_id.clone(),
				mutation_type: mutation_type.to_string(),
				args: args.clone(),
				snapshot: Some(snapshot),
			},
		)
		.await?)
}

/// Place a conflict marker next to the block that lost the write
///
/// Falls back to the document root when the block is gone. Only
/// `global_version` moves: the marker is not a client write, so it must not
/// invalidate other clients' base versions.
async fn inject_note_conflict(
	ctx: &MutationContext<'_>,
	conflict: &VersionConflict,
	message: &str,
) -> Result<bool, MutationError> {
	let Some(mut note) = load(ctx.tx, &conflict.entity_id).await? else {
		return Ok(false);
	};

	let placed = inject_marker(&mut note.content, conflict.target_id.as_deref(), message)
		|| inject_marker(&mut note.content, None, message);
	if !placed {
		return Ok(false);
	}

	note.global_version = ctx.causal_version.to_string();
	note.updated_at = ctx.now;
	update(ctx.tx, &note).await?;

	Ok(true)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateNoteArgs {
	id: String,
	#[serde(default)]
	title: String,
	#[serde(default)]
	content: Option<Value>,
	#[serde(default)]
	tags: Vec<String>,
}

pub struct CreateNote;

#[async_trait]
impl MutationHandler for CreateNote {
	async fn apply(&self, ctx: &MutationContext<'_>, args: &Value) -> Result<(), MutationError> {
		let args: CreateNoteArgs = decode(args)?;
		require_id(&args.id)?;

		if load(ctx.tx, &args.id).await?.is_some() {
			return Err(MutationError::Validation(format!("note {} already exists", args.id)));
		}

		let now = ctx.now;
		let note = Note {
			id: args.id,
			title: args.title,
			content: args.content.unwrap_or_else(empty_document),
			tags: args.tags,
			owner_id: ctx.actor.user_id.clone(),
			version: 1,
			global_version: ctx.causal_version.to_string(),
			created_at: now,
			updated_at: now,
		};

		insert(ctx.tx, &note).await?;
		log(ctx, &note.id, "createNote", &json!({ "title": note.title, "tags": note.tags }), note.to_value()?)
			.await?;

		Ok(())
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateNoteArgs {
	id: String,
	version: i64,
	#[serde(default)]
	title: Option<String>,
	#[serde(default)]
	content: Option<Value>,
	#[serde(default)]
	tags: Option<Vec<String>>,
	/// Block the edit was aimed at, for conflict markers
	#[serde(default)]
	block_id: Option<String>,
}

pub struct UpdateNote;

#[async_trait]
impl MutationHandler for UpdateNote {
	async fn apply(&self, ctx: &MutationContext<'_>, raw: &Value) -> Result<(), MutationError> {
		let args: UpdateNoteArgs = decode(raw)?;
		require_id(&args.id)?;

		let mut note = load(ctx.tx, &args.id)
			.await?
			.ok_or_else(|| MutationError::NotFound(format!("note {}", args.id)))?;
		check_version(&note, args.version, args.block_id.as_deref())?;

		if let Some(title) = args.title {
			note.title = title;
		}
		if let Some(content) = args.content {
			note.content = content;
		}
		if let Some(tags) = args.tags {
			note.tags = tags;
		}
		note.version += 1;
		note.global_version = ctx.causal_version.to_string();
		note.updated_at = ctx.now;

		update(ctx.tx, &note).await?;
		log(ctx, &note.id, "updateNote", raw, note.to_value()?).await?;

		Ok(())
	}

	async fn inject_conflict(
		&self,
		ctx: &MutationContext<'_>,
		conflict: &VersionConflict,
		message: &str,
	) -> Result<bool, MutationError> {
		inject_note_conflict(ctx, conflict, message).await
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteNoteArgs {
	id: String,
	/// Omitted by clients that delete unconditionally
	#[serde(default)]
	version: Option<i64>,
}

pub struct DeleteNote;

#[async_trait]
impl MutationHandler for DeleteNote {
	async fn apply(&self, ctx: &MutationContext<'_>, raw: &Value) -> Result<(), MutationError> {
		let args: DeleteNoteArgs = decode(raw)?;
		require_id(&args.id)?;

		let note = load(ctx.tx, &args.id)
			.await?
			.ok_or_else(|| MutationError::NotFound(format!("note {}", args.id)))?;
		if let Some(version) = args.version {
			check_version(&note, version, None)?;
		}

		let stmt = Query::delete()
			.from_table(ctx.tx.table(Notes::Table))
			.and_where(Expr::col(Notes::Id).eq(note.id.as_str()))
			.to_owned();
		ctx.tx.execute(&stmt).await?;
		tombstone::record(ctx.tx, ENTITY_TYPE, &note.id, ctx.causal_version).await?;

		// The last state is kept so the note can be restored
		log(ctx, &note.id, "deleteNote", raw, note.to_value()?).await?;

		Ok(())
	}

	async fn inject_conflict(
		&self,
		ctx: &MutationContext<'_>,
		conflict: &VersionConflict,
		message: &str,
	) -> Result<bool, MutationError> {
		inject_note_conflict(ctx, conflict, message).await
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevertNoteArgs {
	history_id: String,
	#[serde(default)]
	version: Option<i64>,
}

/// Restore a note to the state captured by one of its history rows
///
/// Recreates the note if it was deleted since.
pub struct RevertNote;

#[async_trait]
impl MutationHandler for RevertNote {
	async fn apply(&self, ctx: &MutationContext<'_>, raw: &Value) -> Result<(), MutationError> {
		let args: RevertNoteArgs = decode(raw)?;

		let entry = ctx
			.history
			.get(ctx.tx, &args.history_id)
			.await?
			.ok_or_else(|| MutationError::NotFound(format!("history entry {}", args.history_id)))?;
		let snapshot: Note = match entry.snapshot {
			Some(snapshot) => serde_json::from_value(snapshot)?,
			None => {
				return Err(MutationError::Validation(format!(
					"history entry {} has no snapshot",
					args.history_id
				)))
			}
		};

		let now = ctx.now;
		let restored = match load(ctx.tx, &snapshot.id).await? {
			Some(current) => {
				if let Some(version) = args.version {
					check_version(&current, version, None)?;
				}
				let restored = Note {
					title: snapshot.title,
					content: snapshot.content,
					tags: snapshot.tags,
					version: current.version + 1,
					global_version: ctx.causal_version.to_string(),
					updated_at: now,
					..current
				};
				update(ctx.tx, &restored).await?;
				restored
			}
			None => {
				let restored = Note {
					version: 1,
					global_version: ctx.causal_version.to_string(),
					created_at: now,
					updated_at: now,
					..snapshot
				};
				insert(ctx.tx, &restored).await?;
				restored
			}
		};

		log(ctx, &restored.id, "revertNote", raw, restored.to_value()?).await?;

		Ok(())
	}

	async fn inject_conflict(
		&self,
		ctx: &MutationContext<'_>,
		conflict: &VersionConflict,
		message: &str,
	) -> Result<bool, MutationError> {
		inject_note_conflict(ctx, conflict, message).await
	}
}

/// Pull side of notes
pub struct NoteEntity;

#[async_trait]
impl SyncableEntity for NoteEntity {
	fn entity_type(&self) -> &'static str {
		ENTITY_TYPE
	}

	fn schema(&self, namespace: &Namespace) -> Vec<TableCreateStatement> {
		vec![Table::create()
			.table(namespace.table(Notes::Table))
			.if_not_exists()
			.col(ColumnDef::new(Notes::Id).string().not_null().primary_key())
			.col(ColumnDef::new(Notes::Title).string().not_null())
			.col(ColumnDef::new(Notes::Content).text().not_null())
			.col(ColumnDef::new(Notes::Tags).text().not_null())
			.col(ColumnDef::new(Notes::OwnerId).string().not_null())
			.col(ColumnDef::new(Notes::Version).big_integer().not_null())
			.col(ColumnDef::new(Notes::GlobalVersion).string().not_null())
			.col(ColumnDef::new(Notes::CreatedAt).big_integer().not_null())
			.col(ColumnDef::new(Notes::UpdatedAt).big_integer().not_null())
			.to_owned()]
	}

	async fn watermark(&self, tx: &TenantTx) -> Result<Option<String>, DbErr> {
		let stmt = Query::select()
			.expr_as(Expr::col(Notes::GlobalVersion).max(), Alias::new("watermark"))
			.from(tx.table(Notes::Table))
			.to_owned();

		match tx.query_one(&stmt).await? {
			Some(row) => row.try_get("", "watermark"),
			None => Ok(None),
		}
	}

	async fn patch_since(
		&self,
		tx: &TenantTx,
		cookie: &str,
		filter: &PullFilter,
	) -> Result<Vec<PatchOperation>, DbErr> {
		let stmt = Query::select()
			.columns(columns())
			.from(tx.table(Notes::Table))
			.and_where(Expr::col(Notes::GlobalVersion).gt(cookie))
			.to_owned();

		let fresh = cookie == ZERO_WATERMARK;
		let mut patch = Vec::new();

		for row in tx.query_all(&stmt).await? {
			let note = Note::from_row(&row)?;
			let key = self.key(&note.id);

			if note.matches(filter) {
				let value = serde_json::to_value(&note).map_err(|e| DbErr::Json(e.to_string()))?;
				patch.push(PatchOperation::Put { key, value });
			} else if !fresh {
				// The note left the lens; drop it from the client's cache
				patch.push(PatchOperation::Del { key });
			}
		}

		Ok(patch)
	}
}

/// Register the note mutations and entity
pub fn register(mutations: &mut MutationRegistry, entities: &mut SyncableRegistry) {
	mutations
		.register("createNote", Arc::new(CreateNote))
		.register("updateNote", Arc::new(UpdateNote))
		.register("deleteNote", Arc::new(DeleteNote))
		.register("revertNote", Arc::new(RevertNote));

	entities.register(Arc::new(NoteEntity));
}

#[cfg(test)]
mod tests {
	use super::*;

	fn note(tags: &[&str]) -> Note {
		Note {
			id: "N1".into(),
			title: "A".into(),
			content: empty_document(),
			tags: tags.iter().map(|t| t.to_string()).collect(),
			owner_id: "u1".into(),
			version: 1,
			global_version: "1700000000000:0000:s".into(),
			created_at: 0,
			updated_at: 0,
		}
	}

	#[test]
	fn test_tag_lens() {
		let work = PullFilter {
			tags: Some(vec!["work".into()]),
			..Default::default()
		};

		assert!(note(&["work", "todo"]).matches(&work));
		assert!(!note(&["home"]).matches(&work));
		assert!(!note(&[]).matches(&work));
		assert!(note(&[]).matches(&PullFilter::default()));
	}

	#[test]
	fn test_version_check() {
		let stored = note(&[]);
		assert!(check_version(&stored, 1, None).is_ok());

		match check_version(&stored, 0, Some("b1")) {
			Err(MutationError::VersionConflict(conflict)) => {
				assert_eq!(conflict.entity_id, "N1");
				assert_eq!(conflict.target_id.as_deref(), Some("b1"));
				assert_eq!((conflict.submitted, conflict.stored), (0, 1));
			}
			other => panic!("expected conflict, got {other:?}"),
		}
	}

	#[test]
	fn test_args_decoding() {
		let args: UpdateNoteArgs =
			decode(&json!({ "id": "N1", "version": 3, "blockId": "b2" })).unwrap();
		assert_eq!(args.block_id.as_deref(), Some("b2"));
		assert!(args.title.is_none());

		assert!(matches!(
			decode::<UpdateNoteArgs>(&json!({ "id": "N1" })),
			Err(MutationError::Validation(_))
		));
	}
}

//! Tenant isolation tests

mod helpers;

use helpers::*;
use quire_core::{
	config::SyncConfig,
	domain::{note, Note},
	infra::sync::{Actor, FakeTimeSource, PushRequest, SyncError},
	Core,
};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_tenants_do_not_see_each_other() -> anyhow::Result<()> {
	let t = TestCore::new().await?;
	t.core.provision_tenant("globex").await?;

	let alice = editor();
	let greta = Actor::new("greta", "owner", "globex");

	t.push(&alice, vec![mutation(1, "createNote", json!({ "id": "N1", "title": "acme" }))])
		.await?;

	// Same note id, same client ids, other tenant
	t.push(&greta, vec![mutation(1, "createNote", json!({ "id": "N1", "title": "globex" }))])
		.await?;

	assert_eq!(t.note("N1").await?.unwrap().title, "acme");

	let pulled = t.pull(&greta, None).await?;
	assert_eq!(pulled.patch.len(), 2);
	let serialized = serde_json::to_string(&pulled.patch)?;
	assert!(serialized.contains("\"globex\""));
	assert!(!serialized.contains("\"acme\""));

	Ok(())
}

#[tokio::test]
async fn test_lookalike_tenant_ids_are_rejected() -> anyhow::Result<()> {
	let t = TestCore::new().await?;
	t.core.provision_tenant("acme_corp").await?;

	let owner = Actor::new("olga", "owner", "acme_corp");
	t.push(&owner, vec![mutation(1, "createNote", json!({ "id": "SECRET", "title": "private" }))])
		.await?;

	// Ids that differ only in punctuation or case never reach that namespace
	for tenant in ["acme-corp", "acme.corp", "Acme_Corp", "ACME CORP"] {
		assert!(t.core.provision_tenant(tenant).await.is_err());

		let outsider = Actor::new("bob", "owner", tenant);
		let err = t.pull(&outsider, None).await.unwrap_err();
		assert!(
			matches!(err.downcast_ref::<SyncError>(), Some(SyncError::InvalidNamespace(_))),
			"{tenant:?} should be rejected"
		);

		let err = t
			.push(&outsider, vec![mutation(1, "deleteNote", json!({ "id": "SECRET" }))])
			.await
			.unwrap_err();
		assert!(matches!(err.downcast_ref::<SyncError>(), Some(SyncError::InvalidNamespace(_))));
	}

	// The owner's note is untouched
	let pulled = t.pull(&owner, None).await?;
	assert_eq!(pulled.patch.len(), 2);

	Ok(())
}

#[tokio::test]
async fn test_client_group_belongs_to_first_user() -> anyhow::Result<()> {
	let t = TestCore::new().await?;

	t.push(&editor(), vec![mutation(1, "createNote", json!({ "id": "N1" }))])
		.await?;

	let mallory = Actor::new("mallory", "owner", TENANT);
	let request = PushRequest {
		client_group_id: CLIENT_GROUP.to_string(),
		mutations: vec![mutation(2, "deleteNote", json!({ "id": "N1" }))],
	};

	let result = t.core.push.push(&mallory, &request).await;
	assert!(matches!(result, Err(SyncError::ClientGroupMismatch { .. })));
	assert!(t.note("N1").await?.is_some());

	Ok(())
}

#[tokio::test]
async fn test_namespaces_survive_restart() -> anyhow::Result<()> {
	let temp = tempfile::TempDir::new()?;
	let mut config = SyncConfig::default_with_dir(temp.path().to_path_buf());
	config.node_id = "server-test".to_string();

	let push = |sequence_id: i64, id: &str| PushRequest {
		client_group_id: CLIENT_GROUP.to_string(),
		mutations: vec![mutation(sequence_id, "createNote", json!({ "id": id }))],
	};

	let time = FakeTimeSource::default();
	let first = {
		let core = Core::from_config(config.clone(), Arc::new(time.clone())).await?;
		core.provision_tenant(TENANT).await?;
		core.push.push(&editor(), &push(1, "N1")).await?;
		read_note(&core, "N1").await?.global_version
	};

	// A new process whose wall clock went back a minute re-attaches the
	// namespace and still stamps later versions
	let core = Core::from_config(config, Arc::new(FakeTimeSource::new(time.get() - 60_000))).await?;
	core.push.push(&editor(), &push(2, "N2")).await?;
	let second = read_note(&core, "N2").await?.global_version;

	assert!(second > first);

	Ok(())
}

async fn read_note(core: &Core, id: &str) -> anyhow::Result<Note> {
	let namespace = core.gate.resolve(TENANT)?;
	let tx = core.gate.begin(&namespace).await?;
	let note = note::get(&tx, id).await?;
	tx.rollback().await?;
	note.ok_or_else(|| anyhow::anyhow!("note {id} missing"))
}

//! Pull pipeline integration tests

mod helpers;

use helpers::*;
use quire_core::infra::sync::{
	Actor, Cookie, PatchOperation, PullFilter, PullRequest, SyncError, ZERO_WATERMARK,
};
use serde_json::json;

fn keys(patch: &[PatchOperation]) -> Vec<String> {
	patch
		.iter()
		.map(|op| match op {
			PatchOperation::Clear => "clear".to_string(),
			PatchOperation::Put { key, .. } => format!("put {key}"),
			PatchOperation::Del { key } => format!("del {key}"),
		})
		.collect()
}

#[tokio::test]
async fn test_fresh_pull_of_empty_tenant() -> anyhow::Result<()> {
	let t = TestCore::new().await?;

	let response = t.pull(&editor(), None).await?;

	assert_eq!(response.cookie, ZERO_WATERMARK);
	assert_eq!(response.patch, vec![PatchOperation::Clear]);
	assert_eq!(response.last_mutation_id_changes.get(CLIENT), Some(&0));

	Ok(())
}

#[tokio::test]
async fn test_fresh_sync_clears_and_incremental_does_not() -> anyhow::Result<()> {
	let t = TestCore::new().await?;
	let alice = editor();

	t.push(&alice, vec![mutation(1, "createNote", json!({ "id": "N1", "title": "A" }))])
		.await?;

	let fresh = t.pull(&alice, None).await?;
	assert_eq!(keys(&fresh.patch), vec!["clear", "put note/N1"]);
	assert_eq!(fresh.cookie, t.note("N1").await?.unwrap().global_version);
	assert_eq!(fresh.last_mutation_id_changes.get(CLIENT), Some(&1));

	// Zero in any wire form is a fresh sync too
	for cookie in [Cookie::Int(0), Cookie::Str("0".into())] {
		let response = t.pull(&alice, Some(cookie)).await?;
		assert_eq!(response.patch.first(), Some(&PatchOperation::Clear));
	}

	// Nothing changed since the cookie
	let incremental = t.pull(&alice, Some(Cookie::Str(fresh.cookie.clone()))).await?;
	assert!(incremental.patch.is_empty());
	assert_eq!(incremental.cookie, fresh.cookie);

	t.time.advance(1_000);
	t.push(
		&alice,
		vec![
			mutation(2, "updateNote", json!({ "id": "N1", "version": 1, "title": "B" })),
			mutation(3, "createNote", json!({ "id": "N2", "title": "C" })),
		],
	)
	.await?;

	let incremental = t.pull(&alice, Some(Cookie::Str(fresh.cookie.clone()))).await?;
	let mut changed = keys(&incremental.patch);
	changed.sort();
	assert_eq!(changed, vec!["put note/N1", "put note/N2"]);
	assert!(incremental.cookie > fresh.cookie);

	match &incremental.patch[..] {
		[PatchOperation::Put { value, .. }, ..] => assert!(value.get("globalVersion").is_some()),
		other => panic!("unexpected patch {other:?}"),
	}

	Ok(())
}

#[tokio::test]
async fn test_deletions_become_del_operations() -> anyhow::Result<()> {
	let t = TestCore::new().await?;
	let alice = editor();

	t.push(&alice, vec![mutation(1, "createNote", json!({ "id": "N1", "title": "A" }))])
		.await?;
	let before = t.pull(&alice, None).await?;

	t.push(&alice, vec![mutation(2, "deleteNote", json!({ "id": "N1", "version": 1 }))])
		.await?;

	let after = t.pull(&alice, Some(Cookie::Str(before.cookie.clone()))).await?;
	assert_eq!(keys(&after.patch), vec!["del note/N1"]);

	// The delete moved the watermark even though no row carries it
	assert!(after.cookie > before.cookie);

	// A fresh client never hears about rows it could not have
	let fresh = t.pull(&alice, None).await?;
	assert_eq!(keys(&fresh.patch), vec!["clear"]);

	Ok(())
}

#[tokio::test]
async fn test_time_travel_is_rejected() -> anyhow::Result<()> {
	let t = TestCore::new().await?;
	let alice = editor();

	t.push(&alice, vec![mutation(1, "createNote", json!({ "id": "N1" }))])
		.await?;

	let request = PullRequest {
		client_group_id: CLIENT_GROUP.to_string(),
		client_id: Some("client-x".to_string()),
		cookie: Some(Cookie::Str("9999999999999:0000:elsewhere".to_string())),
		filter: None,
	};

	let result = t.core.pull.pull(&alice, &request).await;
	assert!(matches!(result, Err(SyncError::ClientStateNotFound { .. })));

	// The rejected pull registered nothing
	assert_eq!(t.last_mutation_id("client-x").await?, None);

	Ok(())
}

#[tokio::test]
async fn test_unprovisioned_tenant_gets_empty_patch() -> anyhow::Result<()> {
	let t = TestCore::new().await?;
	let newcomer = Actor::new("nina", "owner", "brand_new_co");

	let response = t.pull(&newcomer, None).await?;

	assert_eq!(response.cookie, ZERO_WATERMARK);
	assert!(response.patch.is_empty());
	assert!(response.last_mutation_id_changes.is_empty());

	// Pushing there is a hard error
	let result = t.push(&newcomer, vec![mutation(1, "createNote", json!({ "id": "N1" }))]).await;
	assert!(result.is_err());

	Ok(())
}

#[tokio::test]
async fn test_tag_lens() -> anyhow::Result<()> {
	let t = TestCore::new().await?;
	let alice = editor();

	t.push(
		&alice,
		vec![
			mutation(1, "createNote", json!({ "id": "N1", "tags": ["work"] })),
			mutation(2, "createNote", json!({ "id": "N2", "tags": ["home"] })),
		],
	)
	.await?;

	let lens = PullFilter {
		tags: Some(vec!["work".to_string()]),
		..Default::default()
	};
	let request = |cookie: Option<Cookie>| PullRequest {
		client_group_id: CLIENT_GROUP.to_string(),
		client_id: Some(CLIENT.to_string()),
		cookie,
		filter: Some(lens.clone()),
	};

	let fresh = t.core.pull.pull(&alice, &request(None)).await?;
	assert_eq!(keys(&fresh.patch), vec!["clear", "put note/N1"]);

	// N1 leaves the lens
	t.push(
		&alice,
		vec![mutation(3, "updateNote", json!({ "id": "N1", "version": 1, "tags": ["home"] }))],
	)
	.await?;

	let incremental = t
		.core
		.pull
		.pull(&alice, &request(Some(Cookie::Str(fresh.cookie.clone()))))
		.await?;
	assert_eq!(keys(&incremental.patch), vec!["del note/N1"]);

	Ok(())
}

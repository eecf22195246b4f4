//! Common test harness and utilities for sync integration tests
//!
//! Builds a full core against a SQLite database in a temp dir, with a fake
//! clock, and provisions one tenant (`acme`).

#![allow(dead_code)]

use quire_core::{
	config::SyncConfig,
	domain::{note, Note},
	infra::sync::{
		client, Actor, FakeTimeSource, HistoryEntry, HistoryLedger, Mutation, PullRequest,
		Cookie, PullResponse, PushReport, PushRequest, TenantTx,
	},
	Core,
};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;

pub const TENANT: &str = "acme";
pub const CLIENT_GROUP: &str = "group-1";
pub const CLIENT: &str = "client-1";

/// A provisioned core plus the clock driving it
pub struct TestCore {
	pub core: Core,
	pub time: FakeTimeSource,
	_temp: TempDir,
}

impl TestCore {
	pub async fn new() -> anyhow::Result<Self> {
		let temp = TempDir::new()?;
		let time = FakeTimeSource::default();

		let mut config = SyncConfig::default_with_dir(temp.path().to_path_buf());
		config.node_id = "server-test".to_string();

		let core = Core::from_config(config, Arc::new(time.clone())).await?;
		core.provision_tenant(TENANT).await?;

		Ok(Self {
			core,
			time,
			_temp: temp,
		})
	}

	pub async fn push(&self, actor: &Actor, mutations: Vec<Mutation>) -> anyhow::Result<PushReport> {
		let request = PushRequest {
			client_group_id: CLIENT_GROUP.to_string(),
			mutations,
		};
		Ok(self.core.push.push(actor, &request).await?)
	}

	pub async fn pull(&self, actor: &Actor, cookie: Option<Cookie>) -> anyhow::Result<PullResponse> {
		let request = PullRequest {
			client_group_id: CLIENT_GROUP.to_string(),
			client_id: Some(CLIENT.to_string()),
			cookie,
			filter: None,
		};
		Ok(self.core.pull.pull(actor, &request).await?)
	}

	/// Open a transaction on the test tenant; callers roll it back
	pub async fn begin(&self) -> anyhow::Result<TenantTx> {
		let namespace = self.core.gate.resolve(TENANT)?;
		Ok(self.core.gate.begin(&namespace).await?)
	}

	pub async fn note(&self, id: &str) -> anyhow::Result<Option<Note>> {
		let tx = self.begin().await?;
		let note = note::get(&tx, id).await?;
		tx.rollback().await?;
		Ok(note)
	}

	pub async fn history(&self, entity_id: &str) -> anyhow::Result<Vec<HistoryEntry>> {
		let tx = self.begin().await?;
		let entries = HistoryLedger::default()
			.entries_for_entity(&tx, entity_id)
			.await?;
		tx.rollback().await?;
		Ok(entries)
	}

	pub async fn last_mutation_id(&self, client_id: &str) -> anyhow::Result<Option<i64>> {
		let tx = self.begin().await?;
		let ids = client::last_mutation_ids(&tx, CLIENT_GROUP).await?;
		tx.rollback().await?;
		Ok(ids.get(client_id).copied())
	}
}

pub fn editor() -> Actor {
	Actor::new("alice", "editor", TENANT)
}

pub fn viewer() -> Actor {
	Actor::new("victor", "viewer", TENANT)
}

pub fn mutation(sequence_id: i64, name: &str, args: Value) -> Mutation {
	Mutation {
		sequence_id,
		client_id: CLIENT.to_string(),
		name: name.to_string(),
		args,
		timestamp: None,
	}
}

/// Initialize tracing for a test
pub fn init_test_tracing() {
	use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

	let _ = tracing_subscriber::registry()
		.with(fmt::layer().with_target(true).with_test_writer())
		.with(
			EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| EnvFilter::new("quire_core=debug,helpers=trace")),
		)
		.try_init();
}

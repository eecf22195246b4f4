//! Quire sync core
//!
//! Multi-tenant, local-first synchronization: clients push batches of
//! mutations and pull incremental patches against a shared relational store.
//! Every write in a tenant namespace is ordered by a hybrid logical clock,
//! replayed mutations are applied once, and lost optimistic-lock races show
//! up as conflict markers instead of vanishing.

pub mod config;
pub mod domain;
pub mod infra;

use std::{path::PathBuf, sync::Arc};
use tracing::info;

use crate::{
	config::SyncConfig,
	infra::{
		db::Database,
		sync::{
			ClockRegistry, HistoryLedger, Namespace, PrefixResolver, PullPipeline, PushPipeline,
			SessionRegistry, SyncableRegistry, SystemTimeSource, TenantGate, TimeSource,
		},
	},
};

/// The assembled sync core
pub struct Core {
	/// Sync configuration
	config: SyncConfig,

	pub db: Arc<Database>,

	/// Tenant namespace resolution and pinned transactions
	pub gate: TenantGate,

	pub push: PushPipeline,

	pub pull: PullPipeline,

	/// Live sessions poked after every push
	pub sessions: SessionRegistry,

	/// Server clocks, one per namespace
	pub clocks: Arc<ClockRegistry>,

	entities: Arc<SyncableRegistry>,
}

impl Core {
	/// Initialize a new Core instance with default data directory
	pub async fn new() -> anyhow::Result<Self> {
		let data_dir = crate::config::default_data_dir()?;
		Self::new_with_config(data_dir).await
	}

	/// Initialize a new Core instance with custom data directory
	pub async fn new_with_config(data_dir: PathBuf) -> anyhow::Result<Self> {
		let config = SyncConfig::load_or_create(&data_dir)?;
		Self::from_config(config, Arc::new(SystemTimeSource)).await
	}

	/// Assemble a Core from an explicit config and clock source
	pub async fn from_config(config: SyncConfig, time: Arc<dyn TimeSource>) -> anyhow::Result<Self> {
		info!("Initializing Quire core at {:?}", config.data_dir);

		config.ensure_directories()?;

		let db = Arc::new(Database::connect(&config.database_url(), &config.data_dir).await?);

		let (mutations, entities) = domain::registries();
		let mutations = Arc::new(mutations);
		let entities = Arc::new(entities);
		info!(mutations = ?mutations.names(), entities = ?entities, "Registered content types");

		let gate = TenantGate::new(
			db.conn().clone(),
			Arc::new(PrefixResolver::new(config.namespace_prefix.clone())),
		);
		let clocks = Arc::new(ClockRegistry::new(config.node_id.clone()));
		let history = HistoryLedger::new(config.session_merge_window_ms(), time.clone());
		let sessions = SessionRegistry::new();

		let push = PushPipeline::new(
			gate.clone(),
			mutations,
			entities.clone(),
			Arc::new(config.permissions.clone()),
			clocks.clone(),
			history,
			time.clone(),
		)
		.with_notifier(Arc::new(sessions.clone()))
		.with_skew_threshold(config.clock_skew_threshold_ms);

		let pull = PullPipeline::new(gate.clone(), entities.clone(), time);

		Ok(Self {
			config,
			db,
			gate,
			push,
			pull,
			sessions,
			clocks,
			entities,
		})
	}

	pub fn config(&self) -> &SyncConfig {
		&self.config
	}

	/// Create (or complete) the namespace of a tenant
	pub async fn provision_tenant(&self, tenant_id: &str) -> anyhow::Result<Namespace> {
		let namespace = self.gate.resolve(tenant_id)?;
		self.db
			.provision_namespace(&namespace, self.entities.schema(&namespace))
			.await?;
		Ok(namespace)
	}
}

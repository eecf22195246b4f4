//! Database infrastructure using SeaORM
//!
//! One connection serves every tenant. Tenants live in namespaces: Postgres
//! schemas, or SQLite databases attached under the namespace name. Attached
//! databases are per connection, so the SQLite pool is pinned to a single
//! long-lived connection that carries every attachment.

use sea_orm::{
	sea_query::TableCreateStatement, ConnectOptions, ConnectionTrait, Database as SeaDatabase,
	DatabaseConnection, DbBackend, DbErr, Statement, TransactionTrait,
};
use std::{
	path::{Path, PathBuf},
	time::Duration,
};
use tracing::{debug, info};

use crate::infra::sync::Namespace;

pub mod schema;

/// SQLite attachments vanish with their connection, so it must never be recycled
const SQLITE_CONNECTION_LIFETIME: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Database wrapper for the sync core
pub struct Database {
	conn: DatabaseConnection,

	/// Where SQLite namespace files live (`<data_dir>/namespaces/<ns>.db`)
	namespaces_dir: PathBuf,
}

impl Database {
	/// Connect to `url`, keeping SQLite namespace files under `data_dir`
	pub async fn connect(url: &str, data_dir: &Path) -> Result<Self, DbErr> {
		let namespaces_dir = data_dir.join("namespaces");

		let mut opt = ConnectOptions::new(url.to_string());
		opt.connect_timeout(Duration::from_secs(8))
			.sqlx_logging(false); // We use tracing instead

		if url.starts_with("sqlite:") {
			std::fs::create_dir_all(&namespaces_dir)
				.map_err(|e| DbErr::Custom(format!("Failed to create directory: {}", e)))?;

			opt.max_connections(1)
				.min_connections(1)
				.idle_timeout(SQLITE_CONNECTION_LIFETIME)
				.max_lifetime(SQLITE_CONNECTION_LIFETIME);
		} else {
			opt.max_connections(16).min_connections(2);
		}

		let conn = SeaDatabase::connect(opt).await?;
		let db = Self {
			conn,
			namespaces_dir,
		};

		if db.backend() == DbBackend::Sqlite {
			db.attach_existing().await?;
		}

		info!(backend = ?db.backend(), "Connected to database");

		Ok(db)
	}

	/// Open (creating if needed) a SQLite database inside `data_dir`
	pub async fn open_sqlite(data_dir: &Path) -> Result<Self, DbErr> {
		std::fs::create_dir_all(data_dir)
			.map_err(|e| DbErr::Custom(format!("Failed to create directory: {}", e)))?;

		let url = format!("sqlite://{}?mode=rwc", data_dir.join("quire.db").display());
		Self::connect(&url, data_dir).await
	}

	pub fn conn(&self) -> &DatabaseConnection {
		&self.conn
	}

	pub fn backend(&self) -> DbBackend {
		self.conn.get_database_backend()
	}

	pub async fn is_provisioned(&self, namespace: &Namespace) -> Result<bool, DbErr> {
		namespace_exists(&self.conn, namespace).await
	}

	/// Create a tenant namespace with the core tables plus `entity_tables`
	///
	/// Idempotent: re-provisioning an existing namespace only creates missing
	/// tables.
	pub async fn provision_namespace(
		&self,
		namespace: &Namespace,
		entity_tables: Vec<TableCreateStatement>,
	) -> Result<(), DbErr> {
		match self.backend() {
			DbBackend::Sqlite => {
				if !self.is_provisioned(namespace).await? {
					self.attach(namespace).await?;
				}
			}
			_ => {
				self.conn
					.execute_unprepared(&format!("CREATE SCHEMA IF NOT EXISTS \"{namespace}\""))
					.await?;
			}
		}

		let backend = self.backend();
		let tx = self.conn.begin().await?;
		for table in schema::core_tables(namespace)
			.iter()
			.chain(entity_tables.iter())
		{
			tx.execute(backend.build(table)).await?;
		}
		tx.commit().await?;

		info!(namespace = %namespace, "Provisioned tenant namespace");

		Ok(())
	}

	async fn attach(&self, namespace: &Namespace) -> Result<(), DbErr> {
		let path = self.namespaces_dir.join(format!("{namespace}.db"));

		self.conn
			.execute(Statement::from_sql_and_values(
				DbBackend::Sqlite,
				format!("ATTACH DATABASE ? AS \"{namespace}\""),
				[path.display().to_string().into()],
			))
			.await?;

		debug!(namespace = %namespace, path = %path.display(), "Attached namespace database");

		Ok(())
	}

	/// Re-attach namespaces provisioned by a previous process
	async fn attach_existing(&self) -> Result<(), DbErr> {
		let entries = match std::fs::read_dir(&self.namespaces_dir) {
			Ok(entries) => entries,
			Err(_) => return Ok(()),
		};

		for entry in entries.flatten() {
			let path = entry.path();
			if path.extension().and_then(|e| e.to_str()) != Some("db") {
				continue;
			}

			let Some(namespace) = path
				.file_stem()
				.and_then(|s| s.to_str())
				.and_then(|s| Namespace::new(s).ok())
			else {
				continue;
			};

			if !self.is_provisioned(&namespace).await? {
				self.attach(&namespace).await?;
			}
		}

		Ok(())
	}
}

/// Whether `namespace` exists on the connection's backend
pub async fn namespace_exists<C: ConnectionTrait>(
	conn: &C,
	namespace: &Namespace,
) -> Result<bool, DbErr> {
	let backend = conn.get_database_backend();

	let stmt = match backend {
		DbBackend::Sqlite => Statement::from_sql_and_values(
			backend,
			"SELECT name FROM pragma_database_list WHERE name = ?",
			[namespace.as_str().into()],
		),
		_ => Statement::from_sql_and_values(
			backend,
			"SELECT schema_name FROM information_schema.schemata WHERE schema_name = $1",
			[namespace.as_str().into()],
		),
	};

	Ok(conn.query_one(stmt).await?.is_some())
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[tokio::test]
	async fn test_provision_and_reattach() {
		let temp = TempDir::new().unwrap();
		let namespace = Namespace::new("tenant_acme").unwrap();

		{
			let db = Database::open_sqlite(temp.path()).await.unwrap();
			assert!(!db.is_provisioned(&namespace).await.unwrap());

			db.provision_namespace(&namespace, vec![]).await.unwrap();
			assert!(db.is_provisioned(&namespace).await.unwrap());

			// Provisioning twice is harmless
			db.provision_namespace(&namespace, vec![]).await.unwrap();
		}

		let db = Database::open_sqlite(temp.path()).await.unwrap();
		assert!(db.is_provisioned(&namespace).await.unwrap());
	}
}

//! Tenant isolation gate
//!
//! Every push and pull runs inside one transaction that is pinned to the
//! tenant's namespace before any table is touched. A namespace is a Postgres
//! schema or an attached SQLite database; either way, table references are
//! built through [`TenantTx::table`], which qualifies them with the pinned
//! namespace. Code holding a `TenantTx` has no way to name another tenant's
//! tables.

use sea_orm::{
	sea_query::{Alias, IntoIden, IntoTableRef, TableRef},
	ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, DbErr, ExecResult,
	QueryResult, Statement, StatementBuilder, TransactionTrait,
};
use std::{
	collections::HashMap,
	fmt,
	sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use super::error::{Result, SyncError};
use crate::infra::db::namespace_exists;

/// Longest identifier Postgres accepts unquoted-equivalent
const MAX_NAMESPACE_LEN: usize = 63;

/// A validated tenant namespace name
///
/// Only lowercase ASCII letters, digits and underscores, starting with a
/// letter. Names are interpolated into `ATTACH` and `SET search_path`
/// statements, so nothing else is ever let through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace(String);

impl Namespace {
	pub fn new(name: impl Into<String>) -> Result<Self> {
		let name = name.into();

		let valid = !name.is_empty()
			&& name.len() <= MAX_NAMESPACE_LEN
			&& name.starts_with(|c: char| c.is_ascii_lowercase())
			&& name
				.chars()
				.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

		if valid {
			Ok(Self(name))
		} else {
			Err(SyncError::InvalidNamespace(name))
		}
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Qualify a table with this namespace
	pub fn table<T: IntoIden + 'static>(&self, table: T) -> TableRef {
		(Alias::new(self.0.as_str()), table).into_table_ref()
	}
}

impl fmt::Display for Namespace {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Maps a tenant id (from the identity resolver) to its namespace
pub trait NamespaceResolver: Send + Sync {
	fn resolve(&self, tenant_id: &str) -> Result<Namespace>;
}

/// Resolves `acme` to `tenant_acme`
///
/// Tenant ids are used verbatim, so two ids never share a namespace. Ids
/// outside `[a-z0-9_]` are rejected rather than rewritten.
#[derive(Debug, Clone)]
pub struct PrefixResolver {
	prefix: String,
}

impl PrefixResolver {
	pub fn new(prefix: impl Into<String>) -> Self {
		Self {
			prefix: prefix.into(),
		}
	}
}

impl Default for PrefixResolver {
	fn default() -> Self {
		Self::new("tenant_")
	}
}

impl NamespaceResolver for PrefixResolver {
	fn resolve(&self, tenant_id: &str) -> Result<Namespace> {
		let valid = !tenant_id.is_empty()
			&& tenant_id
				.chars()
				.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

		if !valid {
			return Err(SyncError::InvalidNamespace(tenant_id.to_string()));
		}

		Namespace::new(format!("{}{}", self.prefix, tenant_id))
	}
}

/// One writer lock per namespace
///
/// Writes in a namespace must commit in the order of their `global_version`,
/// otherwise a pull between two commits hands out a cookie above a row that
/// is not visible yet. Holding the lock from clock admission to commit keeps
/// the two orders equal within this process.
#[derive(Clone, Default)]
pub struct WriteLocks {
	locks: Arc<Mutex<HashMap<Namespace, Arc<AsyncMutex<()>>>>>,
}

impl WriteLocks {
	pub fn new() -> Self {
		Self::default()
	}

	/// Wait for exclusive write access to `namespace`
	pub async fn acquire(&self, namespace: &Namespace) -> OwnedMutexGuard<()> {
		let lock = self
			.locks
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.entry(namespace.clone())
			.or_default()
			.clone();

		lock.lock_owned().await
	}
}

/// Opens namespace-pinned transactions
#[derive(Clone)]
pub struct TenantGate {
	db: DatabaseConnection,
	resolver: Arc<dyn NamespaceResolver>,
	writers: WriteLocks,
}

impl TenantGate {
	pub fn new(db: DatabaseConnection, resolver: Arc<dyn NamespaceResolver>) -> Self {
		Self {
			db,
			resolver,
			writers: WriteLocks::new(),
		}
	}

	pub fn resolve(&self, tenant_id: &str) -> Result<Namespace> {
		self.resolver.resolve(tenant_id)
	}

	pub fn connection(&self) -> &DatabaseConnection {
		&self.db
	}

	/// Begin a transaction pinned to `namespace`
	///
	/// Fails with [`SyncError::TenantNotProvisioned`] when the namespace does
	/// not exist yet.
	pub async fn begin(&self, namespace: &Namespace) -> Result<TenantTx> {
		let tx = self.db.begin().await?;

		if !namespace_exists(&tx, namespace).await? {
			tx.rollback().await?;
			return Err(SyncError::TenantNotProvisioned(namespace.to_string()));
		}

		// SQLite resolves qualified names against the attached database, so
		// only Postgres needs the search path pinned for unqualified names
		if tx.get_database_backend() == DbBackend::Postgres {
			tx.execute_unprepared(&format!("SET LOCAL search_path TO \"{namespace}\""))
				.await?;
		}

		debug!(namespace = %namespace, "Opened tenant transaction");

		Ok(TenantTx {
			tx,
			namespace: namespace.clone(),
		})
	}

	/// Begin a write transaction, serialized with every other writer of
	/// `namespace`
	///
	/// The returned guard must outlive the commit. On Postgres the transaction
	/// also holds an advisory lock on the namespace, which covers writers in
	/// other server processes.
	pub async fn begin_write(&self, namespace: &Namespace) -> Result<(OwnedMutexGuard<()>, TenantTx)> {
		let guard = self.writers.acquire(namespace).await;
		let tx = self.begin(namespace).await?;

		if tx.backend() == DbBackend::Postgres {
			let lock = Statement::from_sql_and_values(
				DbBackend::Postgres,
				"SELECT pg_advisory_xact_lock(hashtext($1))",
				[namespace.as_str().into()],
			);
			if let Err(e) = tx.connection().query_one(lock).await {
				tx.rollback().await?;
				return Err(e.into());
			}
		}

		Ok((guard, tx))
	}

	/// Wait until no push is writing to `namespace`, then hold writes off
	pub async fn lock_writes(&self, namespace: &Namespace) -> OwnedMutexGuard<()> {
		self.writers.acquire(namespace).await
	}
}

/// A transaction pinned to one tenant namespace
pub struct TenantTx {
	tx: DatabaseTransaction,
	namespace: Namespace,
}

impl TenantTx {
	pub fn namespace(&self) -> &Namespace {
		&self.namespace
	}

	/// Qualify a table with the pinned namespace
	pub fn table<T: IntoIden + 'static>(&self, table: T) -> TableRef {
		self.namespace.table(table)
	}

	pub fn backend(&self) -> DbBackend {
		self.tx.get_database_backend()
	}

	/// Whether `SELECT ... FOR UPDATE` is meaningful on this backend
	///
	/// SQLite serializes writers and has no row locks.
	pub fn supports_row_locks(&self) -> bool {
		self.backend() != DbBackend::Sqlite
	}

	pub fn connection(&self) -> &DatabaseTransaction {
		&self.tx
	}

	pub async fn execute<S: StatementBuilder>(&self, stmt: &S) -> std::result::Result<ExecResult, DbErr> {
		self.tx.execute(self.backend().build(stmt)).await
	}

	pub async fn query_one<S: StatementBuilder>(
		&self,
		stmt: &S,
	) -> std::result::Result<Option<QueryResult>, DbErr> {
		self.tx.query_one(self.backend().build(stmt)).await
	}

	pub async fn query_all<S: StatementBuilder>(
		&self,
		stmt: &S,
	) -> std::result::Result<Vec<QueryResult>, DbErr> {
		self.tx.query_all(self.backend().build(stmt)).await
	}

	/// Open a nested transaction (savepoint) in the same namespace
	pub async fn savepoint(&self) -> std::result::Result<TenantTx, DbErr> {
		Ok(TenantTx {
			tx: self.tx.begin().await?,
			namespace: self.namespace.clone(),
		})
	}

	pub async fn commit(self) -> std::result::Result<(), DbErr> {
		self.tx.commit().await
	}

	pub async fn rollback(self) -> std::result::Result<(), DbErr> {
		self.tx.rollback().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use sea_orm::sea_query::{Query, SqliteQueryBuilder};

	#[test]
	fn test_namespace_validation() {
		assert!(Namespace::new("tenant_acme").is_ok());
		assert!(Namespace::new("t1").is_ok());

		for bad in ["", "1tenant", "Tenant", "tenant-acme", "a\"; DROP", "tenant acme"] {
			assert!(
				matches!(Namespace::new(bad), Err(SyncError::InvalidNamespace(_))),
				"{bad:?} should be rejected"
			);
		}

		assert!(Namespace::new("a".repeat(64)).is_err());
	}

	#[test]
	fn test_prefix_resolver() {
		let resolver = PrefixResolver::default();
		assert_eq!(resolver.resolve("acme_corp").unwrap().as_str(), "tenant_acme_corp");
		assert_eq!(resolver.resolve("42").unwrap().as_str(), "tenant_42");

		// Anything that would have to be rewritten could collide with a real id
		for bad in ["acme-corp", "acme.corp", "Acme_Corp", "ACME CORP", " acme", "", "   "] {
			assert!(
				matches!(resolver.resolve(bad), Err(SyncError::InvalidNamespace(_))),
				"{bad:?} should be rejected"
			);
		}
	}

	#[tokio::test]
	async fn test_write_locks_are_per_namespace() {
		let locks = WriteLocks::new();
		let acme = Namespace::new("tenant_acme").unwrap();
		let globex = Namespace::new("tenant_globex").unwrap();
		let wait = std::time::Duration::from_millis(50);

		let held = locks.acquire(&acme).await;

		assert!(tokio::time::timeout(wait, locks.acquire(&acme)).await.is_err());
		assert!(tokio::time::timeout(wait, locks.acquire(&globex)).await.is_ok());

		drop(held);
		assert!(tokio::time::timeout(wait, locks.acquire(&acme)).await.is_ok());
	}

	#[test]
	fn test_tables_are_namespace_qualified() {
		let namespace = Namespace::new("tenant_acme").unwrap();
		let sql = Query::select()
			.column(Alias::new("id"))
			.from(namespace.table(Alias::new("notes")))
			.to_string(SqliteQueryBuilder);

		assert_eq!(sql, r#"SELECT "id" FROM "tenant_acme"."notes""#);
	}
}

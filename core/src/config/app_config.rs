//! Sync server configuration

use super::default_data_dir;
use crate::config::migration::Migrate;
use crate::infra::sync::{
	history::DEFAULT_MERGE_WINDOW_MS, push::DEFAULT_CLOCK_SKEW_THRESHOLD_MS, RolePermissions,
};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const CONFIG_FILE: &str = "quire.json";

/// Main sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
	/// Config schema version
	pub version: u32,

	/// Data directory path
	pub data_dir: PathBuf,

	/// Database URL; a SQLite file inside `data_dir` when unset
	#[serde(default)]
	pub database_url: Option<String>,

	/// Node id stamped into every server HLC
	pub node_id: String,

	/// Logging level
	pub log_level: String,

	/// How far ahead of the server a client clock may run
	#[serde(default = "default_clock_skew_threshold_ms")]
	pub clock_skew_threshold_ms: u64,

	/// Window within which one actor's edits fold into one history row
	#[serde(default = "default_session_merge_window_secs")]
	pub session_merge_window_secs: u64,

	/// Prefix turning a tenant id into its namespace name
	#[serde(default = "default_namespace_prefix")]
	pub namespace_prefix: String,

	/// Roles, their permissions and what each mutation requires
	#[serde(default)]
	pub permissions: RolePermissions,

	#[serde(default)]
	pub server: ServerConfig,
}

/// HTTP front door configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
	pub bind_addr: String,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			bind_addr: "127.0.0.1:8080".to_string(),
		}
	}
}

fn default_clock_skew_threshold_ms() -> u64 {
	DEFAULT_CLOCK_SKEW_THRESHOLD_MS
}

fn default_session_merge_window_secs() -> u64 {
	DEFAULT_MERGE_WINDOW_MS / 1000
}

fn default_namespace_prefix() -> String {
	"tenant_".to_string()
}

impl SyncConfig {
	/// Load configuration from a specific data directory
	pub fn load_from(data_dir: &Path) -> Result<Self> {
		let config_path = data_dir.join(CONFIG_FILE);

		if config_path.exists() {
			info!("Loading config from {:?}", config_path);
			let json = fs::read_to_string(&config_path)?;
			let mut config: SyncConfig = serde_json::from_str(&json)?;

			// Apply migrations if needed
			if config.needs_migration() {
				info!(
					"Migrating config from v{} to v{}",
					config.version,
					Self::target_version()
				);
				config.migrate()?;
				config.save()?;
			}

			Ok(config)
		} else {
			warn!("No config found, creating default at {:?}", config_path);
			let config = Self::default_with_dir(data_dir.to_path_buf());
			config.save()?;
			Ok(config)
		}
	}

	/// Load or create configuration
	pub fn load_or_create(data_dir: &Path) -> Result<Self> {
		Self::load_from(data_dir).or_else(|e| {
			warn!("Failed to load config, recreating defaults: {}", e);
			let config = Self::default_with_dir(data_dir.to_path_buf());
			config.save()?;
			Ok(config)
		})
	}

	/// Create default configuration with specific data directory
	pub fn default_with_dir(data_dir: PathBuf) -> Self {
		Self {
			version: Self::target_version(),
			data_dir,
			database_url: None,
			node_id: format!("server-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
			log_level: "info".to_string(),
			clock_skew_threshold_ms: default_clock_skew_threshold_ms(),
			session_merge_window_secs: default_session_merge_window_secs(),
			namespace_prefix: default_namespace_prefix(),
			permissions: RolePermissions::default(),
			server: ServerConfig::default(),
		}
	}

	/// Save configuration to disk
	pub fn save(&self) -> Result<()> {
		// Ensure directory exists
		fs::create_dir_all(&self.data_dir)?;

		let config_path = self.data_dir.join(CONFIG_FILE);
		let json = serde_json::to_string_pretty(self)?;
		fs::write(&config_path, json)?;
		info!("Saved config to {:?}", config_path);
		Ok(())
	}

	/// Database URL, defaulting to SQLite inside the data dir
	pub fn database_url(&self) -> String {
		self.database_url.clone().unwrap_or_else(|| {
			format!(
				"sqlite://{}?mode=rwc",
				self.data_dir.join("quire.db").display()
			)
		})
	}

	pub fn session_merge_window_ms(&self) -> u64 {
		self.session_merge_window_secs.saturating_mul(1000)
	}

	/// Get the path for logs directory
	pub fn logs_dir(&self) -> PathBuf {
		self.data_dir.join("logs")
	}

	/// Get the path for attached SQLite namespaces
	pub fn namespaces_dir(&self) -> PathBuf {
		self.data_dir.join("namespaces")
	}

	/// Ensure all required directories exist
	pub fn ensure_directories(&self) -> Result<()> {
		fs::create_dir_all(&self.data_dir)?;
		fs::create_dir_all(self.logs_dir())?;
		fs::create_dir_all(self.namespaces_dir())?;
		Ok(())
	}
}

impl Default for SyncConfig {
	fn default() -> Self {
		let data_dir = default_data_dir().unwrap_or_else(|_| PathBuf::from("."));
		Self::default_with_dir(data_dir)
	}
}

impl Migrate for SyncConfig {
	fn current_version(&self) -> u32 {
		self.version
	}

	fn target_version() -> u32 {
		2 // Permissions moved into config
	}

	fn migrate(&mut self) -> Result<()> {
		match self.version {
			0 => {
				self.version = 1;
				self.migrate() // Continue migration chain
			}
			1 => {
				// v1 hard-coded the role table
				self.permissions = RolePermissions::default();
				self.version = 2;
				Ok(())
			}
			2 => Ok(()), // Already at target version
			v => Err(anyhow!("Unknown config version: {}", v)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn test_load_creates_default() {
		let temp = TempDir::new().unwrap();

		let config = SyncConfig::load_from(temp.path()).unwrap();
		assert_eq!(config.version, SyncConfig::target_version());
		assert_eq!(config.clock_skew_threshold_ms, 86_400_000);
		assert_eq!(config.session_merge_window_ms(), 20 * 60 * 1000);
		assert!(temp.path().join(CONFIG_FILE).exists());

		// Second load reads the same file back
		let reloaded = SyncConfig::load_from(temp.path()).unwrap();
		assert_eq!(reloaded.node_id, config.node_id);
	}

	#[test]
	fn test_migrates_old_config() {
		let temp = TempDir::new().unwrap();
		let json = serde_json::json!({
			"version": 1,
			"data_dir": temp.path(),
			"node_id": "server-a",
			"log_level": "debug",
		});
		fs::write(temp.path().join(CONFIG_FILE), json.to_string()).unwrap();

		let config = SyncConfig::load_from(temp.path()).unwrap();
		assert_eq!(config.version, 2);
		assert_eq!(config.node_id, "server-a");
		assert_eq!(config.namespace_prefix, "tenant_");
		assert_eq!(config.permissions, RolePermissions::default());
	}

	#[test]
	fn test_database_url_defaults_to_sqlite() {
		let config = SyncConfig::default_with_dir(PathBuf::from("/tmp/quire"));
		assert_eq!(config.database_url(), "sqlite:///tmp/quire/quire.db?mode=rwc");
	}
}

//! Versioned configuration upgrades

use anyhow::Result;

/// Configuration that knows how to bring itself up to the current schema
pub trait Migrate {
	fn current_version(&self) -> u32;

	fn target_version() -> u32;

	/// Upgrade in place, one version step at a time
	fn migrate(&mut self) -> Result<()>;

	fn needs_migration(&self) -> bool {
		self.current_version() < Self::target_version()
	}
}

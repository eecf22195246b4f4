//! Caller identity and the mutation authorization gate

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The authenticated caller of a push or pull
///
/// Produced by the identity resolver in front of the core; the core trusts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
	pub user_id: String,
	pub role: String,
	pub tenant_id: String,
}

impl Actor {
	pub fn new(
		user_id: impl Into<String>,
		role: impl Into<String>,
		tenant_id: impl Into<String>,
	) -> Self {
		Self {
			user_id: user_id.into(),
			role: role.into(),
			tenant_id: tenant_id.into(),
		}
	}
}

/// Decides whether an actor may run a named mutation
pub trait PermissionPolicy: Send + Sync {
	/// Permission the mutation needs, `None` if it needs none
	fn required_permission(&self, mutation: &str) -> Option<&str>;

	fn role_has(&self, role: &str, permission: &str) -> bool;

	fn allows(&self, actor: &Actor, mutation: &str) -> bool {
		self.required_permission(mutation)
			.map_or(true, |permission| self.role_has(&actor.role, permission))
	}
}

/// Table-driven permission policy, loaded from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePermissions {
	/// Role name -> permissions granted
	pub roles: BTreeMap<String, BTreeSet<String>>,

	/// Mutation name -> permission required
	pub mutations: BTreeMap<String, String>,

	/// Permission required by mutations missing from `mutations`
	///
	/// `None` lets unmapped mutations through to their handler.
	#[serde(default)]
	pub default_permission: Option<String>,
}

impl RolePermissions {
	pub fn grant(mut self, role: &str, permissions: &[&str]) -> Self {
		self.roles
			.entry(role.to_string())
			.or_default()
			.extend(permissions.iter().map(|p| (*p).to_string()));
		self
	}

	pub fn require(mut self, mutation: &str, permission: &str) -> Self {
		self.mutations
			.insert(mutation.to_string(), permission.to_string());
		self
	}
}

impl Default for RolePermissions {
	fn default() -> Self {
		Self {
			roles: BTreeMap::new(),
			mutations: BTreeMap::new(),
			default_permission: Some("note:edit".to_string()),
		}
		.grant(
			"owner",
			&["note:create", "note:edit", "note:delete", "note:comment"],
		)
		.grant(
			"editor",
			&["note:create", "note:edit", "note:delete", "note:comment"],
		)
		.grant("commenter", &["note:comment"])
		.grant("viewer", &[])
		.require("createNote", "note:create")
		.require("updateNote", "note:edit")
		.require("revertNote", "note:edit")
		.require("deleteNote", "note:delete")
	}
}

impl PermissionPolicy for RolePermissions {
	fn required_permission(&self, mutation: &str) -> Option<&str> {
		self.mutations
			.get(mutation)
			.or(self.default_permission.as_ref())
			.map(String::as_str)
	}

	fn role_has(&self, role: &str, permission: &str) -> bool {
		self.roles
			.get(role)
			.is_some_and(|granted| granted.contains(permission))
	}
}

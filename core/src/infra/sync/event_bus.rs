//! Live session registry and post-commit pokes
//!
//! Connected clients register a session for their (tenant, user). After a push
//! commits, the pipeline pokes the tenant so every live session pulls again.
//! Pokes carry no data: a client that misses one (or several, on lag) just
//! pulls once, so delivery is best-effort.
//!
//! Sessions unregister themselves when dropped, which ties their lifetime to
//! the connection holding them.

use serde::{Deserialize, Serialize};
use std::{
	collections::HashMap,
	sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::broadcast;
use tracing::debug;

use super::permission::Actor;

/// Per-tenant channel capacity; lagging only coalesces pokes
const TENANT_CHANNEL_CAPACITY: usize = 64;

/// Events delivered to live sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
	/// Something changed, pull again
	///
	/// `user_id = None` addresses every session of the tenant.
	Poke {
		tenant_id: String,
		user_id: Option<String>,
	},
}

impl SyncEvent {
	fn addresses(&self, user_id: &str) -> bool {
		match self {
			SyncEvent::Poke { user_id: None, .. } => true,
			SyncEvent::Poke {
				user_id: Some(target),
				..
			} => target == user_id,
		}
	}
}

/// Outward fan-out after a push commits
pub trait Notifier: Send + Sync {
	fn notify(&self, actor: &Actor);
}

struct TenantSessions {
	sender: broadcast::Sender<SyncEvent>,

	/// Live session count per user
	users: HashMap<String, usize>,
}

#[derive(Default)]
struct Sessions {
	tenants: HashMap<String, TenantSessions>,
}

/// Who is connected, per tenant and per user
#[derive(Clone, Default)]
pub struct SessionRegistry {
	inner: Arc<Mutex<Sessions>>,
}

impl SessionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a live session; it unregisters when the returned value drops
	pub fn register(&self, tenant_id: &str, user_id: &str) -> Session {
		let mut sessions = self.lock();
		let tenant = sessions
			.tenants
			.entry(tenant_id.to_string())
			.or_insert_with(|| TenantSessions {
				sender: broadcast::channel(TENANT_CHANNEL_CAPACITY).0,
				users: HashMap::new(),
			});

		*tenant.users.entry(user_id.to_string()).or_default() += 1;
		let receiver = tenant.sender.subscribe();

		debug!(tenant_id, user_id, "Registered live session");

		Session {
			tenant_id: tenant_id.to_string(),
			user_id: user_id.to_string(),
			receiver,
			registry: self.clone(),
		}
	}

	/// Poke every session of `user_id` in `tenant_id`; returns sessions reached
	pub fn notify_user(&self, tenant_id: &str, user_id: &str) -> usize {
		let sessions = self.lock();
		let Some(tenant) = sessions.tenants.get(tenant_id) else {
			return 0;
		};

		let reached = tenant.users.get(user_id).copied().unwrap_or(0);
		if reached > 0 {
			let _ = tenant.sender.send(SyncEvent::Poke {
				tenant_id: tenant_id.to_string(),
				user_id: Some(user_id.to_string()),
			});
		}

		reached
	}

	/// Poke every session of `tenant_id`; returns sessions reached
	pub fn notify_tenant(&self, tenant_id: &str) -> usize {
		let sessions = self.lock();
		let Some(tenant) = sessions.tenants.get(tenant_id) else {
			return 0;
		};

		tenant
			.sender
			.send(SyncEvent::Poke {
				tenant_id: tenant_id.to_string(),
				user_id: None,
			})
			.unwrap_or(0)
	}

	pub fn session_count(&self, tenant_id: &str) -> usize {
		self.lock()
			.tenants
			.get(tenant_id)
			.map_or(0, |tenant| tenant.users.values().sum())
	}

	pub fn user_session_count(&self, tenant_id: &str, user_id: &str) -> usize {
		self.lock()
			.tenants
			.get(tenant_id)
			.and_then(|tenant| tenant.users.get(user_id).copied())
			.unwrap_or(0)
	}

	fn unregister(&self, tenant_id: &str, user_id: &str) {
		let mut sessions = self.lock();
		let Some(tenant) = sessions.tenants.get_mut(tenant_id) else {
			return;
		};

		if let Some(count) = tenant.users.get_mut(user_id) {
			*count = count.saturating_sub(1);
			if *count == 0 {
				tenant.users.remove(user_id);
			}
		}

		if tenant.users.is_empty() {
			sessions.tenants.remove(tenant_id);
		}

		debug!(tenant_id, user_id, "Unregistered live session");
	}

	fn lock(&self) -> MutexGuard<'_, Sessions> {
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

impl Notifier for SessionRegistry {
	fn notify(&self, actor: &Actor) {
		// Everyone in the tenant may see the change, the author included
		let reached = self.notify_tenant(&actor.tenant_id);
		debug!(
			tenant_id = %actor.tenant_id,
			user_id = %actor.user_id,
			sessions = reached,
			"Poked live sessions"
		);
	}
}

/// One live connection
pub struct Session {
	tenant_id: String,
	user_id: String,
	receiver: broadcast::Receiver<SyncEvent>,
	registry: SessionRegistry,
}

impl Session {
	/// Wait for the next poke addressed to this session
	///
	/// Returns `None` once the registry is gone.
	pub async fn recv(&mut self) -> Option<SyncEvent> {
		loop {
			match self.receiver.recv().await {
				Ok(event) if event.addresses(&self.user_id) => return Some(event),
				Ok(_) => continue,
				// Missed pokes collapse into one
				Err(broadcast::error::RecvError::Lagged(_)) => {
					return Some(SyncEvent::Poke {
						tenant_id: self.tenant_id.clone(),
						user_id: Some(self.user_id.clone()),
					})
				}
				Err(broadcast::error::RecvError::Closed) => return None,
			}
		}
	}

	pub fn tenant_id(&self) -> &str {
		&self.tenant_id
	}

	pub fn user_id(&self) -> &str {
		&self.user_id
	}
}

impl Drop for Session {
	fn drop(&mut self) {
		self.registry.unregister(&self.tenant_id, &self.user_id);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_sessions_unregister_on_drop() {
		let registry = SessionRegistry::new();

		let a = registry.register("acme", "alice");
		let b = registry.register("acme", "alice");
		let c = registry.register("acme", "bob");
		assert_eq!(registry.session_count("acme"), 3);
		assert_eq!(registry.user_session_count("acme", "alice"), 2);

		drop(a);
		assert_eq!(registry.user_session_count("acme", "alice"), 1);

		drop(b);
		drop(c);
		assert_eq!(registry.session_count("acme"), 0);
		assert_eq!(registry.notify_tenant("acme"), 0);
	}

	#[tokio::test]
	async fn test_user_poke_skips_other_users() {
		let registry = SessionRegistry::new();
		let mut alice = registry.register("acme", "alice");
		let mut bob = registry.register("acme", "bob");

		assert_eq!(registry.notify_user("acme", "alice"), 1);
		assert_eq!(registry.notify_tenant("acme"), 2);

		let event = alice.recv().await.unwrap();
		assert_eq!(
			event,
			SyncEvent::Poke {
				tenant_id: "acme".into(),
				user_id: Some("alice".into())
			}
		);
		assert!(alice.recv().await.is_some());

		// Bob only sees the tenant-wide poke
		let event = bob.recv().await.unwrap();
		assert_eq!(
			event,
			SyncEvent::Poke {
				tenant_id: "acme".into(),
				user_id: None
			}
		);
	}

	#[tokio::test]
	async fn test_tenants_are_isolated() {
		let registry = SessionRegistry::new();
		let _acme = registry.register("acme", "alice");
		let mut globex = registry.register("globex", "alice");

		registry.notify(&Actor::new("alice", "editor", "acme"));

		assert!(
			tokio::time::timeout(std::time::Duration::from_millis(20), globex.recv())
				.await
				.is_err()
		);
	}
}

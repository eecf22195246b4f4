//! Sync infrastructure
//!
//! Core components for multi-client, multi-tenant synchronization:
//! - HLC for causal ordering of every write in a namespace
//! - Mutation and syncable entity registries for pluggable content types
//! - Tenant gate pinning each transaction to one namespace
//! - Push and pull pipelines
//! - History ledger with session merge

pub mod client;
pub mod conflict;
pub mod error;
pub mod event_bus;
pub mod history;
pub mod hlc;
pub mod permission;
pub mod pull;
pub mod push;
pub mod registry;
pub mod syncable;
pub mod tenant;
pub mod time_source;
pub mod tombstone;
pub mod watermarks;

pub use client::ClientRecord;
pub use conflict::inject_marker;
pub use error::{MutationError, Result, SyncError, VersionConflict};
pub use event_bus::{Notifier, Session, SessionRegistry, SyncEvent};
pub use history::{HistoryEntry, HistoryLedger, NewHistoryEntry, DEFAULT_MERGE_WINDOW_MS};
pub use hlc::{ClockRegistry, Hlc, HlcError};
pub use permission::{Actor, PermissionPolicy, RolePermissions};
pub use pull::{PatchOperation, PullPipeline, PullRequest, PullResponse};
pub use push::{Mutation, PushPipeline, PushReport, PushRequest, DEFAULT_CLOCK_SKEW_THRESHOLD_MS};
pub use registry::{MutationContext, MutationHandler, MutationRegistry};
pub use syncable::{PullFilter, SyncableEntity, SyncableRegistry};
pub use tenant::{Namespace, NamespaceResolver, PrefixResolver, TenantGate, TenantTx};
pub use time_source::{FakeTimeSource, SystemTimeSource, TimeSource};
pub use watermarks::{Cookie, ZERO_WATERMARK};

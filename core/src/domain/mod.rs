//! Content types built on the sync core
//!
//! Each content type contributes mutation handlers and a syncable entity; the
//! pipelines never name them directly.

pub mod note;

pub use note::{Note, NoteEntity};

use crate::infra::sync::{MutationRegistry, SyncableRegistry};

/// Registries holding every built-in content type
pub fn registries() -> (MutationRegistry, SyncableRegistry) {
	let mut mutations = MutationRegistry::new();
	let mut entities = SyncableRegistry::new();

	note::register(&mut mutations, &mut entities);

	(mutations, entities)
}

//! Test helper modules for integration tests

pub mod sync_harness;

pub use sync_harness::*;

//! Infrastructure layer: storage, sync and logging

pub mod db;
pub mod logging;
pub mod sync;

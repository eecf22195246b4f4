//! Wall-clock abstraction for clock admission and history merging
//!
//! The push pipeline compares client clocks against "now" and the history
//! ledger decides session merges by age, so both read time through
//! [`TimeSource`]. Production uses [`SystemTimeSource`]; tests drive a
//! [`FakeTimeSource`] forwards (session windows) or pin it (clock skew).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of the current time in milliseconds since Unix epoch
pub trait TimeSource: Send + Sync {
	fn current_time_ms(&self) -> u64;
}

/// Production time source using the system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
	fn current_time_ms(&self) -> u64 {
		u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
	}
}

/// Test time source with manual control
///
/// Clones share the same underlying time, so a test can hand one clone to
/// the pipelines and keep another to move time around.
#[derive(Debug, Clone)]
pub struct FakeTimeSource {
	time: Arc<AtomicU64>,
}

impl Default for FakeTimeSource {
	fn default() -> Self {
		Self::new(1_700_000_000_000)
	}
}

impl FakeTimeSource {
	pub fn new(initial_ms: u64) -> Self {
		Self {
			time: Arc::new(AtomicU64::new(initial_ms)),
		}
	}

	pub fn advance(&self, delta_ms: u64) {
		self.time.fetch_add(delta_ms, Ordering::SeqCst);
	}

	pub fn advance_minutes(&self, minutes: u64) {
		self.advance(minutes * 60 * 1000);
	}

	/// Set time to a specific value (can go backwards)
	pub fn set(&self, time_ms: u64) {
		self.time.store(time_ms, Ordering::SeqCst);
	}

	pub fn get(&self) -> u64 {
		self.time.load(Ordering::SeqCst)
	}
}

impl TimeSource for FakeTimeSource {
	fn current_time_ms(&self) -> u64 {
		self.get()
	}
}

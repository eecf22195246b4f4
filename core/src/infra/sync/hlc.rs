//! Hybrid Logical Clock (HLC) for causal ordering of mutations
//!
//! An HLC combines wall-clock milliseconds with a logical counter so that any
//! event caused by another event always sorts after it, even when the devices
//! involved disagree about the time. The packed form is fixed-width:
//!
//! ```text
//! 1718000000000:002a:server-1
//! └─ 13 digits ──┘ └hex┘ └ node ┘
//! ```
//!
//! Because the physical and counter segments are zero-padded and the node id
//! comes last, comparing two packed strings byte-by-byte orders them by
//! `(physical, counter)` first. That is what lets `global_version` columns be
//! compared with plain `>` in SQL.

use serde::{Deserialize, Serialize};
use std::{
	collections::HashMap,
	fmt,
	str::FromStr,
	sync::{Mutex, PoisonError},
};

/// Largest physical time that still packs into 13 digits (year 2286)
pub const MAX_PHYSICAL: u64 = 9_999_999_999_999;

/// Hybrid Logical Clock value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hlc {
	/// Physical time component (milliseconds since Unix epoch)
	pub physical: u64,

	/// Logical counter for events within the same millisecond
	pub counter: u16,

	/// Node that generated this value; only breaks ties after the counter
	pub node_id: String,
}

/// HLC-related errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HlcError {
	#[error("Invalid HLC format: {0}")]
	Format(String),
}

impl Hlc {
	pub fn new(physical: u64, counter: u16, node_id: impl Into<String>) -> Self {
		Self {
			physical,
			counter,
			node_id: node_id.into(),
		}
	}

	/// The origin of a node's clock, sorts before every real event
	pub fn zero(node_id: impl Into<String>) -> Self {
		Self::new(0, 0, node_id)
	}

	/// Pack into the fixed-width sortable string form
	pub fn pack(&self) -> String {
		format!("{:013}:{:04x}:{}", self.physical, self.counter, self.node_id)
	}

	/// Parse a packed HLC string
	///
	/// The node id may itself contain colons; only the first two separate
	/// segments.
	pub fn unpack(packed: &str) -> Result<Self, HlcError> {
		let parts: Vec<&str> = packed.splitn(3, ':').collect();
		if parts.len() != 3 {
			return Err(HlcError::Format(format!(
				"expected 3 segments, got {}. Input: '{}'",
				parts.len(),
				packed
			)));
		}

		let physical = parts[0]
			.parse::<u64>()
			.map_err(|e| HlcError::Format(format!("invalid physical time '{}': {}", parts[0], e)))?;

		let counter = u16::from_str_radix(parts[1], 16)
			.map_err(|e| HlcError::Format(format!("invalid counter '{}': {}", parts[1], e)))?;

		Ok(Self::new(physical, counter, parts[2]))
	}

	/// Advance for a local event at wall-clock time `now`
	///
	/// If the wall clock has not moved past the last event, the counter
	/// carries the ordering; otherwise the clock jumps to `now`.
	pub fn tick(&self, now: u64) -> Self {
		if now <= self.physical {
			self.successor(self.physical, self.counter)
		} else {
			Self::new(now, 0, self.node_id.clone())
		}
	}

	/// Advance for an event caused by a remote event
	///
	/// The result is strictly greater than both `self` and `remote` in
	/// `(physical, counter)` order.
	pub fn receive(&self, remote: &str, now: u64) -> Result<Self, HlcError> {
		let remote = Self::unpack(remote)?;
		Ok(self.receive_hlc(&remote, now))
	}

	/// [`Hlc::receive`] for an already unpacked remote value
	pub fn receive_hlc(&self, remote: &Hlc, now: u64) -> Self {
		let physical = self.physical.max(remote.physical).max(now);

		if physical == self.physical && physical == remote.physical {
			self.successor(physical, self.counter.max(remote.counter))
		} else if physical == self.physical {
			self.successor(physical, self.counter)
		} else if physical == remote.physical {
			self.successor(physical, remote.counter)
		} else {
			Self::new(physical, 0, self.node_id.clone())
		}
	}

	/// `(physical, counter + 1)`, carrying into the next millisecond when the
	/// counter is exhausted so ordering is never lost
	fn successor(&self, physical: u64, counter: u16) -> Self {
		match counter.checked_add(1) {
			Some(counter) => Self::new(physical, counter, self.node_id.clone()),
			None => Self::new(physical + 1, 0, self.node_id.clone()),
		}
	}
}

/// Ordering is based on: physical, then counter, then node id
impl Ord for Hlc {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.physical
			.cmp(&other.physical)
			.then(self.counter.cmp(&other.counter))
			.then_with(|| self.node_id.cmp(&other.node_id))
	}
}

impl PartialOrd for Hlc {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl fmt::Display for Hlc {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.pack())
	}
}

impl FromStr for Hlc {
	type Err = HlcError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::unpack(s)
	}
}

/// Server clocks, one per tenant namespace
///
/// Each namespace keeps its own causal order, so each gets its own clock.
/// A clock is seeded from the namespace's stored watermark the first time it
/// is used, which keeps `global_version` monotonic across restarts.
pub struct ClockRegistry {
	node_id: String,
	clocks: Mutex<HashMap<String, Hlc>>,
}

impl ClockRegistry {
	pub fn new(node_id: impl Into<String>) -> Self {
		Self {
			node_id: node_id.into(),
			clocks: Mutex::new(HashMap::new()),
		}
	}

	pub fn node_id(&self) -> &str {
		&self.node_id
	}

	pub fn is_seeded(&self, namespace: &str) -> bool {
		self.lock().contains_key(namespace)
	}

	/// Seed a namespace's clock from the highest version it has stored
	///
	/// Never moves an existing clock backwards.
	pub fn seed(&self, namespace: &str, watermark: Option<&Hlc>) {
		let mut seed = Hlc::zero(self.node_id.clone());
		if let Some(watermark) = watermark {
			seed.physical = watermark.physical;
			seed.counter = watermark.counter;
		}

		let mut clocks = self.lock();
		let clock = clocks
			.entry(namespace.to_string())
			.or_insert_with(|| seed.clone());
		if seed > *clock {
			*clock = seed;
		}
	}

	/// Current clock value for a namespace
	pub fn current(&self, namespace: &str) -> Option<Hlc> {
		self.lock().get(namespace).cloned()
	}

	/// Compute the next clock value and adopt it only if `step` accepts it
	///
	/// The clock is held locked for the duration of `step`, so concurrent
	/// pushes into one namespace never observe the same value.
	pub fn try_advance<E>(
		&self,
		namespace: &str,
		step: impl FnOnce(&Hlc) -> Result<Hlc, E>,
	) -> Result<Hlc, E> {
		let mut clocks = self.lock();
		let local = clocks
			.entry(namespace.to_string())
			.or_insert_with(|| Hlc::zero(self.node_id.clone()));

		let next = step(local)?;
		if next > *local {
			*local = next.clone();
		}

		Ok(next)
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Hlc>> {
		self.clocks.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_pack_is_fixed_width() {
		let hlc = Hlc::new(1_718_000_000_000, 42, "server-1");
		assert_eq!(hlc.pack(), "1718000000000:002a:server-1");

		let early = Hlc::new(5, 0, "a");
		assert_eq!(early.pack(), "0000000000005:0000:a");
	}

	#[test]
	fn test_pack_unpack_roundtrip() {
		for hlc in [
			Hlc::new(0, 0, "n"),
			Hlc::new(1_718_000_000_000, u16::MAX, "device-7"),
			Hlc::new(MAX_PHYSICAL, 1, "node:with:colons"),
		] {
			assert_eq!(Hlc::unpack(&hlc.pack()).unwrap(), hlc);
		}
	}

	#[test]
	fn test_unpack_rejects_short_input() {
		assert!(matches!(Hlc::unpack("0"), Err(HlcError::Format(_))));
		assert!(matches!(
			Hlc::unpack("1718000000000:0001"),
			Err(HlcError::Format(_))
		));
		assert!(matches!(
			Hlc::unpack("abc:0001:node"),
			Err(HlcError::Format(_))
		));
	}

	#[test]
	fn test_string_order_ignores_node_id() {
		let a = Hlc::new(1000, 1, "zzz");
		let b = Hlc::new(1000, 2, "aaa");
		let c = Hlc::new(1001, 0, "aaa");

		assert!(a.pack() < b.pack());
		assert!(b.pack() < c.pack());
		assert!(a < b && b < c);
	}

	#[test]
	fn test_tick_same_millisecond() {
		let local = Hlc::new(1000, 3, "s");
		let next = local.tick(1000);
		assert_eq!((next.physical, next.counter), (1000, 4));

		// Wall clock went backwards, counter still carries order
		let next = local.tick(900);
		assert_eq!((next.physical, next.counter), (1000, 4));
	}

	#[test]
	fn test_tick_new_millisecond() {
		let local = Hlc::new(1000, 3, "s");
		let next = local.tick(1500);
		assert_eq!((next.physical, next.counter), (1500, 0));
		assert_eq!(next.node_id, "s");
	}

	#[test]
	fn test_tick_counter_overflow_carries() {
		let local = Hlc::new(1000, u16::MAX, "s");
		let next = local.tick(1000);
		assert_eq!((next.physical, next.counter), (1001, 0));
		assert!(next.pack() > local.pack());
	}

	#[test]
	fn test_receive_branches() {
		let local = Hlc::new(1000, 5, "server");

		// Both at the same physical time, ahead of the wall clock
		let next = local.receive(&Hlc::new(1000, 9, "c").pack(), 900).unwrap();
		assert_eq!((next.physical, next.counter), (1000, 10));

		// Local is ahead
		let next = local.receive(&Hlc::new(800, 9, "c").pack(), 900).unwrap();
		assert_eq!((next.physical, next.counter), (1000, 6));

		// Remote is ahead
		let next = local.receive(&Hlc::new(2000, 7, "c").pack(), 900).unwrap();
		assert_eq!((next.physical, next.counter), (2000, 8));
		assert_eq!(next.node_id, "server");

		// Wall clock is ahead of both
		let next = local.receive(&Hlc::new(800, 7, "c").pack(), 3000).unwrap();
		assert_eq!((next.physical, next.counter), (3000, 0));
	}

	#[test]
	fn test_receive_rejects_malformed_remote() {
		let local = Hlc::new(1000, 0, "server");
		assert!(local.receive("garbage", 1000).is_err());
	}

	#[test]
	fn test_causal_chain_sorts_strictly_increasing() {
		let mut server = Hlc::zero("server");
		let mut device = Hlc::zero("device");
		let mut previous = server.pack();

		// Device clock runs far ahead of the server's wall clock, then behind
		for (step, (server_now, device_now)) in
			[(100, 5000), (100, 5000), (6000, 10), (6000, 10), (7000, 7000)]
				.into_iter()
				.enumerate()
		{
			device = device.tick(device_now);
			server = server.receive(&device.pack(), server_now).unwrap();

			assert!(server.pack() > device.pack(), "step {step}");
			assert!(server.pack() > previous, "step {step}");
			previous = server.pack();

			server = server.tick(server_now);
			assert!(server.pack() > previous, "step {step}");
			previous = server.pack();
		}
	}

	#[test]
	fn test_registry_seed_never_rewinds() {
		let clocks = ClockRegistry::new("server");
		assert!(!clocks.is_seeded("tenant_a"));

		clocks.seed("tenant_a", Some(&Hlc::new(5000, 2, "other")));
		assert_eq!(clocks.current("tenant_a"), Some(Hlc::new(5000, 2, "server")));

		clocks.seed("tenant_a", Some(&Hlc::new(10, 0, "other")));
		assert_eq!(clocks.current("tenant_a"), Some(Hlc::new(5000, 2, "server")));
	}

	#[test]
	fn test_registry_rejected_step_is_not_adopted() {
		let clocks = ClockRegistry::new("server");
		clocks.seed("tenant_a", None);

		let next = clocks
			.try_advance::<()>("tenant_a", |local| Ok(local.tick(1000)))
			.unwrap();
		assert_eq!(next.physical, 1000);

		let rejected = clocks.try_advance("tenant_a", |local| {
			let candidate = local.tick(99_000);
			if candidate.physical > 50_000 {
				Err(candidate.physical)
			} else {
				Ok(candidate)
			}
		});
		assert_eq!(rejected, Err(99_000));
		assert_eq!(clocks.current("tenant_a").unwrap().physical, 1000);
	}

	#[test]
	fn test_registry_namespaces_are_independent() {
		let clocks = ClockRegistry::new("server");
		clocks
			.try_advance::<()>("tenant_a", |local| Ok(local.tick(5000)))
			.unwrap();

		let b = clocks
			.try_advance::<()>("tenant_b", |local| Ok(local.tick(10)))
			.unwrap();
		assert_eq!(b.physical, 10);
	}
}

//! Process-wide Lamport clock
//!
//! A single `LamportClock` instance is shared by the model, every
//! `FileSet` and every walker. Load-time advance (from persisted
//! versions), runtime advance (from peer indexes) and local mutation
//! all go through the same `tick` primitive.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic logical clock with `tick(v) = max(clock, v) + 1`.
#[derive(Debug, Default)]
pub struct LamportClock(AtomicU64);

impl LamportClock {
	pub fn new() -> Self {
		LamportClock(AtomicU64::new(0))
	}

	/// Advance the clock past `seen` and return the new value.
	pub fn tick(&self, seen: u64) -> u64 {
		loop {
			let cur = self.0.load(Ordering::SeqCst);
			let next = cur.max(seen) + 1;
			if self.0.compare_exchange(cur, next, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
				return next;
			}
		}
	}

	pub fn current(&self) -> u64 {
		self.0.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::collections::HashSet;
	use std::sync::Arc;

	#[test]
	fn test_tick_is_monotonic() {
		let clock = LamportClock::new();
		assert_eq!(clock.tick(0), 1);
		assert_eq!(clock.tick(0), 2);
		assert_eq!(clock.tick(1), 3);
	}

	#[test]
	fn test_tick_advances_past_seen() {
		let clock = LamportClock::new();
		assert_eq!(clock.tick(41), 42);
		assert_eq!(clock.current(), 42);
		assert_eq!(clock.tick(5), 43);
	}

	#[test]
	fn test_concurrent_ticks_are_unique() {
		let clock = Arc::new(LamportClock::new());
		let mut handles = vec![];
		for _ in 0..8 {
			let clock = Arc::clone(&clock);
			handles.push(std::thread::spawn(move || {
				(0..1000).map(|_| clock.tick(0)).collect::<Vec<u64>>()
			}));
		}
		let mut seen = HashSet::new();
		for h in handles {
			for v in h.join().unwrap() {
				assert!(seen.insert(v), "duplicate tick value {}", v);
			}
		}
		assert_eq!(clock.current(), 8000);
	}
}

// vim: ts=4

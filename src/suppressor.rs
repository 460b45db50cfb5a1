//! Change-rate limiter for churning files
//!
//! Files that change faster than the configured threshold are marked
//! invalid in the local index and drop out of the global and need views
//! until their change rate falls again. This keeps a log file that is
//! appended to every second from generating a broadcast storm.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default change-rate threshold in kB/s.
pub const DEFAULT_THRESHOLD_KBPS: u64 = 10_000;

/// Window over which change rates are measured.
const CHANGE_WINDOW: Duration = Duration::from_secs(60);

/// Per-name history entries kept at most.
const MAX_HISTORY: usize = 32;

/// Leaky-bucket measure of bytes changed per unit time, per file name.
pub struct Suppressor {
	threshold_kbps: u64,
	hist: Mutex<HashMap<String, Vec<(Instant, u64)>>>,
}

impl Suppressor {
	pub fn new(threshold_kbps: u64) -> Self {
		Suppressor { threshold_kbps, hist: Mutex::new(HashMap::new()) }
	}

	/// Record a change of `size` bytes to `name` at `now`. Returns
	/// whether the file should be suppressed, and the observed rate in
	/// bytes per second.
	///
	/// The first observed change never suppresses; from the second
	/// change on, the rate over the measurement window decides.
	pub fn suppress(&self, name: &str, size: u64, now: Instant) -> (bool, f64) {
		let mut hist = self.hist.lock().unwrap();
		let entries = hist.entry(name.to_string()).or_default();

		entries.retain(|(t, _)| now.duration_since(*t) <= CHANGE_WINDOW);
		entries.push((now, size));
		if entries.len() > MAX_HISTORY {
			let drop = entries.len() - MAX_HISTORY;
			entries.drain(..drop);
		}

		if entries.len() < 2 {
			return (false, 0.0);
		}

		let total: u64 = entries.iter().map(|(_, s)| *s).sum();
		let elapsed = now.duration_since(entries[0].0).as_secs_f64().max(0.01);
		let bps = total as f64 / elapsed;

		(bps > (self.threshold_kbps * 1024) as f64, bps)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_first_change_is_never_suppressed() {
		let sup = Suppressor::new(1);
		let (suppressed, bps) = sup.suppress("f", 1 << 30, Instant::now());
		assert!(!suppressed);
		assert_eq!(bps, 0.0);
	}

	#[test]
	fn test_rapid_changes_are_suppressed() {
		let sup = Suppressor::new(1);
		let t0 = Instant::now();
		sup.suppress("f", 1 << 20, t0);
		let (suppressed, bps) = sup.suppress("f", 1 << 20, t0 + Duration::from_millis(100));
		assert!(suppressed, "rate {} bps should exceed 1 kB/s", bps);
		assert!(bps > 1024.0);
	}

	#[test]
	fn test_slow_changes_pass() {
		let sup = Suppressor::new(10_000);
		let t0 = Instant::now();
		sup.suppress("f", 100, t0);
		let (suppressed, _) = sup.suppress("f", 100, t0 + Duration::from_secs(10));
		assert!(!suppressed);
	}

	#[test]
	fn test_rate_recovers_after_window() {
		let sup = Suppressor::new(1);
		let t0 = Instant::now();
		sup.suppress("f", 1 << 20, t0);
		let (suppressed, _) = sup.suppress("f", 1 << 20, t0 + Duration::from_millis(10));
		assert!(suppressed);

		// Once the burst ages out of the window only the latest change
		// remains, which by itself does not suppress.
		let later = t0 + CHANGE_WINDOW + Duration::from_secs(5);
		let (suppressed, _) = sup.suppress("f", 100, later);
		assert!(!suppressed);
	}

	#[test]
	fn test_names_are_tracked_independently() {
		let sup = Suppressor::new(1);
		let t0 = Instant::now();
		sup.suppress("a", 1 << 20, t0);
		let (suppressed, _) = sup.suppress("b", 1 << 20, t0 + Duration::from_millis(10));
		assert!(!suppressed);
	}
}

// vim: ts=4

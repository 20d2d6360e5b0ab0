//! Monotonic reference clocks.
//!
//! Hardware supplies a free-running tick counter through [`TimeRef`]; the
//! rest of the stack only ever works with captured [`TimeVal`] references and
//! wraparound-safe elapsed arithmetic.

use core::sync::atomic::{AtomicU64, Ordering};

/// A captured instant of some [`TimeRef`], in raw ticks.
///
/// The value is meaningless without the clock that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeVal(u64);

impl TimeVal {
	pub const fn from_ticks(ticks: u64) -> Self {
		TimeVal(ticks)
	}

	pub const fn ticks(&self) -> u64 {
		self.0
	}
}

/// A monotonically increasing tick counter with a known rate.
///
/// Implementations may wrap; all arithmetic in the stack uses wrapping
/// subtraction, so elapsed measurements stay correct across one rollover.
pub trait TimeRef {
	/// Current raw tick count.
	fn raw(&self) -> u64;

	/// Tick rate in ticks per second.
	fn ticks_per_sec(&self) -> u64;

	/// Capture the current instant.
	fn now(&self) -> TimeVal {
		TimeVal(self.raw())
	}

	/// Ticks elapsed since `since`.
	fn elapsed_ticks(&self, since: TimeVal) -> u64 {
		self.raw().wrapping_sub(since.0)
	}

	/// Microseconds elapsed since `since`.
	fn elapsed_us(&self, since: TimeVal) -> u64 {
		ticks_to_scaled(self.elapsed_ticks(since), self.ticks_per_sec(), 1_000_000)
	}

	/// Milliseconds elapsed since `since`.
	fn elapsed_ms(&self, since: TimeVal) -> u64 {
		ticks_to_scaled(self.elapsed_ticks(since), self.ticks_per_sec(), 1_000)
	}

	/// Ticks corresponding to a millisecond count, rounded down.
	fn ms_to_ticks(&self, msec: u64) -> u64 {
		ticks_to_scaled(msec, 1_000, self.ticks_per_sec())
	}

	/// Advance a captured instant by `msec` milliseconds.
	///
	/// Used to re-anchor periodic measurements without losing the
	/// sub-millisecond remainder of the underlying counter.
	fn increment_ms(&self, tval: TimeVal, msec: u64) -> TimeVal {
		TimeVal(tval.0.wrapping_add(self.ms_to_ticks(msec)))
	}
}

fn ticks_to_scaled(ticks: u64, rate: u64, scale: u64) -> u64 {
	((u128::from(ticks) * u128::from(scale)) / u128::from(rate)) as u64
}

/// A software tick counter, advanced by the host.
///
/// This is the clock used by hosted simulations and by the test suite; a
/// bare-metal build implements [`TimeRef`] over its hardware timer instead.
pub struct SoftClock {
	ticks: AtomicU64,
	rate: u64,
}

impl SoftClock {
	/// A clock counting at the given rate, starting from zero.
	pub const fn new(ticks_per_sec: u64) -> Self {
		SoftClock {
			ticks: AtomicU64::new(0),
			rate: ticks_per_sec,
		}
	}

	/// A 1 MHz clock, one tick per microsecond.
	pub const fn usec() -> Self {
		Self::new(1_000_000)
	}

	pub fn advance_ticks(&self, ticks: u64) {
		self.ticks.fetch_add(ticks, Ordering::Relaxed);
	}

	pub fn advance_ms(&self, msec: u64) {
		self.advance_ticks(self.ms_to_ticks(msec));
	}
}

impl TimeRef for SoftClock {
	fn raw(&self) -> u64 {
		self.ticks.load(Ordering::Relaxed)
	}

	fn ticks_per_sec(&self) -> u64 {
		self.rate
	}
}

//! Millisecond timers over the on-demand runtime.

use core::cell::Cell;

use crate::sync::CritMutex;
use crate::time::{TimeRef, TimeVal};
use crate::util::Registry;
use crate::{Error, Result};

use super::{misuse, Demand, OnDemand};

/// Countdown state embedded in every [`TimerClient`].
///
/// A timer is armed one-shot or repeating; the owning object may re-arm or
/// disarm itself from inside its own `timer_event`.
#[derive(Debug)]
pub struct PollTimer {
	/// Milliseconds until the next event.
	remaining: Cell<u32>,
	/// Repeat interval in milliseconds; zero means one-shot.
	interval: Cell<u32>,
	armed: Cell<bool>,
}

impl PollTimer {
	pub const fn new() -> Self {
		PollTimer {
			remaining: Cell::new(0),
			interval: Cell::new(0),
			armed: Cell::new(false),
		}
	}

	/// Fire once, `msec` milliseconds from now.
	pub fn set_once(&self, msec: u32) {
		self.remaining.set(msec.max(1));
		self.interval.set(0);
		self.armed.set(true);
	}

	/// Fire every `msec` milliseconds until disarmed.
	pub fn set_every(&self, msec: u32) {
		let msec = msec.max(1);
		self.remaining.set(msec);
		self.interval.set(msec);
		self.armed.set(true);
	}

	pub fn disarm(&self) {
		self.armed.set(false);
	}

	pub fn is_armed(&self) -> bool {
		self.armed.get()
	}
}

impl Default for PollTimer {
	fn default() -> Self {
		Self::new()
	}
}

/// An object that owns a [`PollTimer`] and reacts when it expires.
pub trait TimerClient {
	fn timer(&self) -> &PollTimer;

	fn timer_event(&self);
}

/// Advances every registered timer from a reference clock.
///
/// The timekeeper is an [`OnDemand`] handler; something must request it
/// regularly, typically a ~1 ms platform tick calling [`Timekeeper::tick`].
/// Each service measures the true elapsed time, so a late or coalesced tick
/// only delays events, never loses them. Repeating timers compensate for
/// overshoot up to one full interval and fall back to a one-millisecond
/// delay beyond that, which bounds long-run drift to the tick granularity.
pub struct Timekeeper<'a, const N: usize = 32> {
	clock: &'a dyn TimeRef,
	anchor: Cell<TimeVal>,
	timers: CritMutex<Registry<'a, dyn TimerClient + 'a, N>>,
	demand: Demand,
}

impl<'a, const N: usize> Timekeeper<'a, N> {
	pub fn new(clock: &'a dyn TimeRef) -> Self {
		Timekeeper {
			clock,
			anchor: Cell::new(clock.now()),
			timers: CritMutex::new(Registry::new()),
			demand: Demand::new(),
		}
	}

	pub fn register(&self, item: &'a dyn TimerClient) -> Result<()> {
		let result = self.timers.lock().add(item);
		if result == Err(Error::AlreadyRegistered) {
			misuse!("poll: duplicate timer registration");
		}
		result
	}

	pub fn unregister(&self, item: &'a dyn TimerClient) {
		self.timers.lock().remove(item);
	}

	/// Request a timer pass; called from the platform tick.
	pub fn tick(&self) {
		self.demand.request_poll();
	}
}

impl<const N: usize> OnDemand for Timekeeper<'_, N> {
	fn demand(&self) -> &Demand {
		&self.demand
	}

	fn poll_demand(&self) {
		let elapsed = self.clock.elapsed_ms(self.anchor.get());
		if elapsed == 0 {
			return;
		}
		// Re-anchor by the measured amount, keeping the sub-millisecond
		// remainder of the underlying counter.
		self.anchor
			.set(self.clock.increment_ms(self.anchor.get(), elapsed));

		let registered = self.timers.lock().snapshot();
		let mut fired: [Option<&dyn TimerClient>; N] = [None; N];
		let mut count = 0;
		for client in registered.into_iter().flatten() {
			let timer = client.timer();
			if !timer.armed.get() {
				continue;
			}
			let remaining = u64::from(timer.remaining.get());
			if remaining > elapsed {
				timer.remaining.set((remaining - elapsed) as u32);
				continue;
			}
			let overshoot = elapsed - remaining;
			let interval = timer.interval.get();
			if interval == 0 {
				timer.armed.set(false);
			} else if overshoot >= u64::from(interval) {
				timer.remaining.set(1);
			} else {
				timer.remaining.set(interval - overshoot as u32);
			}
			fired[count] = Some(client);
			count += 1;
		}
		// Events fire outside the lock, in registration order.
		for client in fired.into_iter().flatten() {
			client.timer_event();
		}
	}
}

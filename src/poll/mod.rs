//! Cooperative polling runtime.
//!
//! Everything in the stack is driven from one service loop. Objects register
//! with a [`Scheduler`] in one of two roles: [`Always`] handlers run on every
//! [`Scheduler::service`] pass (hardware polling lives here), and
//! [`OnDemand`] handlers run once per request, flagged through their
//! [`Demand`] token from any context including interrupts. Timers are layered
//! on top by the [`Timekeeper`], itself an on-demand handler.
//!
//! Registries are fixed slot arrays behind the crate's critical-section
//! lock; the lock is never held across a callback. Registered objects use
//! shared references with interior mutability, and unregister explicitly
//! before going away.

mod timer;

pub use self::timer::{PollTimer, Timekeeper, TimerClient};

use core::sync::atomic::{AtomicBool, Ordering};

use crate::sync::CritMutex;
use crate::util::Registry;
use crate::{Error, Result};

/// Reject registry misuse: log in normal builds, abort under `paranoia`.
macro_rules! misuse {
	($($arg:tt)+) => {{
		#[cfg(feature = "paranoia")]
		panic!($($arg)+);
		#[cfg(not(feature = "paranoia"))]
		warn!($($arg)+);
	}};
}
pub(crate) use misuse;

/// Polled on every service pass.
pub trait Always {
	fn poll_always(&self);
}

/// Polled once for every request made through its [`Demand`] token.
pub trait OnDemand {
	/// The request flag embedded in the implementing object.
	fn demand(&self) -> &Demand;

	fn poll_demand(&self);
}

/// One-shot poll request flag.
///
/// Embedded by value in every [`OnDemand`] object. Requesting is idempotent
/// while a request is pending, and safe from interrupt context; the flag
/// returns to idle when the scheduler claims it, so a request made during
/// the object's own callback schedules one further pass.
#[derive(Debug, Default)]
pub struct Demand {
	requested: AtomicBool,
}

impl Demand {
	pub const fn new() -> Self {
		Demand {
			requested: AtomicBool::new(false),
		}
	}

	/// Ask for one `poll_demand` call. Returns `true` if this transitioned
	/// the flag from idle to pending.
	pub fn request_poll(&self) -> bool {
		!self.requested.swap(true, Ordering::AcqRel)
	}

	/// Withdraw a pending request, if any.
	pub fn request_cancel(&self) {
		self.requested.store(false, Ordering::Release);
	}

	pub fn is_pending(&self) -> bool {
		self.requested.load(Ordering::Acquire)
	}

	fn claim(&self) -> bool {
		self.requested.swap(false, Ordering::AcqRel)
	}
}

/// The registries behind the service loop.
///
/// `N` bounds each registry; see [`crate::config::POLL_REGISTRY`] for the
/// conventional size.
pub struct Scheduler<'a, const N: usize = 32> {
	always: CritMutex<Registry<'a, dyn Always + 'a, N>>,
	demand: CritMutex<Registry<'a, dyn OnDemand + 'a, N>>,
}

impl<'a, const N: usize> Scheduler<'a, N> {
	pub fn new() -> Self {
		Scheduler {
			always: CritMutex::new(Registry::new()),
			demand: CritMutex::new(Registry::new()),
		}
	}

	pub fn register_always(&self, item: &'a dyn Always) -> Result<()> {
		let result = self.always.lock().add(item);
		if result == Err(Error::AlreadyRegistered) {
			misuse!("poll: duplicate always registration");
		}
		result
	}

	pub fn unregister_always(&self, item: &'a dyn Always) {
		self.always.lock().remove(item);
	}

	pub fn register_demand(&self, item: &'a dyn OnDemand) -> Result<()> {
		let result = self.demand.lock().add(item);
		if result == Err(Error::AlreadyRegistered) {
			misuse!("poll: duplicate on-demand registration");
		}
		result
	}

	pub fn unregister_demand(&self, item: &'a dyn OnDemand) {
		item.demand().request_cancel();
		self.demand.lock().remove(item);
	}

	/// One pass: every `Always` handler, then every claimed demand.
	///
	/// The pending set is claimed up front, so requests made during a
	/// callback (including an object re-requesting itself) are deferred to
	/// the next pass. Returns the number of demand callbacks dispatched.
	pub fn service(&self) -> usize {
		let always = self.always.lock().snapshot();
		for item in always.into_iter().flatten() {
			item.poll_always();
		}

		// Claim the whole pending set before dispatching any of it, so a
		// request made during a callback lands in the next pass.
		let registered = self.demand.lock().snapshot();
		let mut claimed: [Option<&dyn OnDemand>; N] = [None; N];
		let mut count = 0;
		for item in registered.into_iter().flatten() {
			if item.demand().claim() {
				claimed[count] = Some(item);
				count += 1;
			}
		}
		for item in claimed.into_iter().flatten() {
			item.poll_demand();
		}
		count
	}

	/// Service until the demand queue is quiet, at most `limit` passes.
	///
	/// Returns the total number of demand callbacks dispatched.
	pub fn service_all(&self, limit: usize) -> usize {
		let mut total = 0;
		for _ in 0..limit {
			total += self.service();
			if !self.pending() {
				break;
			}
		}
		total
	}

	/// Whether any registered on-demand handler has a pending request.
	pub fn pending(&self) -> bool {
		self.demand.lock().iter().any(|d| d.demand().is_pending())
	}
}

impl<const N: usize> Default for Scheduler<'_, N> {
	fn default() -> Self {
		Self::new()
	}
}

//! `satnet` is a heap-free network stack for resource-constrained systems:
//! microcontrollers, softcore CPUs riding beside an FPGA switch fabric, and
//! hosted simulations of either. It provides Ethernet, ARP, IPv4, ICMP and
//! UDP over raw frames, plus a lockstep reliable byte-pipe, all driven by a
//! single cooperative polling loop.
//!
//! The crate never allocates: every buffer is owned by a caller-constructed
//! object with fixed capacity, shared structures are index-linked pools, and
//! the polling registries are fixed-size vectors behind a short critical
//! section. Hardware ports sit behind the [`io::Readable`] / [`io::Writeable`]
//! seam and a [`port::PortIo`] pair of streams; everything above that line is
//! portable.
//!
//! A stack instance is wired explicitly: construct the buffers, dispatch
//! layers and protocol handlers, register them with each other and with a
//! [`poll::Scheduler`], then call [`poll::Scheduler::service`] from the main
//! loop (and [`poll::Timekeeper::tick`] from a periodic interrupt).

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;

pub mod buf;
pub mod config;
pub mod io;
pub mod net;
pub mod poll;
pub mod port;
pub mod sync;
pub mod time;
pub mod tpipe;
mod util;

/// Setup and registration failures.
///
/// The streaming fast path never reports through this type; overflow,
/// underflow and not-ready conditions stay in-band on the I/O traits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
	/// A fixed-capacity registry has no free slot.
	#[error("registry full")]
	RegistryFull,
	/// The object (or an equal type key) is already registered.
	#[error("already registered")]
	AlreadyRegistered,
	/// The routing table has no free row.
	#[error("routing table full")]
	TableFull,
	/// The destination has not been resolved yet.
	#[error("link not ready")]
	NotReady,
	/// A caller-supplied parameter is out of range.
	#[error("invalid parameter")]
	InvalidParam,
}

pub type Result<T> = core::result::Result<T, Error>;

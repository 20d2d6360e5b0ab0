//! Lockstep reliable byte-pipe.
//!
//! A stop-and-wait transport over any [`net::Address`]: the sender never
//! advances past the last acknowledged byte, so one 512-byte window and two
//! 16-bit modular positions are the whole protocol. Frames carry a 6-byte
//! header (`flags[15]` START, `flags[14]` STOP, `flags[9:0]` payload
//! length, then the sender's position after this payload and its receive
//! acknowledgement), and everything survives on retransmission: duplicate
//! payload bytes are accepted only for their new suffix, duplicate STARTs
//! re-acknowledge without resetting the session, and pure acknowledgements
//! are never answered with more pure acknowledgements.
//!
//! Bind a pipe by registering it as a protocol handler on a dispatch layer
//! (raw Ethernet or UDP) and pointing it at the matching address object;
//! register it with a timekeeper for retransmission.

use core::cell::{Cell, RefCell};

use bitflags::bitflags;
use rand_chacha::rand_core::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::buf::StreamBuffer;
use crate::config;
use crate::io::{LimitedRead, Readable, Writeable};
use crate::net::{self, Address, Protocol};
use crate::poll::{PollTimer, TimerClient};
use crate::time::TimeRef;

const FLAG_START: u16 = 0x8000;
const FLAG_STOP: u16 = 0x4000;
const LEN_MASK: u16 = 0x03FF;

/// Window and buffer size; also the largest per-frame payload.
pub const BLOCK: usize = config::TPIPE_MAX_BLOCK;

bitflags! {
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	struct State: u16 {
		/// START sent, waiting for the acknowledgement.
		const OPEN_REQ = 1 << 0;
		/// Positions synchronised with the peer.
		const READY = 1 << 1;
		/// A data block is outstanding.
		const TX_BUSY = 1 << 2;
		/// Close requested locally.
		const CLOSING = 1 << 3;
		/// Fire-and-forget mode: no acknowledgements, no timeout.
		const TX_ONLY = 1 << 4;
	}
}

struct Inner {
	flags: State,
	/// Position of the first unacknowledged byte (head of the tx FIFO).
	tx_ref: u16,
	/// Next inbound position we expect (and acknowledge).
	rx_pos: u16,
	/// The peer's initial position, for duplicate-START detection.
	rx_ref: u16,
	/// Milliseconds of retry time without acknowledgement progress.
	stalled_ms: u32,
	tx: StreamBuffer<'static, BLOCK>,
	rx: StreamBuffer<'static, BLOCK>,
}

/// One end of a lockstep byte-pipe.
pub struct Tpipe<'a> {
	addr: &'a dyn net::Address,
	inner: RefCell<Inner>,
	timer: PollTimer,
	/// Delay programmed into the timer, for stall accounting.
	last_delay: Cell<u32>,
	rng: RefCell<ChaCha8Rng>,
}

impl<'a> Tpipe<'a> {
	pub fn new(addr: &'a dyn net::Address, clock: &dyn TimeRef) -> Self {
		Tpipe {
			addr,
			inner: RefCell::new(Inner {
				flags: State::empty(),
				tx_ref: 0,
				rx_pos: 0,
				rx_ref: 0,
				stalled_ms: 0,
				tx: StreamBuffer::new(),
				rx: StreamBuffer::new(),
			}),
			timer: PollTimer::new(),
			last_delay: Cell::new(0),
			rng: RefCell::new(ChaCha8Rng::seed_from_u64(clock.raw() ^ 0x7069_7065)),
		}
	}

	/// Initiate a session: randomise positions and send START.
	pub fn connect(&self) {
		{
			let mut rng = self.rng.borrow_mut();
			let mut inner = self.inner.borrow_mut();
			inner.flags = State::OPEN_REQ;
			inner.tx_ref = rng.next_u32() as u16;
			let rx0 = rng.next_u32() as u16;
			inner.rx_pos = rx0;
			inner.rx_ref = rx0;
			inner.stalled_ms = 0;
			inner.tx.clear();
			inner.rx.clear();
		}
		debug!("tpipe: connecting");
		self.send_start();
	}

	/// Stream without a peer: every send consumes immediately, nothing is
	/// retransmitted and the pipe never times out. A best-effort START is
	/// sent so an attached listener can synchronise.
	pub fn connect_tx_only(&self) {
		{
			let mut rng = self.rng.borrow_mut();
			let mut inner = self.inner.borrow_mut();
			inner.flags = State::READY | State::TX_ONLY;
			inner.tx_ref = rng.next_u32() as u16;
			inner.rx_pos = 0;
			inner.rx_ref = 0;
			inner.stalled_ms = 0;
			inner.tx.clear();
			inner.rx.clear();
		}
		let (tx_ref, rx_pos) = {
			let inner = self.inner.borrow();
			(inner.tx_ref, inner.rx_pos)
		};
		self.addr.open_write(6, &mut |w| {
			w.write_u16(FLAG_START);
			w.write_u16(tx_ref);
			w.write_u16(rx_pos);
		});
	}

	/// Request a graceful close: tell the peer once, do not wait.
	pub fn close(&self) {
		let send_stop = {
			let mut inner = self.inner.borrow_mut();
			let was_ready = inner.flags.contains(State::READY);
			inner.flags = State::CLOSING;
			was_ready
		};
		self.timer.disarm();
		if send_stop {
			let (tx_ref, rx_pos) = {
				let inner = self.inner.borrow();
				(inner.tx_ref, inner.rx_pos)
			};
			debug!("tpipe: closing");
			self.addr.open_write(6, &mut |w| {
				w.write_u16(FLAG_STOP);
				w.write_u16(tx_ref);
				w.write_u16(rx_pos);
			});
		}
	}

	/// Positions synchronised and the session open.
	pub fn is_ready(&self) -> bool {
		self.inner.borrow().flags.contains(State::READY)
	}

	/// No session: never opened, closed, or timed out.
	pub fn is_closed(&self) -> bool {
		!self
			.inner
			.borrow()
			.flags
			.intersects(State::READY | State::OPEN_REQ)
	}

	/// Everything written has been delivered and acknowledged.
	pub fn completed(&self) -> bool {
		let inner = self.inner.borrow();
		inner.tx.bytes_ready() == 0 && !inner.flags.contains(State::TX_BUSY)
	}

	pub fn space(&self) -> usize {
		self.inner.borrow().tx.space()
	}

	pub fn bytes_ready(&self) -> usize {
		self.inner.borrow().rx.bytes_ready()
	}

	pub fn read_next(&self) -> Option<u8> {
		self.inner.borrow_mut().rx.read_next()
	}

	pub fn read_bytes(&self, dst: &mut [u8]) -> bool {
		self.inner.borrow_mut().rx.read_bytes(dst)
	}

	pub fn read_consume(&self, n: usize) -> bool {
		self.inner.borrow_mut().rx.read_consume(n)
	}

	pub fn write_bytes(&self, data: &[u8]) {
		self.inner.borrow_mut().tx.write_bytes(data);
	}

	pub fn write_next_byte(&self, byte: u8) {
		self.inner.borrow_mut().tx.write_next(byte);
	}

	pub fn write_overflow(&self) {
		self.inner.borrow_mut().tx.write_overflow();
	}

	pub fn write_abort(&self) {
		self.inner.borrow_mut().tx.write_abort();
	}

	/// Commit queued bytes and, when the line is idle, start sending.
	pub fn write_finalize(&self) -> bool {
		let (ok, kick) = {
			let mut inner = self.inner.borrow_mut();
			let ok = inner.tx.write_finalize();
			let kick = inner.flags.contains(State::READY)
				&& (inner.flags.contains(State::TX_ONLY)
					|| !inner.flags.contains(State::TX_BUSY))
				&& inner.tx.bytes_ready() > 0;
			(ok, kick)
		};
		if kick {
			self.send_block(false);
		}
		ok
	}

	fn jittered_delay(&self) -> u32 {
		let base = config::TPIPE_RETRANSMIT_MSEC;
		base + self.rng.borrow_mut().next_u32() % (base / 2)
	}

	fn arm(&self, msec: u32) {
		self.last_delay.set(msec);
		self.timer.set_once(msec);
	}

	fn send_start(&self) {
		let (tx_ref, rx_pos) = {
			let inner = self.inner.borrow();
			(inner.tx_ref, inner.rx_pos)
		};
		let ok = self.addr.open_write(6, &mut |w| {
			w.write_u16(FLAG_START);
			w.write_u16(tx_ref);
			w.write_u16(rx_pos);
		});
		if ok {
			self.arm(self.jittered_delay());
		} else {
			self.arm(config::TPIPE_POLL_MSEC);
		}
	}

	/// Emit one block: pending data from the window head, or a pure
	/// acknowledgement when `force` asks for one.
	fn send_block(&self, force: bool) {
		let inner = self.inner.borrow();
		if !inner.flags.contains(State::READY) {
			return;
		}
		let len = inner.tx.peek_ready().min(BLOCK);
		if len == 0 && !force {
			return;
		}
		let tx_end = inner.tx_ref.wrapping_add(len as u16);
		let rx_ack = inner.rx_pos;
		let data = inner.tx.peek();
		let ok = self.addr.open_write(6 + len, &mut |w| {
			w.write_u16(len as u16);
			w.write_u16(tx_end);
			w.write_u16(rx_ack);
			w.write_bytes(&data[..len]);
		});
		let tx_only = inner.flags.contains(State::TX_ONLY);
		drop(inner);
		if !ok {
			// Egress not ready (queue full or ARP pending): poll again.
			self.arm(config::TPIPE_POLL_MSEC);
			return;
		}
		if len > 0 {
			let mut inner = self.inner.borrow_mut();
			if tx_only {
				inner.tx.read_consume(len);
				inner.tx_ref = inner.tx_ref.wrapping_add(len as u16);
			} else {
				inner.flags.insert(State::TX_BUSY);
			}
		}
		if len > 0 && !tx_only {
			self.arm(self.jittered_delay());
		}
	}

	fn frame_event(&self, flags: u16, tx_pos: u16, rx_pos: u16, data: &[u8]) {
		let start = flags & FLAG_START != 0;
		let stop = flags & FLAG_STOP != 0;
		let len = data.len();
		let mut respond = false;
		let mut kick = false;
		{
			let mut inner = self.inner.borrow_mut();
			if stop {
				debug!("tpipe: peer closed");
				inner.flags = State::empty();
				self.timer.disarm();
				return;
			}
			if start {
				if inner.flags.contains(State::READY) {
					if tx_pos == inner.rx_ref {
						// Retransmitted START: our acknowledgement was
						// lost. Re-acknowledge, keep the session.
						respond = true;
					} else {
						warn!("tpipe: unexpected START mid-session");
					}
				} else if !inner.flags.contains(State::OPEN_REQ) {
					// Passive open: adopt the initiator's positions.
					debug!("tpipe: session adopted");
					inner.flags = State::READY;
					inner.tx_ref = rx_pos;
					inner.rx_pos = tx_pos;
					inner.rx_ref = tx_pos;
					inner.stalled_ms = 0;
					inner.tx.clear();
					inner.rx.clear();
					respond = true;
				}
			}
			if inner.flags.contains(State::OPEN_REQ) && rx_pos == inner.tx_ref {
				// The peer acknowledged our START.
				debug!("tpipe: session open");
				inner.flags.remove(State::OPEN_REQ);
				inner.flags.insert(State::READY);
				inner.rx_pos = tx_pos;
				inner.rx_ref = tx_pos;
				inner.stalled_ms = 0;
			}
			if inner.flags.contains(State::READY) {
				// Acknowledgement first, so a piggybacked ack can free the
				// window before we consider sending more.
				let queued = inner.tx.bytes_ready() as u16;
				let advance = rx_pos.wrapping_sub(inner.tx_ref);
				if advance > 0 && advance <= queued {
					inner.tx.read_consume(usize::from(advance));
					inner.tx_ref = rx_pos;
					inner.stalled_ms = 0;
					inner.flags.remove(State::TX_BUSY);
					if inner.tx.bytes_ready() == 0 {
						self.timer.disarm();
					}
					kick = true;
				}

				// New payload is whatever extends past our position;
				// overlap from a retransmission is dropped.
				if len > 0 {
					let diff = tx_pos.wrapping_sub(inner.rx_pos);
					if diff > 0 && usize::from(diff) <= len {
						let fresh = usize::from(diff);
						let take = fresh.min(inner.rx.space());
						let offset = len - fresh;
						inner.rx.write_bytes(&data[offset..offset + take]);
						inner.rx.write_finalize();
						inner.rx_pos = inner.rx_pos.wrapping_add(take as u16);
					}
					// Data frames always deserve an acknowledgement; pure
					// acknowledgements never do.
					respond = true;
				}
			}
		}
		if self.inner.borrow().flags.contains(State::READY) && (respond || kick) {
			self.send_block(respond);
		}
	}
}

impl Protocol for Tpipe<'_> {
	fn frame_rcvd(&self, src: &mut LimitedRead<'_>) {
		let (Some(flags), Some(tx_pos), Some(rx_pos)) =
			(src.read_u16(), src.read_u16(), src.read_u16())
		else {
			trace!("tpipe: runt frame");
			return;
		};
		let len = usize::from(flags & LEN_MASK);
		let mut data = [0u8; BLOCK];
		if len > BLOCK || !src.read_bytes(&mut data[..len]) {
			trace!("tpipe: bad length {len}");
			return;
		}
		self.frame_event(flags, tx_pos, rx_pos, &data[..len]);
	}
}

impl TimerClient for Tpipe<'_> {
	fn timer(&self) -> &PollTimer {
		&self.timer
	}

	fn timer_event(&self) {
		let action = {
			let mut inner = self.inner.borrow_mut();
			if inner.flags.contains(State::TX_ONLY) {
				None
			} else if inner.flags.intersects(State::OPEN_REQ | State::TX_BUSY) {
				inner.stalled_ms = inner.stalled_ms.saturating_add(self.last_delay.get());
				if inner.stalled_ms >= config::TPIPE_TIMEOUT_MSEC {
					warn!("tpipe: retransmit limit, closing");
					inner.flags = State::empty();
					None
				} else if inner.flags.contains(State::OPEN_REQ) {
					Some(true)
				} else {
					Some(false)
				}
			} else if inner.flags.contains(State::READY) && inner.tx.bytes_ready() > 0 {
				// A previous send never went out (egress was busy).
				Some(false)
			} else {
				None
			}
		};
		match action {
			Some(true) => self.send_start(),
			Some(false) => self.send_block(false),
			None => {}
		}
	}
}

macro_rules! forward_tpipe_streams {
	($target:ty) => {
		impl Writeable for $target {
			fn space(&self) -> usize {
				Tpipe::space(self)
			}

			fn write_next(&mut self, byte: u8) {
				Tpipe::write_next_byte(self, byte);
			}

			fn write_overflow(&mut self) {
				Tpipe::write_overflow(self);
			}

			fn write_finalize(&mut self) -> bool {
				Tpipe::write_finalize(self)
			}

			fn write_abort(&mut self) {
				Tpipe::write_abort(self);
			}

			fn write_bytes(&mut self, data: &[u8]) {
				Tpipe::write_bytes(self, data);
			}
		}

		impl Readable for $target {
			fn bytes_ready(&self) -> usize {
				Tpipe::bytes_ready(self)
			}

			fn read_next(&mut self) -> Option<u8> {
				Tpipe::read_next(self)
			}

			fn read_bytes(&mut self, dst: &mut [u8]) -> bool {
				Tpipe::read_bytes(self, dst)
			}

			fn read_consume(&mut self, n: usize) -> bool {
				Tpipe::read_consume(self, n)
			}
		}
	};
}

forward_tpipe_streams!(Tpipe<'_>);
forward_tpipe_streams!(&Tpipe<'_>);

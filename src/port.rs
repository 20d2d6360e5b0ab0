//! The hardware port seam.
//!
//! A port driver owns the actual MAC or switch interface and exposes its
//! receive and transmit queues as [`crate::io::Readable`] /
//! [`crate::io::Writeable`] streams. Because the dispatch layer and an
//! interrupt handler may both touch those queues, access goes through
//! short borrow-scoped callbacks rather than long-lived references.

use core::ops::DerefMut;

use crate::buf::PacketBuffer;
use crate::io::{Readable, Writeable};
use crate::sync::CritMutex;

/// Borrowed access to a port's frame queues.
pub trait PortIo {
	/// Run `f` with exclusive access to the receive stream.
	fn with_rx(&self, f: &mut dyn FnMut(&mut dyn Readable));

	/// Run `f` with exclusive access to the transmit stream.
	fn with_tx(&self, f: &mut dyn FnMut(&mut dyn Writeable));
}

/// A software port: two lock-guarded packet buffers.
///
/// This is the port used by hosted simulations and the test suite, and the
/// template for real drivers whose interrupt handlers feed the same pair of
/// buffers.
pub struct MutexPort<'a, const RX: usize, const TX: usize, const NPKT: usize> {
	rx: CritMutex<PacketBuffer<'a, RX, NPKT>>,
	tx: CritMutex<PacketBuffer<'a, TX, NPKT>>,
}

impl<'a, const RX: usize, const TX: usize, const NPKT: usize> MutexPort<'a, RX, TX, NPKT> {
	pub fn new() -> Self {
		MutexPort {
			rx: CritMutex::new(PacketBuffer::new()),
			tx: CritMutex::new(PacketBuffer::new()),
		}
	}

	/// Lock the receive buffer, e.g. to inject an inbound frame.
	pub fn rx(&self) -> impl DerefMut<Target = PacketBuffer<'a, RX, NPKT>> + '_ {
		self.rx.lock()
	}

	/// Lock the transmit buffer, e.g. to drain outbound frames.
	pub fn tx(&self) -> impl DerefMut<Target = PacketBuffer<'a, TX, NPKT>> + '_ {
		self.tx.lock()
	}
}

impl<const RX: usize, const TX: usize, const NPKT: usize> Default for MutexPort<'_, RX, TX, NPKT> {
	fn default() -> Self {
		Self::new()
	}
}

impl<const RX: usize, const TX: usize, const NPKT: usize> PortIo for MutexPort<'_, RX, TX, NPKT> {
	fn with_rx(&self, f: &mut dyn FnMut(&mut dyn Readable)) {
		f(&mut *self.rx.lock());
	}

	fn with_tx(&self, f: &mut dyn FnMut(&mut dyn Writeable)) {
		f(&mut *self.tx.lock());
	}
}

/// Move every committed record from `src` to `dst`, preserving boundaries.
///
/// Records that do not fit in `dst` are dropped. Returns the number of
/// records moved; the building block for hosted back-to-back port wiring.
pub fn pump(src: &mut dyn Readable, dst: &mut dyn Writeable) -> usize {
	let mut moved = 0;
	loop {
		let n = src.bytes_ready();
		if n == 0 {
			break;
		}
		while src.copy_to(dst) > 0 {}
		if src.bytes_ready() == 0 && dst.write_finalize() {
			moved += 1;
		} else {
			dst.write_abort();
		}
		src.read_finalize();
	}
	moved
}

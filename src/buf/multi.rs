//! Shared chunk-pool packet buffering.
//!
//! One [`MultiBuffer`] owns a pool of small fixed-size chunks and a pool of
//! packet descriptors, shared by any number of writers and readers. A
//! [`MultiWriter`] assembles a packet chunk-by-chunk; on finalize the packet
//! enters a delivery queue that the buffer drains as an on-demand handler,
//! fanning each packet out by reference to every accepting reader. The
//! packet's reference count equals the number of accepting readers, and the
//! last reader's `read_finalize` returns its chunks to the pool; a packet
//! accepted by nobody is freed before delivery finishes.
//!
//! All pool state lives behind the crate's critical-section lock, indexed by
//! pool position rather than by pointer. The lock is never held across a
//! reader or writer callback.
//!
//! Ports are registered as shared references, so the stream traits are also
//! implemented on `&MultiWriter` and `&MultiReader*`, the way `std` does for
//! `&File`; the underlying state is interior-mutable either way.

use core::cell::{Cell, RefCell};

use heapless::binary_heap::{BinaryHeap, Min};
use heapless::Deque;

use crate::config;
use crate::io::{Readable, Writeable};
use crate::poll::{Demand, OnDemand, PollTimer, TimerClient};
use crate::sync::CritMutex;
use crate::time::{TimeRef, TimeVal};
use crate::util::Registry;
use crate::Result;

/// Payload bytes per chunk.
pub const CHUNK_BYTES: usize = config::MBUF_CHUNK_BYTES;

/// End-of-list marker for pool indices.
const NIL: u16 = u16::MAX;

fn uz(idx: u16) -> usize {
	usize::from(idx)
}

#[derive(Clone, Copy)]
struct Chunk {
	data: [u8; CHUNK_BYTES],
	next: u16,
}

#[derive(Clone, Copy)]
struct Packet {
	/// Chunk chain.
	head: u16,
	tail: u16,
	/// Total byte length; grows while the writer appends.
	len: u32,
	/// Readers still holding the packet once delivered.
	refct: u8,
	prio: u8,
	/// Monotonic finalize counter, the FIFO tie-break for priority queues.
	count: u32,
	/// Delivery-queue link.
	next: u16,
	/// Scratch slots for the timestamping layers; never touched here.
	meta: [u32; 2],
}

/// A reader's ticket for one delivered packet.
#[derive(Clone, Copy, Debug)]
pub struct PktHandle {
	idx: u16,
	head: u16,
	len: u32,
	prio: u8,
	count: u32,
}

impl PktHandle {
	pub fn len(&self) -> usize {
		self.len as usize
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub fn priority(&self) -> u8 {
		self.prio
	}
}

/// Read position inside a packet's chunk chain.
#[derive(Clone, Copy)]
pub struct Cursor {
	chunk: u16,
	off: u16,
}

struct Pools<const CHUNKS: usize, const PKTS: usize> {
	chunks: [Chunk; CHUNKS],
	free_chunk: u16,
	free_chunks: u16,
	pkts: [Packet; PKTS],
	free_pkt: u16,
	/// Finalized packets awaiting fan-out.
	dq_head: u16,
	dq_tail: u16,
	counter: u32,
}

impl<const CHUNKS: usize, const PKTS: usize> Pools<CHUNKS, PKTS> {
	fn new() -> Self {
		assert!(CHUNKS < uz(NIL) && PKTS < uz(NIL));
		let mut pools = Pools {
			chunks: [Chunk {
				data: [0; CHUNK_BYTES],
				next: NIL,
			}; CHUNKS],
			free_chunk: 0,
			free_chunks: CHUNKS as u16,
			pkts: [Packet {
				head: NIL,
				tail: NIL,
				len: 0,
				refct: 0,
				prio: 0,
				count: 0,
				next: NIL,
				meta: [0; 2],
			}; PKTS],
			free_pkt: 0,
			dq_head: NIL,
			dq_tail: NIL,
			counter: 0,
		};
		for i in 0..CHUNKS {
			pools.chunks[i].next = if i + 1 < CHUNKS { (i + 1) as u16 } else { NIL };
		}
		for i in 0..PKTS {
			pools.pkts[i].next = if i + 1 < PKTS { (i + 1) as u16 } else { NIL };
		}
		pools
	}

	fn alloc_chunk(&mut self) -> Option<u16> {
		let idx = self.free_chunk;
		if idx == NIL {
			return None;
		}
		self.free_chunk = self.chunks[uz(idx)].next;
		self.free_chunks -= 1;
		self.chunks[uz(idx)].next = NIL;
		Some(idx)
	}

	fn free_chunk(&mut self, idx: u16) {
		self.chunks[uz(idx)].next = self.free_chunk;
		self.free_chunk = idx;
		self.free_chunks += 1;
	}

	fn free_packet(&mut self, pkt: u16) {
		let mut chunk = self.pkts[uz(pkt)].head;
		while chunk != NIL {
			let next = self.chunks[uz(chunk)].next;
			self.free_chunk(chunk);
			chunk = next;
		}
		let p = &mut self.pkts[uz(pkt)];
		p.head = NIL;
		p.tail = NIL;
		p.len = 0;
		p.refct = 0;
		p.next = self.free_pkt;
		self.free_pkt = pkt;
	}
}

/// Pool operations shared by writers and readers.
///
/// Implemented by [`MultiBuffer`]; user code interacts through
/// [`MultiWriter`] and the reader types instead.
pub trait MultiCore {
	/// Take a fresh packet descriptor, or `None` when the pool is dry.
	fn pkt_alloc(&self) -> Option<u16>;

	/// Append bytes, allocating chunks as needed. Returns the bytes
	/// actually stored; a short count means allocator starvation.
	fn pkt_append(&self, pkt: u16, data: &[u8]) -> usize;

	/// Bytes appendable to `pkt` (or to a fresh packet if `u16::MAX`)
	/// before the chunk pool runs dry.
	fn pkt_avail(&self, pkt: u16) -> usize;

	/// Hand a finished packet to the delivery queue.
	fn pkt_commit(&self, pkt: u16, prio: u8);

	/// Return an unfinished packet's chunks and descriptor to the pools.
	fn pkt_discard(&self, pkt: u16);

	/// Copy bytes from `cursor`, advancing it. Bounded by the chain; the
	/// caller bounds `dst` by the packet length.
	fn pkt_read(&self, cursor: &mut Cursor, dst: &mut [u8]) -> usize;

	/// Advance `cursor` without copying.
	fn pkt_skip(&self, cursor: &mut Cursor, n: usize);

	/// Drop one reference to a delivered packet, freeing it at zero.
	fn pkt_release(&self, pkt: u16);

	/// Metadata slot access for the timestamping layers.
	fn pkt_meta(&self, pkt: u16, slot: usize) -> u32;
	fn pkt_set_meta(&self, pkt: u16, slot: usize, value: u32);

	/// The clock backing the port watchdogs.
	fn clock(&self) -> &dyn TimeRef;
}

/// A port attached to a [`MultiBuffer`]: offered every delivered packet,
/// and scanned by the buffer's watchdog timer.
pub trait MultiPort {
	/// Take (and queue) a newly delivered packet. Writers and disabled or
	/// full readers return `false`.
	fn deliver(&self, handle: PktHandle) -> bool;

	/// Reclaim abandoned state if this port has stalled.
	fn check_watchdog(&self);
}

/// The shared pool plus delivery machinery.
///
/// Register the buffer with a [`crate::poll::Scheduler`] (on-demand) and a
/// [`crate::poll::Timekeeper`] (watchdog scan), then attach ports.
pub struct MultiBuffer<'a, const CHUNKS: usize, const PKTS: usize, const PORTS: usize = 8> {
	pools: CritMutex<Pools<CHUNKS, PKTS>>,
	ports: CritMutex<Registry<'a, dyn MultiPort + 'a, PORTS>>,
	debug: RefCell<Option<&'a mut dyn Writeable>>,
	demand: Demand,
	timer: PollTimer,
	clock: &'a dyn TimeRef,
}

impl<'a, const CHUNKS: usize, const PKTS: usize, const PORTS: usize>
	MultiBuffer<'a, CHUNKS, PKTS, PORTS>
{
	pub fn new(clock: &'a dyn TimeRef) -> Self {
		let timer = PollTimer::new();
		timer.set_every(config::MBUF_SCAN_MSEC);
		MultiBuffer {
			pools: CritMutex::new(Pools::new()),
			ports: CritMutex::new(Registry::new()),
			debug: RefCell::new(None),
			demand: Demand::new(),
			timer,
			clock,
		}
	}

	pub fn register_port(&self, port: &'a dyn MultiPort) -> Result<()> {
		self.ports.lock().add(port)
	}

	pub fn unregister_port(&self, port: &'a dyn MultiPort) {
		self.ports.lock().remove(port);
	}

	/// Attach a sink that receives a carbon copy of every delivered packet.
	pub fn set_debug(&self, sink: Option<&'a mut dyn Writeable>) {
		*self.debug.borrow_mut() = sink;
	}

	/// Chunks currently on the free list.
	pub fn free_chunks(&self) -> usize {
		uz(self.pools.lock().free_chunks)
	}

	/// Total chunks in the pool.
	pub const fn total_chunks(&self) -> usize {
		CHUNKS
	}

	fn pop_delivery(&self) -> Option<PktHandle> {
		let mut pools = self.pools.lock();
		let idx = pools.dq_head;
		if idx == NIL {
			return None;
		}
		pools.dq_head = pools.pkts[uz(idx)].next;
		pools.pkts[uz(idx)].next = NIL;
		if pools.dq_head == NIL {
			pools.dq_tail = NIL;
		}
		let p = &pools.pkts[uz(idx)];
		Some(PktHandle {
			idx,
			head: p.head,
			len: p.len,
			prio: p.prio,
			count: p.count,
		})
	}

	fn debug_copy(&self, handle: PktHandle) {
		let mut debug = self.debug.borrow_mut();
		let Some(sink) = debug.as_mut() else {
			return;
		};
		let mut cursor = Cursor {
			chunk: handle.head,
			off: 0,
		};
		let mut rem = handle.len();
		let mut tmp = [0u8; CHUNK_BYTES];
		while rem > 0 {
			let n = rem.min(CHUNK_BYTES);
			self.pkt_read(&mut cursor, &mut tmp[..n]);
			sink.write_bytes(&tmp[..n]);
			rem -= n;
		}
		sink.write_finalize();
	}

	fn deliver_all(&self) {
		while let Some(handle) = self.pop_delivery() {
			self.debug_copy(handle);
			let ports = self.ports.lock().snapshot();
			let mut accepted: u8 = 0;
			for port in ports.into_iter().flatten() {
				if port.deliver(handle) {
					accepted += 1;
				}
			}
			let mut pools = self.pools.lock();
			if accepted == 0 {
				trace!("mbuf: packet {} dropped, no reader", handle.count);
				pools.free_packet(handle.idx);
			} else {
				pools.pkts[uz(handle.idx)].refct = accepted;
			}
		}
	}

	fn scan_watchdogs(&self) {
		let ports = self.ports.lock().snapshot();
		for port in ports.into_iter().flatten() {
			port.check_watchdog();
		}
	}
}

impl<const CHUNKS: usize, const PKTS: usize, const PORTS: usize> MultiCore
	for MultiBuffer<'_, CHUNKS, PKTS, PORTS>
{
	fn pkt_alloc(&self) -> Option<u16> {
		let mut pools = self.pools.lock();
		let idx = pools.free_pkt;
		if idx == NIL {
			return None;
		}
		pools.free_pkt = pools.pkts[uz(idx)].next;
		let p = &mut pools.pkts[uz(idx)];
		p.next = NIL;
		p.head = NIL;
		p.tail = NIL;
		p.len = 0;
		p.refct = 0;
		p.prio = 0;
		p.meta = [0; 2];
		Some(idx)
	}

	fn pkt_append(&self, pkt: u16, data: &[u8]) -> usize {
		let mut pools = self.pools.lock();
		let mut written = 0;
		while written < data.len() {
			let (len, head, tail) = {
				let p = &pools.pkts[uz(pkt)];
				(p.len as usize, p.head, p.tail)
			};
			let tail_used = len % CHUNK_BYTES;
			let need_fresh = head == NIL || (tail_used == 0 && len > 0);
			let (tail, fill) = if need_fresh {
				let Some(fresh) = pools.alloc_chunk() else {
					break; // starvation: report the short count
				};
				if head == NIL {
					pools.pkts[uz(pkt)].head = fresh;
				} else {
					pools.chunks[uz(tail)].next = fresh;
				}
				pools.pkts[uz(pkt)].tail = fresh;
				(fresh, 0)
			} else {
				(tail, tail_used)
			};
			let n = (data.len() - written).min(CHUNK_BYTES - fill);
			pools.chunks[uz(tail)].data[fill..fill + n]
				.copy_from_slice(&data[written..written + n]);
			pools.pkts[uz(pkt)].len += n as u32;
			written += n;
		}
		written
	}

	fn pkt_avail(&self, pkt: u16) -> usize {
		let pools = self.pools.lock();
		let free = uz(pools.free_chunks) * CHUNK_BYTES;
		if pkt == NIL {
			return free;
		}
		let p = &pools.pkts[uz(pkt)];
		let tail_used = p.len as usize % CHUNK_BYTES;
		let slack = if p.head != NIL && tail_used > 0 {
			CHUNK_BYTES - tail_used
		} else {
			0
		};
		free + slack
	}

	fn pkt_commit(&self, pkt: u16, prio: u8) {
		{
			let mut pools = self.pools.lock();
			let count = pools.counter;
			pools.counter = pools.counter.wrapping_add(1);
			{
				let p = &mut pools.pkts[uz(pkt)];
				p.prio = prio;
				p.count = count;
				p.next = NIL;
			}
			let tail = pools.dq_tail;
			if tail == NIL {
				pools.dq_head = pkt;
			} else {
				pools.pkts[uz(tail)].next = pkt;
			}
			pools.dq_tail = pkt;
		}
		self.demand.request_poll();
	}

	fn pkt_discard(&self, pkt: u16) {
		self.pools.lock().free_packet(pkt);
	}

	fn pkt_read(&self, cursor: &mut Cursor, dst: &mut [u8]) -> usize {
		let pools = self.pools.lock();
		let mut copied = 0;
		while copied < dst.len() && cursor.chunk != NIL {
			let chunk = &pools.chunks[uz(cursor.chunk)];
			let off = uz(cursor.off);
			let n = (dst.len() - copied).min(CHUNK_BYTES - off);
			dst[copied..copied + n].copy_from_slice(&chunk.data[off..off + n]);
			copied += n;
			if off + n == CHUNK_BYTES {
				cursor.chunk = chunk.next;
				cursor.off = 0;
			} else {
				cursor.off = (off + n) as u16;
			}
		}
		copied
	}

	fn pkt_skip(&self, cursor: &mut Cursor, n: usize) {
		let pools = self.pools.lock();
		let mut rem = n;
		while rem > 0 && cursor.chunk != NIL {
			let off = uz(cursor.off);
			let step = rem.min(CHUNK_BYTES - off);
			rem -= step;
			if off + step == CHUNK_BYTES {
				cursor.chunk = pools.chunks[uz(cursor.chunk)].next;
				cursor.off = 0;
			} else {
				cursor.off = (off + step) as u16;
			}
		}
	}

	fn pkt_release(&self, pkt: u16) {
		let mut pools = self.pools.lock();
		let p = &mut pools.pkts[uz(pkt)];
		debug_assert!(p.refct > 0);
		p.refct = p.refct.saturating_sub(1);
		if p.refct == 0 {
			pools.free_packet(pkt);
		}
	}

	fn pkt_meta(&self, pkt: u16, slot: usize) -> u32 {
		self.pools.lock().pkts[uz(pkt)].meta[slot]
	}

	fn pkt_set_meta(&self, pkt: u16, slot: usize, value: u32) {
		self.pools.lock().pkts[uz(pkt)].meta[slot] = value;
	}

	fn clock(&self) -> &dyn TimeRef {
		self.clock
	}
}

impl<const CHUNKS: usize, const PKTS: usize, const PORTS: usize> OnDemand
	for MultiBuffer<'_, CHUNKS, PKTS, PORTS>
{
	fn demand(&self) -> &Demand {
		&self.demand
	}

	fn poll_demand(&self) {
		self.deliver_all();
		self.scan_watchdogs();
	}
}

impl<const CHUNKS: usize, const PKTS: usize, const PORTS: usize> TimerClient
	for MultiBuffer<'_, CHUNKS, PKTS, PORTS>
{
	fn timer(&self) -> &PollTimer {
		&self.timer
	}

	fn timer_event(&self) {
		self.demand.request_poll();
	}
}

/// Streams one packet at a time into the shared pool.
///
/// A finalized record becomes one packet in the delivery queue. Exceeding
/// the per-packet limit or starving the chunk allocator poisons the record,
/// and a stalled partial packet is reclaimed by the watchdog (register the
/// writer as a port to opt in).
pub struct MultiWriter<'a> {
	core: &'a dyn MultiCore,
	pkt: Cell<u16>,
	wrlen: Cell<u32>,
	limit: u32,
	prio: Cell<u8>,
	overflow: Cell<bool>,
	last_write: Cell<TimeVal>,
	watchdog_ms: u32,
}

impl<'a> MultiWriter<'a> {
	pub fn new(core: &'a dyn MultiCore) -> Self {
		MultiWriter {
			core,
			pkt: Cell::new(NIL),
			wrlen: Cell::new(0),
			limit: config::MAX_FRAME as u32,
			prio: Cell::new(0),
			overflow: Cell::new(false),
			last_write: Cell::new(core.clock().now()),
			watchdog_ms: config::MBUF_WATCHDOG_MSEC,
		}
	}

	/// Priority tag applied to packets finalized from now on.
	pub fn set_priority(&self, prio: u8) {
		self.prio.set(prio);
	}

	pub fn space(&self) -> usize {
		if self.overflow.get() {
			return 0;
		}
		let limit = (self.limit - self.wrlen.get()) as usize;
		limit.min(self.core.pkt_avail(self.pkt.get()))
	}

	pub fn write_bytes(&self, data: &[u8]) {
		if self.overflow.get() || data.is_empty() {
			return;
		}
		self.last_write.set(self.core.clock().now());
		if self.pkt.get() == NIL {
			match self.core.pkt_alloc() {
				Some(idx) => self.pkt.set(idx),
				None => {
					self.overflow.set(true);
					return;
				}
			}
		}
		if self.wrlen.get() as usize + data.len() > self.limit as usize {
			self.overflow.set(true);
			return;
		}
		let n = self.core.pkt_append(self.pkt.get(), data);
		self.wrlen.set(self.wrlen.get() + n as u32);
		if n < data.len() {
			self.overflow.set(true);
		}
	}

	pub fn write_finalize(&self) -> bool {
		let pkt = self.pkt.get();
		if self.overflow.get() {
			if pkt != NIL {
				self.core.pkt_discard(pkt);
			}
			self.reset();
			false
		} else if pkt == NIL {
			true // empty record, nothing to deliver
		} else {
			self.core.pkt_commit(pkt, self.prio.get());
			self.reset();
			true
		}
	}

	pub fn write_abort(&self) {
		let pkt = self.pkt.get();
		if pkt != NIL {
			self.core.pkt_discard(pkt);
		}
		self.reset();
	}

	fn reset(&self) {
		self.pkt.set(NIL);
		self.wrlen.set(0);
		self.overflow.set(false);
	}
}

macro_rules! forward_writeable {
	($target:ty) => {
		impl Writeable for $target {
			fn space(&self) -> usize {
				MultiWriter::space(self)
			}

			fn write_next(&mut self, byte: u8) {
				MultiWriter::write_bytes(self, &[byte]);
			}

			fn write_overflow(&mut self) {
				self.overflow.set(true);
			}

			fn write_finalize(&mut self) -> bool {
				MultiWriter::write_finalize(self)
			}

			fn write_abort(&mut self) {
				MultiWriter::write_abort(self);
			}

			fn write_bytes(&mut self, data: &[u8]) {
				MultiWriter::write_bytes(self, data);
			}
		}
	};
}

forward_writeable!(MultiWriter<'_>);
forward_writeable!(&MultiWriter<'_>);

impl MultiPort for MultiWriter<'_> {
	fn deliver(&self, _handle: PktHandle) -> bool {
		false
	}

	fn check_watchdog(&self) {
		let pkt = self.pkt.get();
		if pkt == NIL {
			return;
		}
		let stalled = self.core.clock().elapsed_ms(self.last_write.get());
		if stalled >= u64::from(self.watchdog_ms) {
			warn!("mbuf: writer stalled {stalled} ms, discarding partial packet");
			self.core.pkt_discard(pkt);
			self.reset();
		}
	}
}

/// Queue discipline plugged into the shared reader logic.
trait PktQueue {
	fn push(&mut self, handle: PktHandle) -> bool;
	fn pop(&mut self) -> Option<PktHandle>;
}

impl<const N: usize> PktQueue for Deque<PktHandle, N> {
	fn push(&mut self, handle: PktHandle) -> bool {
		self.push_back(handle).is_ok()
	}

	fn pop(&mut self) -> Option<PktHandle> {
		self.pop_front()
	}
}

/// Heap entry ordered by `(priority, arrival)`.
struct PrioEntry(PktHandle);

impl PartialEq for PrioEntry {
	fn eq(&self, other: &Self) -> bool {
		self.0.prio == other.0.prio && self.0.count == other.0.count
	}
}

impl Eq for PrioEntry {}

impl PartialOrd for PrioEntry {
	fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for PrioEntry {
	fn cmp(&self, other: &Self) -> core::cmp::Ordering {
		(self.0.prio, self.0.count).cmp(&(other.0.prio, other.0.count))
	}
}

impl<const N: usize> PktQueue for BinaryHeap<PrioEntry, Min, N> {
	fn push(&mut self, handle: PktHandle) -> bool {
		BinaryHeap::push(self, PrioEntry(handle)).is_ok()
	}

	fn pop(&mut self) -> Option<PktHandle> {
		BinaryHeap::pop(self).map(|e| e.0)
	}
}

struct ReaderState<Q> {
	queue: Q,
	cur: Option<PktHandle>,
	cursor: Cursor,
	/// Bytes consumed of the current packet.
	pos: u32,
}

impl<Q: PktQueue> ReaderState<Q> {
	fn promote(&mut self) {
		if self.cur.is_none() {
			if let Some(handle) = self.queue.pop() {
				self.cursor = Cursor {
					chunk: handle.head,
					off: 0,
				};
				self.pos = 0;
				self.cur = Some(handle);
			}
		}
	}
}

macro_rules! impl_reader {
	($name:ident, $queue:ty, $doc:expr) => {
		#[doc = $doc]
		///
		/// Reads expose the packet at the head of the queue; `read_finalize`
		/// releases it (freeing it once every accepting reader has done the
		/// same) and moves to the next one.
		pub struct $name<'a, const RXPKT: usize = 32> {
			core: &'a dyn MultiCore,
			state: RefCell<ReaderState<$queue>>,
			enabled: Cell<bool>,
			last_read: Cell<TimeVal>,
			watchdog_ms: u32,
		}

		impl<'a, const RXPKT: usize> $name<'a, RXPKT> {
			pub fn new(core: &'a dyn MultiCore) -> Self {
				$name {
					core,
					state: RefCell::new(ReaderState {
						queue: <$queue>::new(),
						cur: None,
						cursor: Cursor { chunk: NIL, off: 0 },
						pos: 0,
					}),
					enabled: Cell::new(true),
					last_read: Cell::new(core.clock().now()),
					watchdog_ms: config::MBUF_WATCHDOG_MSEC,
				}
			}

			/// A disabled port rejects all deliveries.
			pub fn set_enabled(&self, enabled: bool) {
				self.enabled.set(enabled);
			}

			pub fn bytes_ready(&self) -> usize {
				let mut state = self.state.borrow_mut();
				state.promote();
				state
					.cur
					.map_or(0, |handle| (handle.len - state.pos) as usize)
			}

			pub fn read_bytes(&self, dst: &mut [u8]) -> bool {
				if self.bytes_ready() < dst.len() {
					return false;
				}
				self.last_read.set(self.core.clock().now());
				let mut state = self.state.borrow_mut();
				let mut cursor = state.cursor;
				let n = self.core.pkt_read(&mut cursor, dst);
				debug_assert_eq!(n, dst.len());
				state.cursor = cursor;
				state.pos += n as u32;
				true
			}

			pub fn read_consume(&self, n: usize) -> bool {
				if self.bytes_ready() < n {
					return false;
				}
				self.last_read.set(self.core.clock().now());
				let mut state = self.state.borrow_mut();
				let mut cursor = state.cursor;
				self.core.pkt_skip(&mut cursor, n);
				state.cursor = cursor;
				state.pos += n as u32;
				true
			}

			pub fn read_next(&self) -> Option<u8> {
				let mut byte = [0u8; 1];
				if self.read_bytes(&mut byte) {
					Some(byte[0])
				} else {
					None
				}
			}

			pub fn read_finalize(&self) {
				self.last_read.set(self.core.clock().now());
				let mut state = self.state.borrow_mut();
				if let Some(handle) = state.cur.take() {
					self.core.pkt_release(handle.idx);
				}
				state.pos = 0;
				state.promote();
			}

			fn discard_all(&self) {
				let mut state = self.state.borrow_mut();
				if let Some(handle) = state.cur.take() {
					self.core.pkt_release(handle.idx);
				}
				while let Some(handle) = PktQueue::pop(&mut state.queue) {
					self.core.pkt_release(handle.idx);
				}
				state.pos = 0;
			}
		}

		impl<const RXPKT: usize> MultiPort for $name<'_, RXPKT> {
			fn deliver(&self, handle: PktHandle) -> bool {
				if !self.enabled.get() {
					return false;
				}
				PktQueue::push(&mut self.state.borrow_mut().queue, handle)
			}

			fn check_watchdog(&self) {
				let pending = {
					let mut state = self.state.borrow_mut();
					state.promote();
					state.cur.is_some()
				};
				if !pending {
					self.last_read.set(self.core.clock().now());
					return;
				}
				let stalled = self.core.clock().elapsed_ms(self.last_read.get());
				if stalled >= u64::from(self.watchdog_ms) {
					warn!("mbuf: reader stalled {stalled} ms, discarding queue");
					self.discard_all();
					self.last_read.set(self.core.clock().now());
				}
			}
		}

		impl<const RXPKT: usize> Readable for $name<'_, RXPKT> {
			fn bytes_ready(&self) -> usize {
				$name::bytes_ready(self)
			}

			fn read_next(&mut self) -> Option<u8> {
				$name::read_next(self)
			}

			fn read_finalize(&mut self) {
				$name::read_finalize(self)
			}

			fn read_bytes(&mut self, dst: &mut [u8]) -> bool {
				$name::read_bytes(self, dst)
			}

			fn read_consume(&mut self, n: usize) -> bool {
				$name::read_consume(self, n)
			}
		}

		impl<const RXPKT: usize> Readable for &$name<'_, RXPKT> {
			fn bytes_ready(&self) -> usize {
				$name::bytes_ready(self)
			}

			fn read_next(&mut self) -> Option<u8> {
				$name::read_next(self)
			}

			fn read_finalize(&mut self) {
				$name::read_finalize(self)
			}

			fn read_bytes(&mut self, dst: &mut [u8]) -> bool {
				$name::read_bytes(self, dst)
			}

			fn read_consume(&mut self, n: usize) -> bool {
				$name::read_consume(self, n)
			}
		}
	};
}

impl_reader!(
	MultiReaderFifo,
	Deque<PktHandle, RXPKT>,
	"A shared-pool reader delivering packets in arrival order."
);
impl_reader!(
	MultiReaderPriority,
	BinaryHeap<PrioEntry, Min, RXPKT>,
	"A shared-pool reader delivering packets by `(priority, arrival)`."
);

#[cfg(test)]
mod tests {
	use super::*;
	use crate::poll::Scheduler;
	use crate::time::SoftClock;

	type Buf<'a> = MultiBuffer<'a, 32, 8, 4>;

	fn service(sched: &Scheduler<'_, 8>) {
		sched.service_all(8);
	}

	#[test]
	fn single_writer_single_reader() {
		let clock = SoftClock::usec();
		let buf = Buf::new(&clock);
		let sched = Scheduler::<'_, 8>::new();
		sched.register_demand(&buf).unwrap();
		let reader = MultiReaderFifo::<'_, 4>::new(&buf);
		buf.register_port(&reader).unwrap();
		let writer = MultiWriter::new(&buf);

		let payload: [u8; 200] = core::array::from_fn(|i| i as u8);
		writer.write_bytes(&payload);
		assert!(writer.write_finalize());
		service(&sched);

		assert_eq!(reader.bytes_ready(), 200);
		let mut out = [0u8; 200];
		assert!(reader.read_bytes(&mut out));
		assert_eq!(out, payload);
		reader.read_finalize();
		assert_eq!(reader.bytes_ready(), 0);
		assert_eq!(buf.free_chunks(), buf.total_chunks());
	}

	#[test]
	fn refcount_frees_after_last_reader() {
		let clock = SoftClock::usec();
		let buf = Buf::new(&clock);
		let sched = Scheduler::<'_, 8>::new();
		sched.register_demand(&buf).unwrap();
		let r1 = MultiReaderFifo::<'_, 4>::new(&buf);
		let r2 = MultiReaderFifo::<'_, 4>::new(&buf);
		buf.register_port(&r1).unwrap();
		buf.register_port(&r2).unwrap();
		let writer = MultiWriter::new(&buf);

		writer.write_bytes(&[1, 2, 3]);
		assert!(writer.write_finalize());
		service(&sched);

		assert_eq!(r1.bytes_ready(), 3);
		assert_eq!(r2.bytes_ready(), 3);
		r1.read_finalize();
		// One reader done: chunks still held by the other.
		assert!(buf.free_chunks() < buf.total_chunks());
		r2.read_finalize();
		assert_eq!(buf.free_chunks(), buf.total_chunks());
	}

	#[test]
	fn unaccepted_packet_freed_immediately() {
		let clock = SoftClock::usec();
		let buf = Buf::new(&clock);
		let sched = Scheduler::<'_, 8>::new();
		sched.register_demand(&buf).unwrap();
		let reader = MultiReaderFifo::<'_, 4>::new(&buf);
		reader.set_enabled(false);
		buf.register_port(&reader).unwrap();
		let writer = MultiWriter::new(&buf);

		writer.write_bytes(&[1; 100]);
		assert!(writer.write_finalize());
		service(&sched);
		assert_eq!(buf.free_chunks(), buf.total_chunks());
		assert_eq!(reader.bytes_ready(), 0);
	}

	#[test]
	fn priority_reader_orders_by_class_then_arrival() {
		let clock = SoftClock::usec();
		let buf = Buf::new(&clock);
		let sched = Scheduler::<'_, 8>::new();
		sched.register_demand(&buf).unwrap();
		let reader = MultiReaderPriority::<'_, 8>::new(&buf);
		buf.register_port(&reader).unwrap();
		let w1 = MultiWriter::new(&buf);
		let w2 = MultiWriter::new(&buf);

		// Two writers, priorities {5, 1, 5, 1}; tags mark arrival order.
		for (writer, prio, tag) in [(&w1, 5u8, 10u8), (&w2, 1, 11), (&w1, 5, 12), (&w2, 1, 13)] {
			writer.set_priority(prio);
			writer.write_bytes(&[tag]);
			assert!(writer.write_finalize());
		}
		service(&sched);

		let mut order = [0u8; 4];
		for slot in order.iter_mut() {
			*slot = reader.read_next().unwrap();
			reader.read_finalize();
		}
		assert_eq!(order, [11, 13, 10, 12]);
		assert_eq!(buf.free_chunks(), buf.total_chunks());
	}

	#[test]
	fn starvation_reports_overflow_and_recovers() {
		let clock = SoftClock::usec();
		let buf = MultiBuffer::<'_, 2, 2, 4>::new(&clock);
		let sched = Scheduler::<'_, 8>::new();
		sched.register_demand(&buf).unwrap();
		let reader = MultiReaderFifo::<'_, 2>::new(&buf);
		buf.register_port(&reader).unwrap();
		let writer = MultiWriter::new(&buf);

		// Two chunks hold 112 bytes; ask for more.
		writer.write_bytes(&[0xEE; 200]);
		assert_eq!(writer.space(), 0);
		assert!(!writer.write_finalize());
		assert_eq!(buf.free_chunks(), buf.total_chunks());

		writer.write_bytes(&[0x11; 50]);
		assert!(writer.write_finalize());
		service(&sched);
		assert_eq!(reader.bytes_ready(), 50);
	}

	#[test]
	fn writer_watchdog_reclaims_partial_packet() {
		let clock = SoftClock::usec();
		let buf = Buf::new(&clock);
		let sched = Scheduler::<'_, 8>::new();
		sched.register_demand(&buf).unwrap();
		let writer = MultiWriter::new(&buf);
		buf.register_port(&writer).unwrap();

		writer.write_bytes(&[1; 60]);
		assert!(buf.free_chunks() < buf.total_chunks());
		clock.advance_ms(u64::from(config::MBUF_WATCHDOG_MSEC) + 1);
		buf.demand().request_poll();
		service(&sched);
		assert_eq!(buf.free_chunks(), buf.total_chunks());
		// The writer can start over.
		writer.write_bytes(&[2; 10]);
		assert!(writer.write_finalize());
	}

	#[test]
	fn reader_watchdog_discards_stalled_queue() {
		let clock = SoftClock::usec();
		let buf = Buf::new(&clock);
		let sched = Scheduler::<'_, 8>::new();
		sched.register_demand(&buf).unwrap();
		let reader = MultiReaderFifo::<'_, 4>::new(&buf);
		buf.register_port(&reader).unwrap();
		let writer = MultiWriter::new(&buf);

		writer.write_bytes(&[1; 100]);
		assert!(writer.write_finalize());
		service(&sched);

		clock.advance_ms(u64::from(config::MBUF_WATCHDOG_MSEC) + 1);
		buf.demand().request_poll();
		service(&sched);
		assert_eq!(buf.free_chunks(), buf.total_chunks());
		assert_eq!(reader.bytes_ready(), 0);
	}

	#[test]
	fn meta_slots_travel_with_the_packet() {
		let clock = SoftClock::usec();
		let buf = Buf::new(&clock);
		let sched = Scheduler::<'_, 8>::new();
		sched.register_demand(&buf).unwrap();
		let reader = MultiReaderFifo::<'_, 4>::new(&buf);
		buf.register_port(&reader).unwrap();
		let writer = MultiWriter::new(&buf);

		writer.write_bytes(&[5; 10]);
		buf.pkt_set_meta(writer.pkt.get(), 0, 0xDEAD_BEEF);
		assert!(writer.write_finalize());
		service(&sched);
		assert_eq!(reader.bytes_ready(), 10);
		let handle = reader.state.borrow().cur.unwrap();
		assert_eq!(buf.pkt_meta(handle.idx, 0), 0xDEAD_BEEF);
		reader.read_finalize();
		assert_eq!(buf.free_chunks(), buf.total_chunks());
	}

	#[test]
	fn debug_sink_receives_copies() {
		let clock = SoftClock::usec();
		let buf = Buf::new(&clock);
		let sched = Scheduler::<'_, 8>::new();
		sched.register_demand(&buf).unwrap();
		let mut raw = [0u8; 256];
		let mut sink = crate::io::ArrayWrite::new(&mut raw);
		buf.set_debug(Some(&mut sink));
		let reader = MultiReaderFifo::<'_, 4>::new(&buf);
		buf.register_port(&reader).unwrap();
		let writer = MultiWriter::new(&buf);

		writer.write_bytes(&[9; 80]);
		assert!(writer.write_finalize());
		service(&sched);
		buf.set_debug(None);
		assert_eq!(sink.written(), &[9u8; 80][..]);
	}
}

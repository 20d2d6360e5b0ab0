//! Ethernet frame dispatch.

use core::cell::{Cell, RefCell};
use core::fmt;

use crate::io::{LimitedRead, Readable, Writeable};
use crate::poll;
use crate::port::PortIo;
use crate::util::TypeMap;
use crate::{Error, Result};

use super::{Address as _, Fill, Protocol, Type};

/// A 48-bit hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
	pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);
	/// The all-zero placeholder: "no address known".
	pub const NONE: MacAddr = MacAddr([0; 6]);

	pub fn is_broadcast(&self) -> bool {
		*self == Self::BROADCAST
	}

	pub fn is_multicast(&self) -> bool {
		self.0[0] & 0x01 != 0
	}

	/// A routable single-station address.
	pub fn is_unicast(&self) -> bool {
		!self.is_multicast() && *self != Self::NONE
	}

	pub fn read_from(src: &mut dyn Readable) -> Option<MacAddr> {
		let mut raw = [0u8; 6];
		src.read_bytes(&mut raw).then_some(MacAddr(raw))
	}

	pub fn write_to(&self, dst: &mut dyn Writeable) {
		dst.write_bytes(&self.0);
	}
}

impl fmt::Display for MacAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let m = &self.0;
		write!(
			f,
			"{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
			m[0], m[1], m[2], m[3], m[4], m[5]
		)
	}
}

/// EtherType field values used by the stack itself.
pub const ETYPE_IPV4: u16 = 0x0800;
pub const ETYPE_ARP: u16 = 0x0806;
/// 802.1Q tag protocol identifier.
pub const ETYPE_VLAN: u16 = 0x8100;

/// An 802.1Q tag: PCP (3 bits), DEI (1), VID (12). Zero means untagged.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct VlanTag(pub u16);

impl VlanTag {
	pub const NONE: VlanTag = VlanTag(0);

	pub const fn from_vid(vid: u16) -> Self {
		VlanTag(vid & 0x0FFF)
	}

	pub fn vid(&self) -> u16 {
		self.0 & 0x0FFF
	}

	pub fn pcp(&self) -> u8 {
		(self.0 >> 13) as u8
	}

	pub fn is_none(&self) -> bool {
		self.0 == 0
	}
}

/// Parsed Ethernet header, tag included.
#[derive(Clone, Copy, Debug)]
pub struct Header {
	pub dst: MacAddr,
	pub src: MacAddr,
	pub vtag: VlanTag,
	pub etype: u16,
}

impl Header {
	/// Bytes this header occupies on the wire.
	pub fn wire_len(&self) -> usize {
		if self.vtag.is_none() {
			14
		} else {
			18
		}
	}

	pub fn read_from(src: &mut dyn Readable) -> Option<Header> {
		let dst = MacAddr::read_from(src)?;
		let mac_src = MacAddr::read_from(src)?;
		let mut etype = src.read_u16()?;
		let mut vtag = VlanTag::NONE;
		if etype == ETYPE_VLAN {
			vtag = VlanTag(src.read_u16()?);
			etype = src.read_u16()?;
		}
		Some(Header {
			dst,
			src: mac_src,
			vtag,
			etype,
		})
	}

	pub fn write_to(&self, dst: &mut dyn Writeable) {
		self.dst.write_to(dst);
		self.src.write_to(dst);
		if !self.vtag.is_none() {
			dst.write_u16(ETYPE_VLAN);
			dst.write_u16(self.vtag.0);
		}
		dst.write_u16(self.etype);
	}
}

/// Source-address context of the frame being delivered, for replies.
#[derive(Clone, Copy)]
struct ReplyCtx {
	src: MacAddr,
	vtag: VlanTag,
}

/// The Ethernet layer: one hardware port, many protocol handlers.
///
/// Handlers register under an EtherType, optionally qualified by VLAN ID;
/// an unqualified registration matches any tag. Inbound frames not matching
/// the local unicast address, broadcast or multicast are dropped. The
/// dispatch is registered as an always-poll handler to drain the port.
pub struct Dispatch<'a, const NP: usize = 8> {
	port: &'a dyn PortIo,
	mac: Cell<MacAddr>,
	protocols: RefCell<TypeMap<'a, dyn Protocol + 'a, NP>>,
	reply: Cell<ReplyCtx>,
	rx_frames: Cell<u32>,
	rx_dropped: Cell<u32>,
}

impl<'a, const NP: usize> Dispatch<'a, NP> {
	pub fn new(port: &'a dyn PortIo, mac: MacAddr) -> Self {
		Dispatch {
			port,
			mac: Cell::new(mac),
			protocols: RefCell::new(TypeMap::new()),
			reply: Cell::new(ReplyCtx {
				src: MacAddr::NONE,
				vtag: VlanTag::NONE,
			}),
			rx_frames: Cell::new(0),
			rx_dropped: Cell::new(0),
		}
	}

	pub fn macaddr(&self) -> MacAddr {
		self.mac.get()
	}

	pub fn set_macaddr(&self, mac: MacAddr) {
		self.mac.set(mac);
	}

	/// Frames handed to a protocol handler so far.
	pub fn rx_frames(&self) -> u32 {
		self.rx_frames.get()
	}

	/// Frames discarded: malformed, foreign address, or no handler.
	pub fn rx_dropped(&self) -> u32 {
		self.rx_dropped.get()
	}

	/// Register a handler for `etype` on any VLAN.
	pub fn add_protocol(&self, etype: u16, proto: &'a dyn Protocol) -> Result<()> {
		self.add_key(Type::from_u16(etype), proto)
	}

	/// Register a handler for `etype` on one specific VLAN.
	pub fn add_protocol_vid(&self, vid: u16, etype: u16, proto: &'a dyn Protocol) -> Result<()> {
		self.add_key(Type::from_pair(vid, etype), proto)
	}

	fn add_key(&self, key: Type, proto: &'a dyn Protocol) -> Result<()> {
		let result = self.protocols.borrow_mut().add(key, proto);
		if result == Err(Error::AlreadyRegistered) {
			poll::misuse!("eth: duplicate protocol 0x{:08x}", key.value());
		}
		result
	}

	pub fn remove_protocol(&self, etype: u16) {
		self.remove_key(Type::from_u16(etype));
	}

	pub fn remove_protocol_vid(&self, vid: u16, etype: u16) {
		self.remove_key(Type::from_pair(vid, etype));
	}

	fn remove_key(&self, key: Type) {
		self.protocols.borrow_mut().remove(key);
	}

	fn find(&self, vid: u16, etype: u16) -> Option<&'a dyn Protocol> {
		let list = self.protocols.borrow();
		list.get(Type::from_pair(vid, etype))
			.or_else(|| list.get(Type::from_u16(etype)))
	}

	/// MAC and VLAN tag of the frame currently being delivered.
	pub fn reply_src(&self) -> (MacAddr, VlanTag) {
		let ctx = self.reply.get();
		(ctx.src, ctx.vtag)
	}

	/// Drain and deliver everything queued on the port.
	pub fn poll_rx(&self) {
		self.port.with_rx(&mut |rx| {
			while rx.bytes_ready() > 0 {
				self.deliver(rx);
				rx.read_finalize();
			}
		});
	}

	fn deliver(&self, rx: &mut dyn Readable) {
		let Some(hdr) = Header::read_from(rx) else {
			self.rx_dropped.set(self.rx_dropped.get() + 1);
			return;
		};
		let local = self.mac.get();
		if hdr.dst != local && !hdr.dst.is_broadcast() && !hdr.dst.is_multicast() {
			self.rx_dropped.set(self.rx_dropped.get() + 1);
			return;
		}
		self.reply.set(ReplyCtx {
			src: hdr.src,
			vtag: hdr.vtag,
		});
		match self.find(hdr.vtag.vid(), hdr.etype) {
			Some(proto) => {
				self.rx_frames.set(self.rx_frames.get() + 1);
				let limit = rx.bytes_ready();
				let mut payload = LimitedRead::new(rx, limit);
				proto.frame_rcvd(&mut payload);
				payload.read_finalize();
			}
			None => {
				trace!("eth: no handler for etype 0x{:04x}", hdr.etype);
				self.rx_dropped.set(self.rx_dropped.get() + 1);
			}
		}
	}

	/// Emit one frame. Returns `false` if the port queue has no room.
	pub fn open_write(
		&self,
		dst: MacAddr,
		vtag: VlanTag,
		etype: u16,
		len: usize,
		fill: Fill<'_>,
	) -> bool {
		let hdr = Header {
			dst,
			src: self.mac.get(),
			vtag,
			etype,
		};
		let mut ok = false;
		self.port.with_tx(&mut |tx| {
			if tx.space() < hdr.wire_len() + len {
				debug!("eth: tx full, dropping 0x{:04x} frame", etype);
				return;
			}
			hdr.write_to(tx);
			fill(tx);
			ok = tx.write_finalize();
		});
		ok
	}

	/// Emit a frame back to the sender of the one being delivered.
	pub fn open_reply(&self, etype: u16, len: usize, fill: Fill<'_>) -> bool {
		let ctx = self.reply.get();
		self.open_write(ctx.src, ctx.vtag, etype, len, fill)
	}
}

impl<const NP: usize> poll::Always for Dispatch<'_, NP> {
	fn poll_always(&self) {
		self.poll_rx();
	}
}

impl<const NP: usize> crate::io::EventListener for Dispatch<'_, NP> {
	fn data_rcvd(&self, src: &mut dyn Readable) {
		while src.bytes_ready() > 0 {
			self.deliver(src);
			src.read_finalize();
		}
	}
}

/// A fixed unicast Ethernet destination.
///
/// The raw-frame counterpart of the resolved IPv4 address objects: carries
/// `(MAC, VLAN, EtherType)` and emits through the dispatch.
pub struct EthAddress<'a, const NP: usize = 8> {
	iface: &'a Dispatch<'a, NP>,
	dst: Cell<MacAddr>,
	vtag: Cell<VlanTag>,
	etype: u16,
}

impl<'a, const NP: usize> EthAddress<'a, NP> {
	pub fn new(iface: &'a Dispatch<'a, NP>, etype: u16) -> Self {
		EthAddress {
			iface,
			dst: Cell::new(MacAddr::NONE),
			vtag: Cell::new(VlanTag::NONE),
			etype,
		}
	}

	pub fn connect(&self, dst: MacAddr, vtag: VlanTag) {
		self.dst.set(dst);
		self.vtag.set(vtag);
	}
}

impl<const NP: usize> super::Address for EthAddress<'_, NP> {
	fn ready(&self) -> bool {
		self.dst.get() != MacAddr::NONE
	}

	fn open_write(&self, len: usize, fill: Fill<'_>) -> bool {
		if !self.ready() {
			return false;
		}
		self.iface
			.open_write(self.dst.get(), self.vtag.get(), self.etype, len, fill)
	}

	fn close(&self) {
		self.dst.set(MacAddr::NONE);
	}
}

//! Address Resolution Protocol.
//!
//! The handler answers requests for the local address and feeds every
//! observed sender mapping to its listeners. The routing table is normally
//! the first listener (learning the mapping into its cache); resolved
//! address objects are the others.

use core::cell::{Cell, RefCell};
use core::net::Ipv4Addr;

use crate::io::{LimitedRead, Readable, Writeable};
use crate::poll;
use crate::util::Registry;
use crate::{Error, Result};

use super::eth::{self, MacAddr};
use super::ip::{read_ipv4, write_ipv4};
use super::Protocol;

const OPER_REQUEST: u16 = 1;
const OPER_REPLY: u16 = 2;
/// Wire size of an IPv4-over-Ethernet ARP message.
const ARP_LEN: usize = 28;

/// Notifications from ARP and ICMP resolution events.
pub trait ArpListener {
	/// `ip` has been observed to resolve to `mac`.
	fn arp_event(&self, ip: Ipv4Addr, mac: MacAddr);

	/// Traffic for `dst` should resolve against a different gateway.
	fn gateway_change(&self, _dst: Ipv4Addr, _gateway: Ipv4Addr) {}
}

/// The ARP handler, registered on the Ethernet dispatch at 0x0806.
pub struct Proto<'a, const NL: usize = 8> {
	eth: &'a eth::Dispatch<'a>,
	ipaddr: Cell<Ipv4Addr>,
	listeners: RefCell<Registry<'a, dyn ArpListener + 'a, NL>>,
}

impl<'a, const NL: usize> Proto<'a, NL> {
	pub fn new(eth: &'a eth::Dispatch<'a>, ipaddr: Ipv4Addr) -> Self {
		Proto {
			eth,
			ipaddr: Cell::new(ipaddr),
			listeners: RefCell::new(Registry::new()),
		}
	}

	pub fn ipaddr(&self) -> Ipv4Addr {
		self.ipaddr.get()
	}

	pub fn set_ipaddr(&self, ipaddr: Ipv4Addr) {
		self.ipaddr.set(ipaddr);
	}

	pub fn add_listener(&self, listener: &'a dyn ArpListener) -> Result<()> {
		let result = self.listeners.borrow_mut().add(listener);
		if result == Err(Error::AlreadyRegistered) {
			poll::misuse!("arp: duplicate listener");
		}
		result
	}

	pub fn remove_listener(&self, listener: &'a dyn ArpListener) {
		self.listeners.borrow_mut().remove(listener);
	}

	/// Broadcast a who-has query for `target`.
	pub fn send_query(&self, target: Ipv4Addr) -> bool {
		debug!("arp: query for {target}");
		self.send(
			OPER_REQUEST,
			MacAddr::BROADCAST,
			MacAddr::NONE,
			target,
			eth::VlanTag::NONE,
		)
	}

	/// Gratuitous announcement of the local address.
	pub fn send_announce(&self) -> bool {
		let local = self.ipaddr.get();
		self.send(
			OPER_REQUEST,
			MacAddr::BROADCAST,
			MacAddr::NONE,
			local,
			eth::VlanTag::NONE,
		)
	}

	/// Tell listeners that `dst` is now reached via `gateway` (from an
	/// ICMP redirect, typically).
	pub fn notify_gateway_change(&self, dst: Ipv4Addr, gateway: Ipv4Addr) {
		let listeners = self.listeners.borrow().snapshot();
		for listener in listeners.into_iter().flatten() {
			listener.gateway_change(dst, gateway);
		}
	}

	fn send(
		&self,
		oper: u16,
		dst: MacAddr,
		tha: MacAddr,
		tpa: Ipv4Addr,
		vtag: eth::VlanTag,
	) -> bool {
		let sha = self.eth.macaddr();
		let spa = self.ipaddr.get();
		self.eth
			.open_write(dst, vtag, eth::ETYPE_ARP, ARP_LEN, &mut |w| {
				w.write_u16(1); // Ethernet
				w.write_u16(eth::ETYPE_IPV4);
				w.write_u8(6);
				w.write_u8(4);
				w.write_u16(oper);
				sha.write_to(w);
				write_ipv4(w, spa);
				tha.write_to(w);
				write_ipv4(w, tpa);
			})
	}
}

impl<const NL: usize> Protocol for Proto<'_, NL> {
	fn frame_rcvd(&self, src: &mut LimitedRead<'_>) {
		let Some(msg) = parse(src) else {
			trace!("arp: malformed frame");
			return;
		};
		// Every sender mapping is a resolution event.
		if msg.sha.is_unicast() && !msg.spa.is_unspecified() {
			let listeners = self.listeners.borrow().snapshot();
			for listener in listeners.into_iter().flatten() {
				listener.arp_event(msg.spa, msg.sha);
			}
		}
		let local = self.ipaddr.get();
		if msg.oper == OPER_REQUEST && !local.is_unspecified() && msg.tpa == local {
			debug!("arp: answering {} for {}", msg.sha, msg.spa);
			let (_, vtag) = self.eth.reply_src();
			self.send(OPER_REPLY, msg.sha, msg.sha, msg.spa, vtag);
		}
	}
}

struct Message {
	oper: u16,
	sha: MacAddr,
	spa: Ipv4Addr,
	tpa: Ipv4Addr,
}

fn parse(src: &mut dyn Readable) -> Option<Message> {
	if src.read_u16()? != 1 || src.read_u16()? != eth::ETYPE_IPV4 {
		return None;
	}
	if src.read_u8()? != 6 || src.read_u8()? != 4 {
		return None;
	}
	let oper = src.read_u16()?;
	let sha = MacAddr::read_from(src)?;
	let spa = read_ipv4(src)?;
	let _tha = MacAddr::read_from(src)?;
	let tpa = read_ipv4(src)?;
	Some(Message {
		oper,
		sha,
		spa,
		tpa,
	})
}

//! IPv4 dispatch and resolved addresses.

use core::cell::{Cell, RefCell};
use core::net::Ipv4Addr;

use crate::config;
use crate::io::{LimitedRead, Readable, Writeable};
use crate::poll::{self, PollTimer, TimerClient};
use crate::util::TypeMap;
use crate::{Error, Result};

use super::checksum::{ones_checksum, OnesSum};
use super::eth::{self, MacAddr, VlanTag};
use super::{arp, icmp, route, Fill, Protocol, Type};

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Largest ICMP message the dispatch materialises for checksums.
const ICMP_SCRATCH: usize = 576;

pub fn read_ipv4(src: &mut dyn Readable) -> Option<Ipv4Addr> {
	let mut raw = [0u8; 4];
	src.read_bytes(&mut raw).then(|| Ipv4Addr::from(raw))
}

pub fn write_ipv4(dst: &mut dyn Writeable, addr: Ipv4Addr) {
	dst.write_bytes(&addr.octets());
}

/// A parsed IPv4 header. Options are validated and skipped on receive and
/// never emitted.
#[derive(Clone, Copy, Debug)]
pub struct Header {
	pub src: Ipv4Addr,
	pub dst: Ipv4Addr,
	pub proto: u8,
	pub ttl: u8,
	pub ident: u16,
	pub total_len: u16,
	/// Header length in 32-bit words.
	pub ihl: u8,
}

impl Header {
	pub fn payload_len(&self) -> usize {
		usize::from(self.total_len).saturating_sub(usize::from(self.ihl) * 4)
	}

	/// Parse and verify one header, consuming exactly `ihl * 4` bytes.
	pub fn read_from(src: &mut dyn Readable) -> Option<Header> {
		let mut raw = [0u8; 60];
		if !src.read_bytes(&mut raw[..20]) {
			return None;
		}
		let version = raw[0] >> 4;
		let ihl = raw[0] & 0x0F;
		if version != 4 || ihl < 5 {
			return None;
		}
		let hlen = usize::from(ihl) * 4;
		if hlen > 20 && !src.read_bytes(&mut raw[20..hlen]) {
			return None;
		}
		let mut sum = OnesSum::new();
		sum.add(&raw[..hlen]);
		if sum.fold() != 0xFFFF {
			return None;
		}
		let total_len = u16::from_be_bytes([raw[2], raw[3]]);
		if usize::from(total_len) < hlen {
			return None;
		}
		Some(Header {
			src: Ipv4Addr::new(raw[12], raw[13], raw[14], raw[15]),
			dst: Ipv4Addr::new(raw[16], raw[17], raw[18], raw[19]),
			proto: raw[9],
			ttl: raw[8],
			ident: u16::from_be_bytes([raw[4], raw[5]]),
			total_len,
			ihl,
		})
	}

	/// Emit a 20-byte header with a freshly computed checksum.
	pub fn write_to(&self, dst: &mut dyn Writeable) {
		let mut raw = [0u8; 20];
		raw[0] = 0x45;
		raw[2..4].copy_from_slice(&self.total_len.to_be_bytes());
		raw[4..6].copy_from_slice(&self.ident.to_be_bytes());
		raw[8] = self.ttl;
		raw[9] = self.proto;
		raw[12..16].copy_from_slice(&self.src.octets());
		raw[16..20].copy_from_slice(&self.dst.octets());
		let check = ones_checksum(&raw);
		raw[10..12].copy_from_slice(&check.to_be_bytes());
		dst.write_bytes(&raw);
	}
}

#[derive(Clone, Copy)]
struct ReplyCtx {
	src: Ipv4Addr,
	dst: Ipv4Addr,
	proto: u8,
}

/// The IPv4 layer, registered on the Ethernet dispatch at 0x0800.
///
/// Demultiplexes on the protocol byte; ICMP is handled internally (echo
/// replies, redirects, error logging), everything else goes to registered
/// handlers.
pub struct Dispatch<'a, const NP: usize = 8> {
	eth: &'a eth::Dispatch<'a>,
	arp: &'a arp::Proto<'a>,
	routes: &'a route::Table,
	addr: Cell<Ipv4Addr>,
	ident: Cell<u16>,
	protocols: RefCell<TypeMap<'a, dyn Protocol + 'a, NP>>,
	reply: Cell<ReplyCtx>,
	rx_dropped: Cell<u32>,
}

impl<'a, const NP: usize> Dispatch<'a, NP> {
	pub fn new(
		eth: &'a eth::Dispatch<'a>,
		arp: &'a arp::Proto<'a>,
		routes: &'a route::Table,
		addr: Ipv4Addr,
	) -> Self {
		arp.set_ipaddr(addr);
		Dispatch {
			eth,
			arp,
			routes,
			addr: Cell::new(addr),
			ident: Cell::new(1),
			protocols: RefCell::new(TypeMap::new()),
			reply: Cell::new(ReplyCtx {
				src: Ipv4Addr::UNSPECIFIED,
				dst: Ipv4Addr::UNSPECIFIED,
				proto: 0,
			}),
			rx_dropped: Cell::new(0),
		}
	}

	pub fn local_addr(&self) -> Ipv4Addr {
		self.addr.get()
	}

	pub fn set_addr(&self, addr: Ipv4Addr) {
		self.addr.set(addr);
		self.arp.set_ipaddr(addr);
	}

	pub fn routes(&self) -> &'a route::Table {
		self.routes
	}

	pub fn arp(&self) -> &'a arp::Proto<'a> {
		self.arp
	}

	pub fn rx_dropped(&self) -> u32 {
		self.rx_dropped.get()
	}

	pub fn add_protocol(&self, proto: u8, handler: &'a dyn Protocol) -> Result<()> {
		let result = self.protocols.borrow_mut().add(Type::from_u8(proto), handler);
		if result == Err(Error::AlreadyRegistered) {
			poll::misuse!("ip: duplicate protocol {}", proto);
		}
		result
	}

	pub fn remove_protocol(&self, proto: u8) {
		self.protocols.borrow_mut().remove(Type::from_u8(proto));
	}

	/// Source address of the datagram currently being delivered.
	pub fn reply_src(&self) -> Ipv4Addr {
		self.reply.get().src
	}

	/// Destination address of the datagram currently being delivered
	/// (ours, broadcast, or multicast).
	pub fn reply_dst(&self) -> Ipv4Addr {
		self.reply.get().dst
	}

	fn drop_frame(&self, why: &str) {
		trace!("ip: dropped frame ({why})");
		self.rx_dropped.set(self.rx_dropped.get() + 1);
	}

	/// Send one datagram, using only already-cached route MACs.
	///
	/// Destinations still waiting on ARP fail here; [`Address`] is the
	/// retrying front end for those.
	pub fn open_write(&self, dst: Ipv4Addr, proto: u8, len: usize, fill: Fill<'_>) -> bool {
		let route = self.routes.route_lookup(dst);
		if route.is_unreachable() {
			debug!("ip: no route to {dst}");
			return false;
		}
		let mac = route.dstmac;
		if mac == MacAddr::NONE {
			debug!("ip: no MAC for {dst} yet");
			return false;
		}
		self.emit(mac, VlanTag::NONE, dst, proto, len, fill)
	}

	/// Send one datagram back to the sender of the current one.
	pub fn open_reply(&self, len: usize, fill: Fill<'_>) -> bool {
		let ctx = self.reply.get();
		let (mac, vtag) = self.eth.reply_src();
		self.emit(mac, vtag, ctx.src, ctx.proto, len, fill)
	}

	fn emit(
		&self,
		mac: MacAddr,
		vtag: VlanTag,
		dst: Ipv4Addr,
		proto: u8,
		len: usize,
		fill: Fill<'_>,
	) -> bool {
		let ident = self.ident.get();
		self.ident.set(ident.wrapping_add(1));
		let hdr = Header {
			src: self.addr.get(),
			dst,
			proto,
			ttl: config::IP_TTL,
			ident,
			total_len: (20 + len) as u16,
			ihl: 5,
		};
		self.eth
			.open_write(mac, vtag, eth::ETYPE_IPV4, 20 + len, &mut |w| {
				hdr.write_to(w);
				fill(w);
			})
	}

	fn icmp_rcvd(&self, src: &mut dyn Readable) {
		let mut msg = [0u8; ICMP_SCRATCH];
		let len = src.bytes_ready().min(ICMP_SCRATCH);
		if !src.read_bytes(&mut msg[..len]) {
			self.drop_frame("icmp truncated");
			return;
		}
		match icmp::classify(&msg[..len]) {
			icmp::Action::Drop => self.drop_frame("icmp checksum"),
			icmp::Action::EchoReply => {
				debug!("ip: echo request from {}", self.reply_src());
				self.open_reply(len, &mut |w| icmp::write_echo_reply(w, &msg[..len]));
			}
			icmp::Action::Redirect { dst, gateway } => {
				info!("ip: redirect {dst} via {gateway}");
				self.arp.notify_gateway_change(dst, gateway);
			}
			icmp::Action::Unreachable => {
				warn!("ip: destination unreachable from {}", self.reply_src());
			}
			icmp::Action::TimeExceeded => {
				warn!("ip: time exceeded from {}", self.reply_src());
			}
			icmp::Action::Other => {}
		}
	}
}

impl<const NP: usize> Protocol for Dispatch<'_, NP> {
	fn frame_rcvd(&self, src: &mut LimitedRead<'_>) {
		let Some(hdr) = Header::read_from(src) else {
			self.drop_frame("bad header");
			return;
		};
		let local = self.addr.get();
		if hdr.dst != local && !hdr.dst.is_broadcast() && !hdr.dst.is_multicast() {
			self.drop_frame("foreign destination");
			return;
		}
		let payload = hdr.payload_len();
		if payload > src.bytes_ready() {
			self.drop_frame("truncated");
			return;
		}
		self.reply.set(ReplyCtx {
			src: hdr.src,
			dst: hdr.dst,
			proto: hdr.proto,
		});
		// Ethernet padding may trail the datagram; cap at the IP length.
		let mut body = LimitedRead::new(src, payload);
		if hdr.proto == PROTO_ICMP {
			self.icmp_rcvd(&mut body);
		} else {
			let handler = self.protocols.borrow().get(Type::from_u8(hdr.proto));
			match handler {
				Some(p) => p.frame_rcvd(&mut body),
				None => self.drop_frame("no handler"),
			}
		}
		body.read_finalize();
	}
}

#[derive(Clone, Copy)]
struct AddrState {
	dst: Ipv4Addr,
	gateway: Ipv4Addr,
	dstmac: MacAddr,
	vtag: VlanTag,
	port: u8,
	ready: bool,
	retries: u8,
}

/// A resolved IPv4 destination for one IP protocol.
///
/// `connect` resolves the route and, if the gateway MAC is unknown, starts
/// ARP with exponential backoff; register the address with the ARP handler
/// (listener) and a timekeeper (retry timer). Exhausted retries park the
/// address until the next `connect`.
pub struct Address<'a> {
	iface: &'a Dispatch<'a>,
	proto: u8,
	state: RefCell<AddrState>,
	timer: PollTimer,
}

impl<'a> Address<'a> {
	pub fn new(iface: &'a Dispatch<'a>, proto: u8) -> Self {
		Address {
			iface,
			proto,
			state: RefCell::new(AddrState {
				dst: Ipv4Addr::UNSPECIFIED,
				gateway: Ipv4Addr::UNSPECIFIED,
				dstmac: MacAddr::NONE,
				vtag: VlanTag::NONE,
				port: 0,
				ready: false,
				retries: 0,
			}),
			timer: PollTimer::new(),
		}
	}

	pub fn dstaddr(&self) -> Ipv4Addr {
		self.state.borrow().dst
	}

	pub fn dstmac(&self) -> MacAddr {
		self.state.borrow().dstmac
	}

	pub fn set_vlan(&self, vtag: VlanTag) {
		self.state.borrow_mut().vtag = vtag;
	}

	/// Resolve `dst` through the routing table, issuing ARP if needed.
	pub fn connect(&self, dst: Ipv4Addr) {
		let route = self.iface.routes().route_lookup(dst);
		let mut st = self.state.borrow_mut();
		st.dst = dst;
		st.gateway = route.gateway;
		st.port = route.port;
		st.retries = 0;
		if route.is_unreachable() {
			debug!("ip: {dst} unreachable");
			st.dstmac = MacAddr::NONE;
			st.ready = false;
			return;
		}
		if route.dstmac != MacAddr::NONE {
			st.dstmac = route.dstmac;
			st.ready = true;
			return;
		}
		st.dstmac = MacAddr::NONE;
		st.ready = false;
		let gateway = st.gateway;
		drop(st);
		self.iface.arp().send_query(gateway);
		self.timer.set_once(config::ARP_RETRY_MSEC);
	}

	/// Pin both address and MAC, skipping resolution.
	pub fn connect_mac(&self, dst: Ipv4Addr, mac: MacAddr) {
		let mut st = self.state.borrow_mut();
		st.dst = dst;
		st.gateway = dst;
		st.dstmac = mac;
		st.ready = true;
		st.retries = 0;
		self.timer.disarm();
	}
}

impl super::Address for Address<'_> {
	fn ready(&self) -> bool {
		self.state.borrow().ready
	}

	fn open_write(&self, len: usize, fill: Fill<'_>) -> bool {
		let st = *self.state.borrow();
		if !st.ready {
			return false;
		}
		self.iface.emit(st.dstmac, st.vtag, st.dst, self.proto, len, fill)
	}

	fn close(&self) {
		let mut st = self.state.borrow_mut();
		st.ready = false;
		st.dstmac = MacAddr::NONE;
		self.timer.disarm();
	}
}

impl arp::ArpListener for Address<'_> {
	fn arp_event(&self, ip: Ipv4Addr, mac: MacAddr) {
		let mut st = self.state.borrow_mut();
		if !st.ready && ip == st.gateway && !ip.is_unspecified() {
			debug!("ip: {} resolved to {mac}", st.dst);
			st.dstmac = mac;
			st.ready = true;
			self.timer.disarm();
		}
	}

	fn gateway_change(&self, dst: Ipv4Addr, gateway: Ipv4Addr) {
		{
			let mut st = self.state.borrow_mut();
			if st.dst != dst {
				return;
			}
			info!("ip: re-resolving {dst} via {gateway}");
			st.gateway = gateway;
			st.ready = false;
			st.retries = 0;
		}
		self.iface.arp().send_query(gateway);
		self.timer.set_once(config::ARP_RETRY_MSEC);
	}
}

impl TimerClient for Address<'_> {
	fn timer(&self) -> &PollTimer {
		&self.timer
	}

	fn timer_event(&self) {
		let gateway = {
			let mut st = self.state.borrow_mut();
			if st.ready {
				return;
			}
			st.retries += 1;
			if st.retries > config::ARP_RETRY_MAX {
				warn!("ip: ARP for {} gave up", st.gateway);
				return;
			}
			st.gateway
		};
		let retries = self.state.borrow().retries;
		self.iface.arp().send_query(gateway);
		let backoff = config::ARP_RETRY_MSEC << u32::from(retries.min(7));
		self.timer.set_once(backoff);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::net::Address as _;
	use crate::port::MutexPort;

	const OUR_MAC: MacAddr = MacAddr([2, 0, 0, 0, 0, 0xAA]);
	const OUR_IP: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
	const PEER_MAC: MacAddr = MacAddr([2, 0, 0, 0, 0, 5]);
	const PEER_IP: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 5);

	#[test]
	fn header_round_trip() {
		let mut raw = [0u8; 64];
		let mut w = crate::io::ArrayWrite::new(&mut raw);
		let hdr = Header {
			src: OUR_IP,
			dst: PEER_IP,
			proto: PROTO_UDP,
			ttl: 64,
			ident: 0x42,
			total_len: 48,
			ihl: 5,
		};
		hdr.write_to(&mut w);
		assert!(w.write_finalize());
		assert_eq!(w.written_len(), 20);
		// The emitted header checksums to zero.
		assert_eq!(ones_checksum(w.written()), 0);

		let mut r = crate::io::ArrayRead::new(w.written());
		let parsed = Header::read_from(&mut r).unwrap();
		assert_eq!(parsed.src, OUR_IP);
		assert_eq!(parsed.dst, PEER_IP);
		assert_eq!(parsed.proto, PROTO_UDP);
		assert_eq!(parsed.payload_len(), 28);
	}

	#[test]
	fn corrupt_header_rejected() {
		let mut raw = [0u8; 64];
		let mut w = crate::io::ArrayWrite::new(&mut raw);
		Header {
			src: OUR_IP,
			dst: PEER_IP,
			proto: PROTO_UDP,
			ttl: 64,
			ident: 1,
			total_len: 20,
			ihl: 5,
		}
		.write_to(&mut w);
		assert!(w.write_finalize());
		let mut bad = [0u8; 20];
		bad.copy_from_slice(w.written());
		bad[8] ^= 1;
		let mut r = crate::io::ArrayRead::new(&bad);
		assert!(Header::read_from(&mut r).is_none());
	}

	fn inject_ip(port: &MutexPort<'_, 512, 512, 4>, proto: u8, payload: &[u8]) {
		let mut rx = port.rx();
		eth::Header {
			dst: OUR_MAC,
			src: PEER_MAC,
			vtag: VlanTag::NONE,
			etype: eth::ETYPE_IPV4,
		}
		.write_to(&mut *rx);
		Header {
			src: PEER_IP,
			dst: OUR_IP,
			proto,
			ttl: 64,
			ident: 9,
			total_len: (20 + payload.len()) as u16,
			ihl: 5,
		}
		.write_to(&mut *rx);
		rx.write_bytes(payload);
		assert!(rx.write_finalize());
	}

	#[test]
	fn demux_by_protocol_byte() {
		let port: MutexPort<'_, 512, 512, 4> = MutexPort::new();
		let eth_dispatch = eth::Dispatch::new(&port, OUR_MAC);
		let arp = arp::Proto::new(&eth_dispatch, OUR_IP);
		let routes = route::Table::new();
		let ip = Dispatch::<'_, 8>::new(&eth_dispatch, &arp, &routes, OUR_IP);
		eth_dispatch.add_protocol(eth::ETYPE_IPV4, &ip).unwrap();

		struct Recorder(RefCell<std::vec::Vec<u8>>);
		impl Protocol for Recorder {
			fn frame_rcvd(&self, src: &mut LimitedRead<'_>) {
				let mut got = self.0.borrow_mut();
				while let Some(b) = src.read_next() {
					got.push(b);
				}
			}
		}
		let udp = Recorder(RefCell::new(std::vec::Vec::new()));
		ip.add_protocol(PROTO_UDP, &udp).unwrap();

		inject_ip(&port, PROTO_UDP, &[1, 2, 3]);
		inject_ip(&port, 99, &[9]); // no handler
		eth_dispatch.poll_rx();
		assert_eq!(&*udp.0.borrow(), &[1, 2, 3]);
		assert_eq!(ip.rx_dropped(), 1);
	}

	#[test]
	fn echo_request_answered() {
		let port: MutexPort<'_, 512, 512, 4> = MutexPort::new();
		let eth_dispatch = eth::Dispatch::new(&port, OUR_MAC);
		let arp = arp::Proto::new(&eth_dispatch, OUR_IP);
		let routes = route::Table::new();
		let ip = Dispatch::<'_, 8>::new(&eth_dispatch, &arp, &routes, OUR_IP);
		eth_dispatch.add_protocol(eth::ETYPE_IPV4, &ip).unwrap();

		let mut ping = [0u8; 64];
		let mut w = crate::io::ArrayWrite::new(&mut ping);
		icmp::write_echo_request(&mut w, 0xBEEF, 3, &[0x55; 16]);
		assert!(w.write_finalize());
		inject_ip(&port, PROTO_ICMP, w.written());
		eth_dispatch.poll_rx();

		let mut tx = port.tx();
		let ehdr = eth::Header::read_from(&mut *tx).unwrap();
		assert_eq!(ehdr.dst, PEER_MAC);
		let ihdr = Header::read_from(&mut *tx).unwrap();
		assert_eq!(ihdr.dst, PEER_IP);
		assert_eq!(ihdr.src, OUR_IP);
		assert_eq!(ihdr.proto, PROTO_ICMP);
		assert_eq!(ihdr.ttl, config::IP_TTL);
		let mut reply = [0u8; 24];
		assert!(Readable::read_bytes(&mut *tx, &mut reply));
		assert_eq!(reply[0], icmp::TYPE_ECHO_REPLY);
		assert_eq!(ones_checksum(&reply), 0);
		assert_eq!(&reply[4..6], &0xBEEFu16.to_be_bytes());
	}

	#[test]
	fn address_resolves_via_arp_reply() {
		let port: MutexPort<'_, 512, 512, 4> = MutexPort::new();
		let eth_dispatch = eth::Dispatch::new(&port, OUR_MAC);
		let arp_proto = arp::Proto::new(&eth_dispatch, OUR_IP);
		let routes = route::Table::new();
		routes
			.route_static(route::Route::local(
				route::Subnet::new(Ipv4Addr::new(192, 0, 2, 0), 24),
				0,
			))
			.unwrap();
		let ip = Dispatch::<'_, 8>::new(&eth_dispatch, &arp_proto, &routes, OUR_IP);
		eth_dispatch.add_protocol(eth::ETYPE_IPV4, &ip).unwrap();
		eth_dispatch.add_protocol(eth::ETYPE_ARP, &arp_proto).unwrap();

		let dst = Address::new(&ip, PROTO_UDP);
		arp_proto.add_listener(&dst).unwrap();

		dst.connect(PEER_IP);
		assert!(!dst.ready());
		// The connect sent a query; answer it.
		{
			let mut tx = port.tx();
			let hdr = eth::Header::read_from(&mut *tx).unwrap();
			assert_eq!(hdr.etype, eth::ETYPE_ARP);
			let n = Readable::bytes_ready(&*tx);
			Readable::read_consume(&mut *tx, n);
			Readable::read_finalize(&mut *tx);
		}
		{
			let mut rx = port.rx();
			eth::Header {
				dst: OUR_MAC,
				src: PEER_MAC,
				vtag: VlanTag::NONE,
				etype: eth::ETYPE_ARP,
			}
			.write_to(&mut *rx);
			rx.write_u16(1);
			rx.write_u16(eth::ETYPE_IPV4);
			rx.write_u8(6);
			rx.write_u8(4);
			rx.write_u16(2); // reply
			PEER_MAC.write_to(&mut *rx);
			write_ipv4(&mut *rx, PEER_IP);
			OUR_MAC.write_to(&mut *rx);
			write_ipv4(&mut *rx, OUR_IP);
			assert!(rx.write_finalize());
		}
		eth_dispatch.poll_rx();
		assert!(dst.ready());
		assert_eq!(dst.dstmac(), PEER_MAC);

		// open_write now lands on the resolved MAC.
		assert!(dst.open_write(4, &mut |w| w.write_u32(0xAABBCCDD)));
		let mut tx = port.tx();
		let hdr = eth::Header::read_from(&mut *tx).unwrap();
		assert_eq!(hdr.dst, PEER_MAC);
		assert_eq!(hdr.etype, eth::ETYPE_IPV4);
	}
}

//! UDP dispatch, addresses and sockets.
//!
//! Socket keys pack `(remote port, local port)`: a bound socket registers
//! with remote zero and matches any sender, a connected socket matches one
//! peer exactly and wins over the bound entry. Checksums cover the IPv4
//! pseudo-header; datagrams are staged in a scratch buffer so the sum is
//! known before the header goes out (zero means unchecked, per RFC 768).

use core::cell::{Cell, RefCell};
use core::net::Ipv4Addr;

use crate::buf::PacketBuffer;
use crate::config;
use crate::io::{ArrayRead, ArrayWrite, LimitedRead, Readable, Writeable};
use crate::poll;
use crate::util::TypeMap;
use crate::{Error, Result};

use super::checksum::{pseudo_header_sum, OnesSum};
use super::{ip, Address as _, Fill, Protocol, Type};

/// Staging area for one datagram's checksum pass.
const SCRATCH: usize = config::MAX_FRAME;

fn pseudo_sum(src: Ipv4Addr, dst: Ipv4Addr, udp_len: u16) -> OnesSum {
	pseudo_header_sum(src, dst, ip::PROTO_UDP, udp_len)
}

/// The UDP layer, registered on the IPv4 dispatch at protocol 17.
pub struct Dispatch<'a, const NS: usize = 8> {
	ip: &'a ip::Dispatch<'a>,
	sockets: RefCell<TypeMap<'a, dyn Protocol + 'a, NS>>,
	next_port: Cell<u16>,
	/// `(remote port, local port)` of the datagram being delivered.
	reply: Cell<(u16, u16)>,
	tx_scratch: RefCell<[u8; SCRATCH]>,
	rx_scratch: RefCell<[u8; SCRATCH]>,
	rx_dropped: Cell<u32>,
}

impl<'a, const NS: usize> Dispatch<'a, NS> {
	pub fn new(ip: &'a ip::Dispatch<'a>) -> Self {
		Dispatch {
			ip,
			sockets: RefCell::new(TypeMap::new()),
			next_port: Cell::new(config::UDP_PORT_EPHEMERAL),
			reply: Cell::new((0, 0)),
			tx_scratch: RefCell::new([0; SCRATCH]),
			rx_scratch: RefCell::new([0; SCRATCH]),
			rx_dropped: Cell::new(0),
		}
	}

	pub fn ip(&self) -> &'a ip::Dispatch<'a> {
		self.ip
	}

	pub fn rx_dropped(&self) -> u32 {
		self.rx_dropped.get()
	}

	/// Claim an unused ephemeral source port.
	pub fn alloc_port(&self) -> u16 {
		loop {
			let port = self.next_port.get();
			let next = if port >= u16::MAX {
				config::UDP_PORT_EPHEMERAL
			} else {
				port + 1
			};
			self.next_port.set(next);
			let key_taken = self
				.sockets
				.borrow()
				.iter()
				.any(|(t, _)| (t.value() & 0xFFFF) == u32::from(port));
			if !key_taken {
				return port;
			}
		}
	}

	/// Register a handler for every datagram to `local_port`.
	pub fn bind(&self, local_port: u16, handler: &'a dyn Protocol) -> Result<()> {
		self.add_key(Type::from_u16(local_port), handler)
	}

	/// Register a handler for one `(remote, local)` port pair.
	pub fn connect(&self, remote_port: u16, local_port: u16, handler: &'a dyn Protocol) -> Result<()> {
		self.add_key(Type::from_pair(remote_port, local_port), handler)
	}

	fn add_key(&self, key: Type, handler: &'a dyn Protocol) -> Result<()> {
		let result = self.sockets.borrow_mut().add(key, handler);
		if result == Err(Error::AlreadyRegistered) {
			poll::misuse!("udp: duplicate socket 0x{:08x}", key.value());
		}
		result
	}

	pub fn unbind(&self, local_port: u16) {
		self.remove_key(Type::from_u16(local_port));
	}

	pub fn disconnect(&self, remote_port: u16, local_port: u16) {
		self.remove_key(Type::from_pair(remote_port, local_port));
	}

	fn remove_key(&self, key: Type) {
		self.sockets.borrow_mut().remove(key);
	}

	/// Ports of the datagram currently being delivered:
	/// `(remote, local)`.
	pub fn reply_ports(&self) -> (u16, u16) {
		self.reply.get()
	}

	fn find(&self, remote: u16, local: u16) -> Option<&'a dyn Protocol> {
		let list = self.sockets.borrow();
		list.get(Type::from_pair(remote, local))
			.or_else(|| list.get(Type::from_u16(local)))
	}

	fn drop_frame(&self, why: &str) {
		trace!("udp: dropped datagram ({why})");
		self.rx_dropped.set(self.rx_dropped.get() + 1);
	}

	/// Send one datagram back to the sender of the current one.
	pub fn open_reply(&self, len: usize, fill: Fill<'_>) -> bool {
		let (remote, local) = self.reply.get();
		let dst = self.ip.reply_src();
		let mut scratch = self.tx_scratch.borrow_mut();
		let Some(total) = stage(&mut scratch, self.ip.local_addr(), dst, local, remote, len, fill)
		else {
			debug!("udp: staged datagram over budget");
			return false;
		};
		let bytes = &scratch[..total];
		self.ip.open_reply(total, &mut |w| w.write_bytes(bytes))
	}
}

/// Assemble header plus payload in `scratch`, checksum included; the sum
/// has to be known before the header can go out. Returns the total length.
fn stage(
	scratch: &mut [u8; SCRATCH],
	src_ip: Ipv4Addr,
	dst_ip: Ipv4Addr,
	sport: u16,
	dport: u16,
	len: usize,
	fill: Fill<'_>,
) -> Option<usize> {
	if 8 + len > SCRATCH {
		return None;
	}
	let mut staged = ArrayWrite::new(&mut scratch[8..]);
	fill(&mut staged);
	if !staged.write_finalize() || staged.written_len() != len {
		return None;
	}
	let udp_len = (8 + len) as u16;
	let mut sum = pseudo_sum(src_ip, dst_ip, udp_len);
	sum.add_word(sport);
	sum.add_word(dport);
	sum.add_word(udp_len);
	sum.add(&scratch[8..8 + len]);
	let check = match sum.checksum() {
		0 => 0xFFFF, // zero is reserved for "no checksum"
		c => c,
	};
	scratch[0..2].copy_from_slice(&sport.to_be_bytes());
	scratch[2..4].copy_from_slice(&dport.to_be_bytes());
	scratch[4..6].copy_from_slice(&udp_len.to_be_bytes());
	scratch[6..8].copy_from_slice(&check.to_be_bytes());
	Some(8 + len)
}

impl<const NS: usize> Protocol for Dispatch<'_, NS> {
	fn frame_rcvd(&self, src: &mut LimitedRead<'_>) {
		let (Some(sport), Some(dport), Some(udp_len), Some(check)) = (
			src.read_u16(),
			src.read_u16(),
			src.read_u16(),
			src.read_u16(),
		) else {
			self.drop_frame("short header");
			return;
		};
		let Some(payload_len) = usize::from(udp_len).checked_sub(8) else {
			self.drop_frame("bad length");
			return;
		};
		if payload_len > src.bytes_ready() || payload_len > SCRATCH {
			self.drop_frame("truncated");
			return;
		}
		let mut scratch = self.rx_scratch.borrow_mut();
		if !src.read_bytes(&mut scratch[..payload_len]) {
			self.drop_frame("truncated");
			return;
		}
		if check != 0 {
			let mut sum = pseudo_sum(self.ip.reply_src(), self.ip.reply_dst(), udp_len);
			sum.add_word(sport);
			sum.add_word(dport);
			sum.add_word(udp_len);
			sum.add_word(check);
			sum.add(&scratch[..payload_len]);
			if sum.fold() != 0xFFFF {
				self.drop_frame("checksum");
				return;
			}
		}
		self.reply.set((sport, dport));
		match self.find(sport, dport) {
			Some(handler) => {
				let mut payload = ArrayRead::new(&scratch[..payload_len]);
				let mut limited = LimitedRead::new(&mut payload, payload_len);
				handler.frame_rcvd(&mut limited);
			}
			None => self.drop_frame("no socket"),
		}
	}
}

/// A resolved UDP destination: an IPv4 address plus a port pair.
pub struct Address<'a> {
	udp: &'a Dispatch<'a>,
	resolver: ip::Address<'a>,
	dport: Cell<u16>,
	sport: Cell<u16>,
}

impl<'a> Address<'a> {
	pub fn new(udp: &'a Dispatch<'a>) -> Self {
		Address {
			udp,
			resolver: ip::Address::new(udp.ip(), ip::PROTO_UDP),
			dport: Cell::new(0),
			sport: Cell::new(0),
		}
	}

	/// The underlying resolver, for ARP-listener and timer registration.
	pub fn resolver(&self) -> &ip::Address<'a> {
		&self.resolver
	}

	pub fn ports(&self) -> (u16, u16) {
		(self.sport.get(), self.dport.get())
	}

	/// Resolve `dst`; a zero `sport` auto-allocates an ephemeral port.
	pub fn connect(&self, dst: Ipv4Addr, dport: u16, sport: u16) {
		let sport = if sport == 0 {
			self.udp.alloc_port()
		} else {
			sport
		};
		self.sport.set(sport);
		self.dport.set(dport);
		self.resolver.connect(dst);
	}
}

impl super::Address for Address<'_> {
	fn ready(&self) -> bool {
		self.resolver.ready()
	}

	fn open_write(&self, len: usize, fill: Fill<'_>) -> bool {
		if !self.resolver.ready() {
			return false;
		}
		let dst = self.resolver.dstaddr();
		let udp = self.udp;
		let mut scratch = udp.tx_scratch.borrow_mut();
		let Some(total) = stage(
			&mut scratch,
			udp.ip.local_addr(),
			dst,
			self.sport.get(),
			self.dport.get(),
			len,
			fill,
		) else {
			debug!("udp: staged datagram over budget");
			return false;
		};
		let bytes = &scratch[..total];
		self.resolver.open_write(total, &mut |w| w.write_bytes(bytes))
	}

	fn close(&self) {
		self.resolver.close();
	}
}

/// A datagram endpoint: a bound local port with a receive queue.
///
/// Inbound payloads land in a packet-mode buffer, one record per datagram,
/// with the sender recorded for replies. The socket registers itself as a
/// protocol handler; reads go through `&self` (the `&Socket` stream
/// impls), matching how the dispatch holds it.
pub struct Socket<'a, const RXCAP: usize = 2048, const RXPKT: usize = 8> {
	udp: &'a Dispatch<'a>,
	rx: RefCell<PacketBuffer<'static, RXCAP, RXPKT>>,
	local_port: Cell<u16>,
	last_from: Cell<(Ipv4Addr, u16)>,
}

impl<'a, const RXCAP: usize, const RXPKT: usize> Socket<'a, RXCAP, RXPKT> {
	pub fn new(udp: &'a Dispatch<'a>) -> Self {
		Socket {
			udp,
			rx: RefCell::new(PacketBuffer::new()),
			local_port: Cell::new(0),
			last_from: Cell::new((Ipv4Addr::UNSPECIFIED, 0)),
		}
	}

	/// Attach to `local_port`; the caller registers us with the dispatch:
	/// `udp.bind(port, &socket)`.
	pub fn set_port(&self, local_port: u16) {
		self.local_port.set(local_port);
	}

	pub fn local_port(&self) -> u16 {
		self.local_port.get()
	}

	/// Sender of the most recently queued datagram.
	pub fn last_from(&self) -> (Ipv4Addr, u16) {
		self.last_from.get()
	}

	/// Reply to the datagram currently being delivered.
	pub fn send_reply(&self, data: &[u8]) -> bool {
		self.udp.open_reply(data.len(), &mut |w| w.write_bytes(data))
	}

	pub fn bytes_ready(&self) -> usize {
		self.rx.borrow().bytes_ready()
	}

	pub fn read_bytes(&self, dst: &mut [u8]) -> bool {
		self.rx.borrow_mut().read_bytes(dst)
	}

	pub fn read_next(&self) -> Option<u8> {
		self.rx.borrow_mut().read_next()
	}

	pub fn read_consume(&self, n: usize) -> bool {
		self.rx.borrow_mut().read_consume(n)
	}

	pub fn read_finalize(&self) {
		self.rx.borrow_mut().read_finalize();
	}
}

impl<const RXCAP: usize, const RXPKT: usize> Protocol for Socket<'_, RXCAP, RXPKT> {
	fn frame_rcvd(&self, src: &mut LimitedRead<'_>) {
		let (remote, _) = self.udp.reply_ports();
		self.last_from.set((self.udp.ip().reply_src(), remote));
		let mut rx = self.rx.borrow_mut();
		while src.copy_to(&mut *rx) > 0 {}
		if src.bytes_ready() > 0 {
			// Did not fit; drop the whole datagram.
			rx.write_abort();
			debug!("udp: socket {} rx full", self.local_port.get());
		} else {
			rx.write_finalize();
		}
	}
}

macro_rules! forward_socket_readable {
	($target:ty) => {
		impl<const RXCAP: usize, const RXPKT: usize> Readable for $target {
			fn bytes_ready(&self) -> usize {
				Socket::bytes_ready(self)
			}

			fn read_next(&mut self) -> Option<u8> {
				Socket::read_next(self)
			}

			fn read_finalize(&mut self) {
				Socket::read_finalize(self)
			}

			fn read_bytes(&mut self, dst: &mut [u8]) -> bool {
				Socket::read_bytes(self, dst)
			}

			fn read_consume(&mut self, n: usize) -> bool {
				Socket::read_consume(self, n)
			}
		}
	};
}

forward_socket_readable!(Socket<'_, RXCAP, RXPKT>);
forward_socket_readable!(&Socket<'_, RXCAP, RXPKT>);

#[cfg(test)]
mod tests {
	use super::*;
	use crate::net::{arp, eth, route};
	use crate::port::MutexPort;

	const OUR_MAC: eth::MacAddr = eth::MacAddr([2, 0, 0, 0, 0, 0xAA]);
	const OUR_IP: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
	const PEER_MAC: eth::MacAddr = eth::MacAddr([2, 0, 0, 0, 0, 5]);
	const PEER_IP: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 5);

	struct Fixture<'f> {
		port: &'f MutexPort<'f, 1024, 1024, 8>,
		eth: eth::Dispatch<'f>,
	}

	fn inject_udp(
		port: &MutexPort<'_, 1024, 1024, 8>,
		sport: u16,
		dport: u16,
		payload: &[u8],
		corrupt: bool,
	) {
		// Checksum over the pseudo-header, header and payload.
		let udp_len = (8 + payload.len()) as u16;
		let mut sum = pseudo_sum(PEER_IP, OUR_IP, udp_len);
		sum.add_word(sport);
		sum.add_word(dport);
		sum.add_word(udp_len);
		sum.add(payload);
		let mut check = match sum.checksum() {
			0 => 0xFFFF,
			c => c,
		};
		if corrupt {
			check ^= 0x0101;
		}

		let mut rx = port.rx();
		eth::Header {
			dst: OUR_MAC,
			src: PEER_MAC,
			vtag: eth::VlanTag::NONE,
			etype: eth::ETYPE_IPV4,
		}
		.write_to(&mut *rx);
		ip::Header {
			src: PEER_IP,
			dst: OUR_IP,
			proto: ip::PROTO_UDP,
			ttl: 64,
			ident: 77,
			total_len: 20 + 8 + payload.len() as u16,
			ihl: 5,
		}
		.write_to(&mut *rx);
		rx.write_u16(sport);
		rx.write_u16(dport);
		rx.write_u16(udp_len);
		rx.write_u16(check);
		rx.write_bytes(payload);
		assert!(rx.write_finalize());
	}

	#[test]
	fn bound_socket_receives_and_records_sender() {
		let port: MutexPort<'_, 1024, 1024, 8> = MutexPort::new();
		let fix = Fixture {
			port: &port,
			eth: eth::Dispatch::new(&port, OUR_MAC),
		};
		let arp = arp::Proto::new(&fix.eth, OUR_IP);
		let routes = route::Table::new();
		let ip_dispatch = ip::Dispatch::<'_, 8>::new(&fix.eth, &arp, &routes, OUR_IP);
		fix.eth.add_protocol(eth::ETYPE_IPV4, &ip_dispatch).unwrap();
		let udp = Dispatch::<'_, 8>::new(&ip_dispatch);
		ip_dispatch.add_protocol(ip::PROTO_UDP, &udp).unwrap();
		let sock = Socket::<'_, 512, 4>::new(&udp);
		sock.set_port(7);
		udp.bind(7, &sock).unwrap();

		inject_udp(fix.port, 40000, 7, b"hello", false);
		fix.eth.poll_rx();
		assert_eq!(sock.bytes_ready(), 5);
		let mut got = [0u8; 5];
		assert!(sock.read_bytes(&mut got));
		assert_eq!(&got, b"hello");
		assert_eq!(sock.last_from(), (PEER_IP, 40000));
		sock.read_finalize();
	}

	#[test]
	fn checksum_failure_drops() {
		let port: MutexPort<'_, 1024, 1024, 8> = MutexPort::new();
		let eth_dispatch = eth::Dispatch::new(&port, OUR_MAC);
		let arp = arp::Proto::new(&eth_dispatch, OUR_IP);
		let routes = route::Table::new();
		let ip_dispatch = ip::Dispatch::<'_, 8>::new(&eth_dispatch, &arp, &routes, OUR_IP);
		eth_dispatch.add_protocol(eth::ETYPE_IPV4, &ip_dispatch).unwrap();
		let udp = Dispatch::<'_, 8>::new(&ip_dispatch);
		ip_dispatch.add_protocol(ip::PROTO_UDP, &udp).unwrap();
		let sock = Socket::<'_, 512, 4>::new(&udp);
		sock.set_port(7);
		udp.bind(7, &sock).unwrap();

		inject_udp(&port, 40000, 7, b"junk!", true);
		eth_dispatch.poll_rx();
		assert_eq!(sock.bytes_ready(), 0);
		assert_eq!(udp.rx_dropped(), 1);
	}

	#[test]
	fn connected_socket_beats_bound() {
		let port: MutexPort<'_, 1024, 1024, 8> = MutexPort::new();
		let eth_dispatch = eth::Dispatch::new(&port, OUR_MAC);
		let arp = arp::Proto::new(&eth_dispatch, OUR_IP);
		let routes = route::Table::new();
		let ip_dispatch = ip::Dispatch::<'_, 8>::new(&eth_dispatch, &arp, &routes, OUR_IP);
		eth_dispatch.add_protocol(eth::ETYPE_IPV4, &ip_dispatch).unwrap();
		let udp = Dispatch::<'_, 8>::new(&ip_dispatch);
		ip_dispatch.add_protocol(ip::PROTO_UDP, &udp).unwrap();
		let bound = Socket::<'_, 512, 4>::new(&udp);
		let connected = Socket::<'_, 512, 4>::new(&udp);
		bound.set_port(9);
		connected.set_port(9);
		udp.bind(9, &bound).unwrap();
		udp.connect(40000, 9, &connected).unwrap();

		inject_udp(&port, 40000, 9, &[1], false);
		inject_udp(&port, 41000, 9, &[2], false);
		eth_dispatch.poll_rx();
		assert_eq!(connected.read_next(), Some(1));
		assert_eq!(bound.read_next(), Some(2));
	}

	#[test]
	fn ephemeral_ports_skip_taken_keys() {
		let port: MutexPort<'_, 1024, 1024, 8> = MutexPort::new();
		let eth_dispatch = eth::Dispatch::new(&port, OUR_MAC);
		let arp = arp::Proto::new(&eth_dispatch, OUR_IP);
		let routes = route::Table::new();
		let ip_dispatch = ip::Dispatch::<'_, 8>::new(&eth_dispatch, &arp, &routes, OUR_IP);
		let udp = Dispatch::<'_, 8>::new(&ip_dispatch);
		let sock = Socket::<'_, 64, 2>::new(&udp);
		udp.bind(config::UDP_PORT_EPHEMERAL, &sock).unwrap();

		let first = udp.alloc_port();
		let second = udp.alloc_port();
		assert_ne!(first, config::UDP_PORT_EPHEMERAL);
		assert_ne!(first, second);
	}
}

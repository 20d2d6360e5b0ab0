//! IPv4 routing table with ephemeral cache rows.
//!
//! A fixed array of rows doubles as static routing table and ARP cache:
//! static rows are written from the front, learned host routes from the
//! back, and lookup is a longest-prefix scan over all of it. Special
//! gateway values mark the two degenerate cases: the all-ones broadcast
//! address means "on-link, send directly", the unspecified address means
//! "unreachable".

use core::cell::RefCell;
use core::net::Ipv4Addr;

use bitflags::bitflags;

use super::eth::MacAddr;
use crate::{Error, Result};

bitflags! {
	#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
	pub struct RouteFlags: u8 {
		/// MAC set by the operator; never overwritten by ARP learning.
		const MAC_FIXED = 0x01;
	}
}

/// An IPv4 prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subnet {
	pub addr: Ipv4Addr,
	pub mask: u32,
}

impl Subnet {
	pub const fn new(addr: Ipv4Addr, prefix: u8) -> Self {
		let mask = if prefix == 0 {
			0
		} else if prefix >= 32 {
			u32::MAX
		} else {
			u32::MAX << (32 - prefix)
		};
		Subnet { addr, mask }
	}

	/// The /32 prefix holding exactly `addr`.
	pub const fn host(addr: Ipv4Addr) -> Self {
		Subnet {
			addr,
			mask: u32::MAX,
		}
	}

	pub fn contains(&self, ip: Ipv4Addr) -> bool {
		(ip.to_bits() & self.mask) == (self.addr.to_bits() & self.mask)
	}

	/// Same prefix: equal masks and equal masked address.
	pub fn same_prefix(&self, other: &Subnet) -> bool {
		self.mask == other.mask
			&& (self.addr.to_bits() & self.mask) == (other.addr.to_bits() & other.mask)
	}
}

/// One row: prefix, next hop, cached MAC, egress port, flags.
#[derive(Clone, Copy, Debug)]
pub struct Route {
	pub subnet: Subnet,
	pub gateway: Ipv4Addr,
	pub dstmac: MacAddr,
	pub port: u8,
	pub flags: RouteFlags,
}

impl Route {
	/// An on-link prefix: traffic goes directly to the destination.
	pub fn local(subnet: Subnet, port: u8) -> Self {
		Route {
			subnet,
			gateway: Ipv4Addr::BROADCAST,
			dstmac: MacAddr::NONE,
			port,
			flags: RouteFlags::empty(),
		}
	}

	/// The "no route" sentinel.
	pub fn unreachable() -> Self {
		Route {
			subnet: Subnet::new(Ipv4Addr::UNSPECIFIED, 0),
			gateway: Ipv4Addr::UNSPECIFIED,
			dstmac: MacAddr::NONE,
			port: 0,
			flags: RouteFlags::empty(),
		}
	}

	pub fn is_local(&self) -> bool {
		self.gateway == Ipv4Addr::BROADCAST
	}

	pub fn is_unreachable(&self) -> bool {
		self.gateway.is_unspecified()
	}
}

struct Inner<const N: usize> {
	default: Route,
	rows: [Option<Route>; N],
	/// Rows `[0, static_count)` are operator-installed.
	static_count: usize,
	/// Next learned-row slot; grows from the back with wraparound.
	eph_next: usize,
}

/// The routing table. `N` rows plus a default route.
pub struct Table<const N: usize = 8> {
	inner: RefCell<Inner<N>>,
}

impl<const N: usize> Table<N> {
	pub fn new() -> Self {
		Table {
			inner: RefCell::new(Inner {
				default: Route::unreachable(),
				rows: [None; N],
				static_count: 0,
				eph_next: N.saturating_sub(1),
			}),
		}
	}

	/// Install the default route.
	pub fn route_default(&self, gateway: Ipv4Addr, dstmac: MacAddr, port: u8, flags: RouteFlags) {
		let mut inner = self.inner.borrow_mut();
		inner.default = Route {
			subnet: Subnet::new(Ipv4Addr::UNSPECIFIED, 0),
			gateway,
			dstmac,
			port,
			flags,
		};
	}

	/// Install or replace a static route.
	///
	/// A row with the same prefix is replaced in place (even a learned
	/// one); otherwise the route lands on the next static slot, evicting a
	/// learned row if one occupied it. Fails only when every slot is
	/// static already.
	pub fn route_static(&self, route: Route) -> Result<()> {
		let mut inner = self.inner.borrow_mut();
		for row in inner.rows.iter_mut().flatten() {
			if row.subnet.same_prefix(&route.subnet) {
				*row = route;
				return Ok(());
			}
		}
		let slot = inner.static_count;
		if slot >= N {
			warn!("route: table full");
			return Err(Error::TableFull);
		}
		inner.rows[slot] = Some(route);
		inner.static_count += 1;
		Ok(())
	}

	/// Longest-prefix lookup; never fails, the default route backstops.
	///
	/// Multicast and broadcast destinations short-circuit to a direct
	/// pseudo-route, the unspecified destination to unreachable. On-link
	/// results come back with the gateway rewritten to the destination, so
	/// the caller always resolves the returned gateway.
	pub fn route_lookup(&self, dst: Ipv4Addr) -> Route {
		if dst.is_multicast() || dst.is_broadcast() {
			return Route {
				subnet: Subnet::host(dst),
				gateway: dst,
				dstmac: MacAddr::BROADCAST,
				port: 0,
				flags: RouteFlags::empty(),
			};
		}
		if dst.is_unspecified() {
			return Route::unreachable();
		}
		let inner = self.inner.borrow();
		let mut best = inner.default;
		let mut best_mask: Option<u32> = None;
		for row in inner.rows.iter().flatten() {
			if row.subnet.contains(dst) && best_mask.map_or(true, |m| row.subnet.mask > m) {
				best = *row;
				best_mask = Some(row.subnet.mask);
			}
		}
		if best.is_local() {
			best.gateway = dst;
		}
		best
	}

	/// Learn `gateway -> mac`, typically from an ARP reply.
	///
	/// Every row already pointing at that gateway is updated unless the
	/// operator pinned its MAC. If no updated row's prefix covers the
	/// gateway itself, a host route is added on the learned side of the
	/// table, inheriting port and flags from the best route for the
	/// gateway; the oldest learned row is evicted when that side is full.
	pub fn route_cache(&self, gateway: Ipv4Addr, mac: MacAddr) {
		if !mac.is_unicast()
			|| gateway.is_unspecified()
			|| gateway.is_broadcast()
			|| gateway.is_multicast()
		{
			return;
		}
		let mut covered = false;
		{
			let mut inner = self.inner.borrow_mut();
			if inner.default.gateway == gateway {
				if !inner.default.flags.contains(RouteFlags::MAC_FIXED) {
					inner.default.dstmac = mac;
				}
				covered = true;
			}
			for row in inner.rows.iter_mut().flatten() {
				if row.gateway == gateway {
					if !row.flags.contains(RouteFlags::MAC_FIXED) {
						row.dstmac = mac;
					}
					covered |= row.subnet.contains(gateway);
				}
			}
		}
		if covered {
			return;
		}
		// Inherit port and flags from the covering route.
		let parent = self.route_lookup(gateway);
		let mut inner = self.inner.borrow_mut();
		let mut slot = inner.eph_next;
		if slot < inner.static_count || slot >= N {
			slot = N - 1; // wrap, evicting the oldest learned row
		}
		if slot < inner.static_count {
			return; // every slot is static: nowhere to learn
		}
		trace!("route: caching {gateway} in slot {slot}");
		inner.rows[slot] = Some(Route {
			subnet: Subnet::host(gateway),
			gateway,
			dstmac: mac,
			port: parent.port,
			flags: parent.flags - RouteFlags::MAC_FIXED,
		});
		inner.eph_next = slot.wrapping_sub(1);
	}

	/// Drop every learned row; static rows survive but forget their MACs
	/// unless pinned.
	pub fn route_flush(&self) {
		let mut inner = self.inner.borrow_mut();
		let static_count = inner.static_count;
		for row in inner.rows.iter_mut().skip(static_count) {
			*row = None;
		}
		for row in inner.rows.iter_mut().flatten() {
			if !row.flags.contains(RouteFlags::MAC_FIXED) {
				row.dstmac = MacAddr::NONE;
			}
		}
		if !inner.default.flags.contains(RouteFlags::MAC_FIXED) {
			inner.default.dstmac = MacAddr::NONE;
		}
		inner.eph_next = N.saturating_sub(1);
	}

	/// Occupied rows, static plus learned.
	pub fn route_count(&self) -> usize {
		self.inner.borrow().rows.iter().flatten().count()
	}
}

impl<const N: usize> Default for Table<N> {
	fn default() -> Self {
		Self::new()
	}
}

impl<const N: usize> super::arp::ArpListener for Table<N> {
	fn arp_event(&self, ip: Ipv4Addr, mac: MacAddr) {
		self.route_cache(ip, mac);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const R1: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
	const R2: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 1);
	const R3: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

	fn via(gateway: Ipv4Addr, subnet: Subnet) -> Route {
		Route {
			subnet,
			gateway,
			dstmac: MacAddr::NONE,
			port: 0,
			flags: RouteFlags::empty(),
		}
	}

	fn three_route_table() -> Table<8> {
		let table = Table::new();
		table.route_default(R3, MacAddr::NONE, 0, RouteFlags::empty());
		table
			.route_static(via(R1, Subnet::new(Ipv4Addr::new(10, 0, 0, 0), 8)))
			.unwrap();
		table
			.route_static(via(R2, Subnet::new(Ipv4Addr::new(10, 1, 0, 0), 16)))
			.unwrap();
		table
	}

	#[test]
	fn longest_prefix_wins() {
		let table = three_route_table();
		assert_eq!(table.route_lookup(Ipv4Addr::new(10, 1, 2, 3)).gateway, R2);
		assert_eq!(table.route_lookup(Ipv4Addr::new(10, 2, 0, 1)).gateway, R1);
		assert_eq!(table.route_lookup(Ipv4Addr::new(8, 8, 8, 8)).gateway, R3);
	}

	#[test]
	fn local_route_rewrites_gateway() {
		let table = Table::<8>::new();
		table
			.route_static(Route::local(
				Subnet::new(Ipv4Addr::new(192, 0, 2, 0), 24),
				2,
			))
			.unwrap();
		let dst = Ipv4Addr::new(192, 0, 2, 55);
		let route = table.route_lookup(dst);
		assert_eq!(route.gateway, dst);
		assert_eq!(route.port, 2);
	}

	#[test]
	fn specials_short_circuit() {
		let table = three_route_table();
		let bcast = table.route_lookup(Ipv4Addr::BROADCAST);
		assert_eq!(bcast.dstmac, MacAddr::BROADCAST);
		assert_eq!(bcast.gateway, Ipv4Addr::BROADCAST);
		let mcast = table.route_lookup(Ipv4Addr::new(224, 0, 0, 5));
		assert_eq!(mcast.dstmac, MacAddr::BROADCAST);
		assert!(table.route_lookup(Ipv4Addr::UNSPECIFIED).is_unreachable());
	}

	#[test]
	fn static_replace_and_full() {
		let table = Table::<2>::new();
		let net = Subnet::new(Ipv4Addr::new(10, 0, 0, 0), 8);
		table.route_static(via(R1, net)).unwrap();
		table.route_static(via(R2, net)).unwrap(); // replace, not append
		assert_eq!(table.route_count(), 1);
		assert_eq!(table.route_lookup(Ipv4Addr::new(10, 9, 9, 9)).gateway, R2);

		table
			.route_static(via(R3, Subnet::new(Ipv4Addr::new(172, 16, 0, 0), 12)))
			.unwrap();
		assert_eq!(
			table.route_static(via(R3, Subnet::new(Ipv4Addr::new(192, 168, 0, 0), 16))),
			Err(Error::TableFull)
		);
	}

	#[test]
	fn cache_learns_host_routes() {
		let table = Table::<4>::new();
		table
			.route_static(Route::local(
				Subnet::new(Ipv4Addr::new(192, 0, 2, 0), 24),
				3,
			))
			.unwrap();
		let peer = Ipv4Addr::new(192, 0, 2, 5);
		let mac = MacAddr([2, 0, 0, 0, 0, 5]);
		table.route_cache(peer, mac);
		let route = table.route_lookup(peer);
		assert_eq!(route.dstmac, mac);
		// Inherited from the covering local route.
		assert_eq!(route.port, 3);
		assert_eq!(table.route_count(), 2);
	}

	#[test]
	fn cache_updates_matching_gateway_rows() {
		let table = three_route_table();
		let mac = MacAddr([2, 0, 0, 0, 0, 0x11]);
		// R2 appears as a gateway; the row's own subnet (10.1/16) covers
		// R2 itself, so no host route is added.
		table.route_cache(R2, mac);
		assert_eq!(table.route_count(), 2);
		assert_eq!(table.route_lookup(Ipv4Addr::new(10, 1, 2, 3)).dstmac, mac);
	}

	#[test]
	fn cache_respects_fixed_mac() {
		let table = Table::<4>::new();
		let pinned = MacAddr([2, 0, 0, 0, 0, 0x99]);
		table
			.route_static(Route {
				subnet: Subnet::new(Ipv4Addr::new(10, 0, 0, 0), 8),
				gateway: R1,
				dstmac: pinned,
				port: 0,
				flags: RouteFlags::MAC_FIXED,
			})
			.unwrap();
		table.route_cache(R1, MacAddr([2, 0, 0, 0, 0, 0x01]));
		assert_eq!(table.route_lookup(Ipv4Addr::new(10, 5, 5, 5)).dstmac, pinned);
	}

	#[test]
	fn cache_eviction_wraps() {
		let table = Table::<3>::new();
		table
			.route_static(Route::local(
				Subnet::new(Ipv4Addr::new(10, 0, 0, 0), 8),
				0,
			))
			.unwrap();
		// Two learned slots; the third learn evicts the oldest.
		for host in 1..=3u8 {
			table.route_cache(
				Ipv4Addr::new(10, 0, 0, host),
				MacAddr([2, 0, 0, 0, 0, host]),
			);
		}
		assert_eq!(table.route_count(), 3);
		// Host 1 was evicted: its lookup falls back to the local route.
		let r = table.route_lookup(Ipv4Addr::new(10, 0, 0, 1));
		assert_eq!(r.dstmac, MacAddr::NONE);
		// Hosts 2 and 3 are still cached.
		let r = table.route_lookup(Ipv4Addr::new(10, 0, 0, 3));
		assert_eq!(r.dstmac, MacAddr([2, 0, 0, 0, 0, 3]));
	}

	#[test]
	fn flush_preserves_static_rows() {
		let table = Table::<4>::new();
		let pinned = MacAddr([2, 0, 0, 0, 0, 0x42]);
		table
			.route_static(Route {
				subnet: Subnet::new(Ipv4Addr::new(10, 0, 0, 0), 8),
				gateway: R1,
				dstmac: pinned,
				port: 0,
				flags: RouteFlags::MAC_FIXED,
			})
			.unwrap();
		table
			.route_static(via(R2, Subnet::new(Ipv4Addr::new(10, 1, 0, 0), 16)))
			.unwrap();
		table.route_cache(Ipv4Addr::new(10, 1, 0, 1), MacAddr([2, 0, 0, 0, 0, 1]));
		table.route_cache(Ipv4Addr::new(10, 0, 0, 9), MacAddr([2, 0, 0, 0, 0, 9]));
		assert!(table.route_count() > 2);

		table.route_flush();
		assert_eq!(table.route_count(), 2);
		// Pinned MAC survives; the learned one on the static row is gone.
		assert_eq!(table.route_lookup(Ipv4Addr::new(10, 5, 0, 1)).dstmac, pinned);
		assert_eq!(
			table.route_lookup(Ipv4Addr::new(10, 1, 2, 3)).dstmac,
			MacAddr::NONE
		);
	}
}

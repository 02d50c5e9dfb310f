//! The IP router: longest-prefix-match dispatch of IPv4/IPv6 packets to
//! peer ports.

use core::fmt;
use core::net::IpAddr;
use std::rc::Rc;

use log::trace;
use slab::Slab;
use stakker::{fwd, ret, Fwd, Ret, CX};
use utils::error::Result;

use crate::ip;
use crate::port::PortIndex;

/// An IP network address: a base address and a prefix length.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Prefix {
	addr: IpAddr,
	len: u8,
}

impl Prefix {
	/// Rejects prefix lengths beyond the address family's width.
	pub fn new(addr: IpAddr, len: u8) -> Option<Self> {
		let max = match addr {
			IpAddr::V4(_) => 32,
			IpAddr::V6(_) => 128,
		};

		(len <= max).then_some(Self { addr, len })
	}

	pub fn len(&self) -> u8 {
		self.len
	}

	pub fn contains(&self, ip: IpAddr) -> bool {
		match (self.addr, ip) {
			(IpAddr::V4(net), IpAddr::V4(ip)) => {
				if self.len == 0 {
					return true;
				}

				let shift = 32 - u32::from(self.len);
				u32::from(net) >> shift == u32::from(ip) >> shift
			}
			(IpAddr::V6(net), IpAddr::V6(ip)) => {
				if self.len == 0 {
					return true;
				}

				let shift = 128 - u32::from(self.len);
				u128::from(net) >> shift == u128::from(ip) >> shift
			}
			_ => false,
		}
	}
}

impl fmt::Display for Prefix {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}/{}", self.addr, self.len)
	}
}

struct RouterPort {
	write: Fwd<(Rc<[u8]>, Ret<Result>)>,
	routes: Vec<Prefix>,
}

/// Routes are gathered from every registered port's advertised prefixes into
/// a cache ordered most-specific-first. Any registration change invalidates
/// the cache; it is rebuilt on the next lookup.
pub struct Router {
	ports: Slab<RouterPort>,
	cache: Option<Vec<(Prefix, PortIndex)>>,
	dropped: u64,
}

impl Router {
	pub fn init(_cx: CX![]) -> Option<Self> {
		Some(Self {
			ports: Slab::new(),
			cache: None,
			dropped: 0,
		})
	}

	/// Register a port advertising the given routes.
	pub fn register_port(&mut self, _cx: CX![], write: Fwd<(Rc<[u8]>, Ret<Result>)>, routes: Vec<Prefix>, ret: Ret<PortIndex>) {
		let index = PortIndex(self.ports.insert(RouterPort { write, routes }) as u32);

		self.cache = None;
		ret!([ret], index);
	}

	pub fn unregister_port(&mut self, _cx: CX![], index: PortIndex) {
		if self.ports.try_remove(index.0 as usize).is_none() {
			trace!("Unregistering unknown router port {index:?}");
		}

		self.cache = None;
	}

	/// Route one packet from `from`. The completion reports the downstream
	/// write result, or an error when the packet is unroutable.
	pub fn receive(&mut self, _cx: CX![], from: PortIndex, packet: Rc<[u8]>, ret: Ret<Result>) {
		let Ok(destination) = ip::destination(&packet) else {
			self.dropped += 1;
			ret!([ret], Err(()));
			return;
		};

		let Some(target) = self.lookup(destination) else {
			self.dropped += 1;
			trace!("No route to {destination}, dropping packet");
			ret!([ret], Err(()));
			return;
		};

		if target == from {
			// The best route points back at the ingress; never bounce.
			self.dropped += 1;
			ret!([ret], Err(()));
			return;
		}

		let Some(port) = self.ports.get(target.0 as usize) else {
			self.dropped += 1;
			ret!([ret], Err(()));
			return;
		};

		trace!("Routing {} byte(s) for {destination} to port {target:?}", packet.len());
		fwd!([port.write], (packet, ret));
	}

	/// The number of packets dropped for want of a route.
	pub fn dropped(&self) -> u64 {
		self.dropped
	}

	fn lookup(&mut self, destination: IpAddr) -> Option<PortIndex> {
		let cache = self.cache.get_or_insert_with(|| {
			let mut routes: Vec<(Prefix, PortIndex)> = self
				.ports
				.iter()
				.flat_map(|(index, port)| port.routes.iter().map(move |route| (*route, PortIndex(index as u32))))
				.collect();

			// Most specific first.
			routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
			routes
		});

		cache.iter().find(|(route, _)| route.contains(destination)).map(|(_, port)| *port)
	}
}

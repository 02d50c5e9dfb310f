//! The learning ethernet switch.
//!
//! Ports are registered per peer; each ingress frame updates the learning
//! table from its source address and is then forwarded to the single learned
//! destination port, or flooded to every other port when the destination is
//! multicast, unknown, stale, or the switch is configured as a hub.

use core::hash::BuildHasherDefault;
use std::rc::Rc;
use std::time::Instant;

use ahash::AHasher;
use log::trace;
use rand::Rng;
use slab::Slab;
use stakker::{fwd, Ret, CX};
use utils::error::Result;

use crate::ethernet::{self, EthernetAddress};
use crate::port::{Gatherer, Group, Port, PortIndex};

type Map<K, V> = hashbrown::HashMap<K, V, BuildHasherDefault<AHasher>>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RoutingMethod {
	/// Flood every frame.
	Hub,
	/// Learn source addresses and forward to the learned port.
	Switch,
}

pub struct SwitchConfig {
	pub routing_method: RoutingMethod,
	/// When enabled, frames are relayed between ports of the same group.
	pub relay_mode: bool,
	/// Learning table capacity. Exceeding it evicts a random entry, so an
	/// attacker cycling source addresses cannot deterministically flush a
	/// chosen victim.
	pub max_entries: usize,
}

impl Default for SwitchConfig {
	fn default() -> Self {
		Self {
			routing_method: RoutingMethod::Switch,
			relay_mode: false,
			max_entries: 1024,
		}
	}
}

struct Entry {
	port: PortIndex,
	last_seen: Instant,
}

pub struct Switch {
	config: SwitchConfig,
	ports: Slab<Port>,
	table: Map<EthernetAddress, Entry>,
}

impl Switch {
	pub fn init(_cx: CX![], config: SwitchConfig) -> Option<Self> {
		Some(Self {
			config,
			ports: Slab::new(),
			table: Map::default(),
		})
	}

	pub fn register_port(&mut self, _cx: CX![], port: Port, ret: Ret<PortIndex>) {
		let index = PortIndex(self.ports.insert(port) as u32);
		stakker::ret!([ret], index);
	}

	pub fn unregister_port(&mut self, _cx: CX![], index: PortIndex) {
		if self.ports.try_remove(index.0 as usize).is_none() {
			trace!("Unregistering unknown switch port {index:?}");
		}
	}

	/// Forward one ingress frame, gathering the per-port write results into
	/// a single completion.
	pub fn receive(&mut self, cx: CX![], from: PortIndex, frame: Rc<[u8]>, ret: Ret<Vec<(PortIndex, Result)>>) {
		let targets = self.targets_for(from, &frame, cx.now());

		trace!("Switching {} byte(s) of data from {from:?} to {} port(s)", frame.len(), targets.len());

		let gatherer = Gatherer::new(ret, targets.len());

		for target in targets {
			// The ingress port never receives its own frame back.
			debug_assert_ne!(target, from);

			if let Some(port) = self.ports.get(target.0 as usize) {
				fwd!([port.write], (frame.clone(), gatherer.slot(target)));
			}
		}
	}

	fn targets_for(&mut self, from: PortIndex, frame: &[u8], now: Instant) -> Vec<PortIndex> {
		if !self.ports.contains(from.0 as usize) {
			return Vec::new();
		}

		if self.config.routing_method == RoutingMethod::Hub {
			return self.flood_targets(from);
		}

		let Ok(header) = ethernet::parse(frame) else {
			return Vec::new();
		};

		if header.destination.is_multicast() {
			return self.flood_targets(from);
		}

		self.learn(header.source, from, now);

		let Some(entry) = self.table.get(&header.destination) else {
			return self.flood_targets(from);
		};

		let target = entry.port;

		if !self.ports.contains(target.0 as usize) {
			// The learned port is gone; forget it and fall back to
			// flooding.
			self.table.remove(&header.destination);
			return self.flood_targets(from);
		}

		if target == from {
			// The destination is behind the ingress port already.
			return Vec::new();
		}

		vec![target]
	}

	fn learn(&mut self, source: EthernetAddress, port: PortIndex, now: Instant) {
		self.table.insert(source, Entry { port, last_seen: now });

		while self.table.len() > self.config.max_entries {
			let victim = rand::thread_rng().gen_range(0..self.table.len());

			if let Some((address, entry)) = self.table.iter().nth(victim).map(|(address, entry)| (*address, entry.last_seen)) {
				trace!("Learning table is full, evicting {address} (last seen {:?} ago)", now.duration_since(entry));
				self.table.remove(&address);
			}
		}
	}

	fn flood_targets(&self, from: PortIndex) -> Vec<PortIndex> {
		let Some(ingress) = self.ports.get(from.0 as usize) else {
			return Vec::new();
		};

		self.ports
			.iter()
			.filter(|(index, port)| {
				*index != from.0 as usize && (self.config.relay_mode || port.group != ingress.group)
			})
			.map(|(index, _)| PortIndex(index as u32))
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use stakker::{fwd_nop, Stakker};

	use super::*;

	fn frame(destination: [u8; 6], source: [u8; 6]) -> Vec<u8> {
		let mut out = vec![0; 60];
		out[..6].copy_from_slice(&destination);
		out[6..12].copy_from_slice(&source);
		out
	}

	fn switch(config: SwitchConfig) -> (Stakker, Switch) {
		let stakker = Stakker::new(Instant::now());

		let switch = Switch {
			config,
			ports: Slab::new(),
			table: Map::default(),
		};

		(stakker, switch)
	}

	fn add_port(switch: &mut Switch, group: Group) -> PortIndex {
		PortIndex(switch.ports.insert(Port { write: fwd_nop!(), group }) as u32)
	}

	const A: [u8; 6] = [2, 0, 0, 0, 0, 0xa];
	const B: [u8; 6] = [2, 0, 0, 0, 0, 0xb];
	const BROADCAST: [u8; 6] = [0xff; 6];

	#[test]
	fn unknown_destinations_flood_except_ingress() {
		let (_s, mut switch) = switch(SwitchConfig::default());
		let now = Instant::now();

		let p0 = add_port(&mut switch, 0);
		let p1 = add_port(&mut switch, 1);
		let p2 = add_port(&mut switch, 2);

		let mut targets = switch.targets_for(p0, &frame(B, A), now);
		targets.sort_by_key(|t| t.0);

		assert_eq!(targets, vec![p1, p2]);
	}

	#[test]
	fn learned_destinations_are_unicast() {
		let (_s, mut switch) = switch(SwitchConfig::default());
		let now = Instant::now();

		let p0 = add_port(&mut switch, 0);
		let p1 = add_port(&mut switch, 1);
		let _p2 = add_port(&mut switch, 2);

		// A talks first, so the switch learns where A lives.
		switch.targets_for(p0, &frame(BROADCAST, A), now);

		assert_eq!(switch.targets_for(p1, &frame(A, B), now), vec![p0]);
	}

	#[test]
	fn stale_ports_fall_back_to_flooding() {
		let (_s, mut switch) = switch(SwitchConfig::default());
		let now = Instant::now();

		let p0 = add_port(&mut switch, 0);
		let p1 = add_port(&mut switch, 1);
		let p2 = add_port(&mut switch, 2);

		switch.targets_for(p0, &frame(BROADCAST, A), now);
		switch.unregister_port_for_test(p0);

		let mut targets = switch.targets_for(p1, &frame(A, B), now);
		targets.sort_by_key(|t| t.0);

		assert_eq!(targets, vec![p2]);
		// The stale entry was dropped.
		assert!(!switch.table.contains_key(&EthernetAddress(A)));
	}

	#[test]
	fn hub_mode_always_floods() {
		let config = SwitchConfig { routing_method: RoutingMethod::Hub, ..SwitchConfig::default() };
		let (_s, mut switch) = switch(config);
		let now = Instant::now();

		let p0 = add_port(&mut switch, 0);
		let p1 = add_port(&mut switch, 1);

		switch.targets_for(p0, &frame(BROADCAST, A), now);
		assert_eq!(switch.targets_for(p0, &frame(A, B), now), vec![p1]);
	}

	#[test]
	fn same_group_is_skipped_unless_relaying() {
		let (_s, mut switch) = switch(SwitchConfig::default());
		let now = Instant::now();

		let p0 = add_port(&mut switch, 7);
		let p1 = add_port(&mut switch, 7);
		let p2 = add_port(&mut switch, 8);

		assert_eq!(switch.targets_for(p0, &frame(B, A), now), vec![p2]);

		switch.config.relay_mode = true;

		let mut targets = switch.targets_for(p0, &frame(B, A), now);
		targets.sort_by_key(|t| t.0);
		assert_eq!(targets, vec![p1, p2]);
	}

	#[test]
	fn learning_table_is_bounded() {
		let config = SwitchConfig { max_entries: 16, ..SwitchConfig::default() };
		let (_s, mut switch) = switch(config);
		let now = Instant::now();

		let p0 = add_port(&mut switch, 0);
		let _p1 = add_port(&mut switch, 1);

		for n in 0..100u16 {
			let [hi, lo] = n.to_be_bytes();
			switch.targets_for(p0, &frame(B, [2, 0, 0, 0, hi, lo]), now);
		}

		assert_eq!(switch.table.len(), 16);
	}

	impl Switch {
		fn unregister_port_for_test(&mut self, index: PortIndex) {
			self.ports.try_remove(index.0 as usize);
		}
	}
}

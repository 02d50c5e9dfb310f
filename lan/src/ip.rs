//! Just enough IP header parsing for route lookups.

use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bilge::prelude::*;
use log::warn;
use utils::error::*;

#[bitsize(8)]
#[derive(FromBits)]
struct Meta {
	ihl: u4,
	ver: u4,
}

/// Extract the destination address of an IPv4 or IPv6 packet.
pub fn destination(packet: &[u8]) -> Result<IpAddr> {
	let first = *packet.first().ok_or_else(|| warn!("Empty IP packet"))?;

	match Meta::from(first).ver().value() {
		4 => {
			let bytes: [u8; 4] = packet
				.get(16..20)
				.and_then(|b| b.try_into().ok())
				.ok_or_else(|| warn!("IPv4 packet of {} byte(s) is too short", packet.len()))?;

			Ok(IpAddr::V4(Ipv4Addr::from(bytes)))
		}
		6 => {
			let bytes: [u8; 16] = packet
				.get(24..40)
				.and_then(|b| b.try_into().ok())
				.ok_or_else(|| warn!("IPv6 packet of {} byte(s) is too short", packet.len()))?;

			Ok(IpAddr::V6(Ipv6Addr::from(bytes)))
		}
		version => {
			warn!("Packet has unknown IP version {version}");
			Err(())
		}
	}
}

//! Ethernet frame header parsing.

use core::fmt;

use log::warn;
use utils::bytes::Reader;
use utils::error::*;

/// The fixed ethernet header length.
pub const HEADER_SIZE: usize = 14;

/// A 48-bit hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EthernetAddress(pub [u8; 6]);

impl EthernetAddress {
	/// The group bit: set on multicast and broadcast destinations.
	pub fn is_multicast(&self) -> bool {
		self.0[0] & 0x01 != 0
	}
}

impl fmt::Display for EthernetAddress {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let [a, b, c, d, e, g] = self.0;
		write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
	}
}

impl fmt::Debug for EthernetAddress {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

pub struct Header {
	pub destination: EthernetAddress,
	pub source: EthernetAddress,
	pub ethertype: u16,
}

pub fn parse(frame: &[u8]) -> Result<Header> {
	let mut r = Reader::new(frame);
	let short = |_| warn!("Frame of {} byte(s) is too short for an ethernet header", frame.len());

	Ok(Header {
		destination: EthernetAddress(r.array().map_err(short)?),
		source: EthernetAddress(r.array().map_err(short)?),
		ethertype: r.u16().map_err(short)?,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_the_header() {
		let mut frame = [0u8; 60];
		frame[..6].copy_from_slice(&[0xff; 6]);
		frame[6..12].copy_from_slice(&[2, 0, 0, 0, 0, 1]);
		frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());

		let header = parse(&frame).unwrap();

		assert!(header.destination.is_multicast());
		assert!(!header.source.is_multicast());
		assert_eq!(header.ethertype, 0x0800);
	}

	#[test]
	fn short_frame_is_rejected() {
		assert!(parse(&[0; 13]).is_err());
	}
}

//! The wire codec.
//!
//! Every datagram starts with a four-byte header: protocol version, message
//! type and the big-endian payload length. Each message variant is a distinct
//! type with its own `encode`/`decode`; [`Message::decode`] maps a whole
//! datagram to the matching variant. All integers are network byte order.
//!
//! Decoders never panic on hostile input: any length-field mismatch,
//! unsupported version or trailing garbage yields [`Error::MalformedMessage`],
//! and encoders yield [`Error::BufferTooSmall`] when the destination cannot
//! hold the framed bytes.

use core::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use utils::bytes::{Reader, Writer};

use crate::identity::CertificateHash;
use crate::{ChannelNumber, Error, HostIdentifier, SequenceNumber, SessionNumber, GCM_TAG_SIZE, PROTOCOL_VERSION};

/// The framing header length.
pub const HEADER_SIZE: usize = 4;

/// A message type byte.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Kind(pub u8);

impl Kind {
	pub const CONTACT: Self = Kind(0xFE);
	pub const CONTACT_REQUEST: Self = Kind(0xFD);
	pub const DATA_0: Self = Kind(0x70);
	pub const DATA_15: Self = Kind(0x7F);
	pub const HELLO_REQUEST: Self = Kind(0x00);
	pub const HELLO_RESPONSE: Self = Kind(0x01);
	pub const KEEP_ALIVE: Self = Kind(0xFF);
	pub const PRESENTATION: Self = Kind(0x02);
	pub const SESSION: Self = Kind(0x04);
	pub const SESSION_REQUEST: Self = Kind(0x03);

	/// The DATA type carrying the given channel.
	pub fn of_channel(channel: ChannelNumber) -> Self {
		Kind(Self::DATA_0.0 + channel.value())
	}

	/// The channel number, for DATA_0 through DATA_15.
	pub fn channel(self) -> Option<ChannelNumber> {
		(Self::DATA_0.0..=Self::DATA_15.0)
			.contains(&self.0)
			.then(|| ChannelNumber::new(self.0 - Self::DATA_0.0).expect("within range"))
	}

	/// Whether the type uses the sealed DATA framing.
	pub fn is_data(self) -> bool {
		self.channel().is_some() || matches!(self, Self::CONTACT_REQUEST | Self::CONTACT | Self::KEEP_ALIVE)
	}
}

/// Write the framing header. The payload length is patched in afterwards by
/// [`finish`].
fn header(w: &mut Writer, kind: Kind) -> Result<(), Error> {
	w.u8(PROTOCOL_VERSION)?;
	w.u8(kind.0)?;
	w.u16(0)?;
	Ok(())
}

/// Backpatch the payload length and return the datagram size.
fn finish(mut w: Writer) -> Result<usize, Error> {
	let len = w.position() - HEADER_SIZE;
	u16::try_from(len).map_err(|_| Error::BufferTooSmall)?;
	w.patch_u16(2, len as u16);
	Ok(w.finish())
}

/// A HELLO request or response body: one opaque number, echoed back by the
/// responder so the greeter can correlate the reply.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Hello {
	pub unique_number: u32,
}

impl Hello {
	pub fn encode_request(&self, buf: &mut [u8]) -> Result<usize, Error> {
		self.encode(Kind::HELLO_REQUEST, buf)
	}

	pub fn encode_response(&self, buf: &mut [u8]) -> Result<usize, Error> {
		self.encode(Kind::HELLO_RESPONSE, buf)
	}

	fn encode(&self, kind: Kind, buf: &mut [u8]) -> Result<usize, Error> {
		let mut w = Writer::new(buf);
		header(&mut w, kind)?;
		w.u32(self.unique_number)?;
		finish(w)
	}

	pub fn decode(payload: &[u8]) -> Result<Self, Error> {
		let mut r = Reader::new(payload);
		let unique_number = r.u32()?;

		if !r.is_empty() {
			return Err(Error::MalformedMessage);
		}

		Ok(Self { unique_number })
	}
}

/// A PRESENTATION body: the sender's DER-encoded signature certificate, or
/// nothing at all when the sender authenticates with a pre-shared key only.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Presentation<'a> {
	pub certificate: &'a [u8],
}

impl<'a> Presentation<'a> {
	pub fn encode(&self, buf: &mut [u8]) -> Result<usize, Error> {
		let mut w = Writer::new(buf);
		header(&mut w, Kind::PRESENTATION)?;
		w.u16(self.certificate.len().try_into().map_err(|_| Error::BufferTooSmall)?)?;
		w.bytes(self.certificate)?;
		finish(w)
	}

	pub fn decode(payload: &'a [u8]) -> Result<Self, Error> {
		let mut r = Reader::new(payload);
		let len = r.u16()? as usize;
		let certificate = r.bytes(len)?;

		if !r.is_empty() {
			return Err(Error::MalformedMessage);
		}

		Ok(Self { certificate })
	}
}

/// A SESSION_REQUEST body: the requested session number, the sender's host
/// identifier and its cipher-suite and curve capabilities, signed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SessionRequest<'a> {
	pub session_number: SessionNumber,
	pub host_identifier: HostIdentifier,
	/// Cipher suite identifiers, one byte each, in preference order.
	pub cipher_suites: &'a [u8],
	/// Elliptic curve identifiers, one byte each, in preference order.
	pub elliptic_curves: &'a [u8],
	pub signature: &'a [u8],
	/// The span the signature covers: every field before the signature.
	pub signed: &'a [u8],
}

impl<'a> SessionRequest<'a> {
	/// Encode and sign. `sign` receives the bytes the signature must cover.
	pub fn encode(
		buf: &mut [u8],
		session_number: SessionNumber,
		host_identifier: &HostIdentifier,
		cipher_suites: &[u8],
		elliptic_curves: &[u8],
		sign: impl FnOnce(&[u8]) -> Result<Vec<u8>, Error>,
	) -> Result<usize, Error> {
		let mut w = Writer::new(buf);
		header(&mut w, Kind::SESSION_REQUEST)?;

		w.u32(session_number)?;
		w.bytes(host_identifier.as_bytes())?;
		w.u16(cipher_suites.len().try_into().map_err(|_| Error::BufferTooSmall)?)?;
		w.bytes(cipher_suites)?;
		w.u16(elliptic_curves.len().try_into().map_err(|_| Error::BufferTooSmall)?)?;
		w.bytes(elliptic_curves)?;

		let signed = w.position();
		let signature = sign(&buf[HEADER_SIZE..signed])?;

		let mut w = Writer::new(buf);
		w.skip(signed)?;
		w.u16(signature.len().try_into().map_err(|_| Error::BufferTooSmall)?)?;
		w.bytes(&signature)?;
		finish(w)
	}

	pub fn decode(payload: &'a [u8]) -> Result<Self, Error> {
		let mut r = Reader::new(payload);

		let session_number = r.u32()?;
		let host_identifier = HostIdentifier(r.array()?);
		let cs_len = r.u16()? as usize;
		let cipher_suites = r.bytes(cs_len)?;
		let ec_len = r.u16()? as usize;
		let elliptic_curves = r.bytes(ec_len)?;

		let signed = &payload[..r.position()];

		let sig_len = r.u16()? as usize;
		let signature = r.bytes(sig_len)?;

		if !r.is_empty() {
			return Err(Error::MalformedMessage);
		}

		Ok(Self {
			session_number,
			host_identifier,
			cipher_suites,
			elliptic_curves,
			signature,
			signed,
		})
	}
}

/// A SESSION body: the proposed parameters and ephemeral public key, signed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SessionMessage<'a> {
	pub session_number: SessionNumber,
	pub host_identifier: HostIdentifier,
	pub cipher_suite: u8,
	pub elliptic_curve: u8,
	pub public_key: &'a [u8],
	pub signature: &'a [u8],
	/// The span the signature covers: every field before the signature.
	pub signed: &'a [u8],
}

impl<'a> SessionMessage<'a> {
	/// Encode and sign. `sign` receives the bytes the signature must cover.
	pub fn encode(
		buf: &mut [u8],
		session_number: SessionNumber,
		host_identifier: &HostIdentifier,
		cipher_suite: u8,
		elliptic_curve: u8,
		public_key: &[u8],
		sign: impl FnOnce(&[u8]) -> Result<Vec<u8>, Error>,
	) -> Result<usize, Error> {
		let mut w = Writer::new(buf);
		header(&mut w, Kind::SESSION)?;

		w.u32(session_number)?;
		w.bytes(host_identifier.as_bytes())?;
		w.u8(cipher_suite)?;
		w.u8(elliptic_curve)?;
		// Reserved.
		w.u16(0)?;
		w.u16(public_key.len().try_into().map_err(|_| Error::BufferTooSmall)?)?;
		w.bytes(public_key)?;

		let signed = w.position();
		let signature = sign(&buf[HEADER_SIZE..signed])?;

		let mut w = Writer::new(buf);
		w.skip(signed)?;
		w.u16(signature.len().try_into().map_err(|_| Error::BufferTooSmall)?)?;
		w.bytes(&signature)?;
		finish(w)
	}

	pub fn decode(payload: &'a [u8]) -> Result<Self, Error> {
		let mut r = Reader::new(payload);

		let session_number = r.u32()?;
		let host_identifier = HostIdentifier(r.array()?);
		let cipher_suite = r.u8()?;
		let elliptic_curve = r.u8()?;
		let _reserved = r.u16()?;
		let pk_len = r.u16()? as usize;
		let public_key = r.bytes(pk_len)?;

		let signed = &payload[..r.position()];

		let sig_len = r.u16()? as usize;
		let signature = r.bytes(sig_len)?;

		if !r.is_empty() {
			return Err(Error::MalformedMessage);
		}

		Ok(Self {
			session_number,
			host_identifier,
			cipher_suite,
			elliptic_curve,
			public_key,
			signature,
			signed,
		})
	}
}

/// A sealed DATA body, shared by DATA_0..DATA_15, CONTACT_REQUEST, CONTACT
/// and KEEP_ALIVE: the sequence number, the detached AEAD tag and the
/// ciphertext.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Data<'a> {
	pub sequence_number: SequenceNumber,
	pub tag: [u8; GCM_TAG_SIZE],
	pub ciphertext: &'a [u8],
}

impl<'a> Data<'a> {
	pub fn encode(&self, kind: Kind, buf: &mut [u8]) -> Result<usize, Error> {
		let mut w = Writer::new(buf);
		header(&mut w, kind)?;

		w.u32(self.sequence_number)?;
		w.bytes(&self.tag)?;
		w.u16(self.ciphertext.len().try_into().map_err(|_| Error::BufferTooSmall)?)?;
		w.bytes(self.ciphertext)?;
		finish(w)
	}

	pub fn decode(payload: &'a [u8]) -> Result<Self, Error> {
		let mut r = Reader::new(payload);

		let sequence_number = r.u32()?;
		let tag = r.array()?;
		let ct_len = r.u16()? as usize;
		let ciphertext = r.bytes(ct_len)?;

		if !r.is_empty() {
			return Err(Error::MalformedMessage);
		}

		Ok(Self { sequence_number, tag, ciphertext })
	}
}

/// A parsed datagram.
pub enum Message<'a> {
	HelloRequest(Hello),
	HelloResponse(Hello),
	Presentation(Presentation<'a>),
	SessionRequest(SessionRequest<'a>),
	Session(SessionMessage<'a>),
	Data { kind: Kind, data: Data<'a> },
}

impl<'a> Message<'a> {
	pub fn decode(buf: &'a [u8]) -> Result<Self, Error> {
		let mut r = Reader::new(buf);

		let version = r.u8()?;
		let kind = Kind(r.u8()?);
		let len = r.u16()? as usize;
		let payload = r.bytes(len)?;

		if version != PROTOCOL_VERSION || !r.is_empty() {
			return Err(Error::MalformedMessage);
		}

		Ok(match kind {
			Kind::HELLO_REQUEST => Self::HelloRequest(Hello::decode(payload)?),
			Kind::HELLO_RESPONSE => Self::HelloResponse(Hello::decode(payload)?),
			Kind::PRESENTATION => Self::Presentation(Presentation::decode(payload)?),
			Kind::SESSION_REQUEST => Self::SessionRequest(SessionRequest::decode(payload)?),
			Kind::SESSION => Self::Session(SessionMessage::decode(payload)?),
			kind if kind.is_data() => Self::Data { kind, data: Data::decode(payload)? },
			_ => return Err(Error::MalformedMessage),
		})
	}
}

/// The endpoint type bytes used in CONTACT entries.
const ENDPOINT_IPV4: u8 = 0x04;
const ENDPOINT_IPV6: u8 = 0x06;

/// Parse a CONTACT_REQUEST plaintext: concatenated certificate hashes.
pub fn parse_hash_list(buf: &[u8]) -> Result<Vec<CertificateHash>, Error> {
	if buf.len() % CertificateHash::SIZE != 0 {
		return Err(Error::MalformedMessage);
	}

	let mut r = Reader::new(buf);
	let mut out = Vec::with_capacity(buf.len() / CertificateHash::SIZE);

	while !r.is_empty() {
		out.push(CertificateHash(r.array()?));
	}

	Ok(out)
}

/// Write a CONTACT_REQUEST plaintext.
pub fn write_hash_list(hashes: &[CertificateHash], buf: &mut [u8]) -> Result<usize, Error> {
	let mut w = Writer::new(buf);

	for hash in hashes {
		w.bytes(&hash.0)?;
	}

	Ok(w.finish())
}

/// Parse a CONTACT plaintext: `hash ‖ endpoint-type ‖ address ‖ port` entries.
pub fn parse_contact_map(buf: &[u8]) -> Result<Vec<(CertificateHash, SocketAddr)>, Error> {
	let mut r = Reader::new(buf);
	let mut out = Vec::new();

	while !r.is_empty() {
		let hash = CertificateHash(r.array()?);

		let addr = match r.u8()? {
			ENDPOINT_IPV4 => IpAddr::from(Ipv4Addr::from(r.array::<4>()?)),
			ENDPOINT_IPV6 => IpAddr::from(Ipv6Addr::from(r.array::<16>()?)),
			_ => return Err(Error::MalformedMessage),
		};

		let port = r.u16()?;

		out.push((hash, SocketAddr::new(addr, port)));
	}

	Ok(out)
}

/// Write a CONTACT plaintext.
pub fn write_contact_map(contacts: &[(CertificateHash, SocketAddr)], buf: &mut [u8]) -> Result<usize, Error> {
	let mut w = Writer::new(buf);

	for (hash, ep) in contacts {
		w.bytes(&hash.0)?;

		match ep.ip() {
			IpAddr::V4(v4) => {
				w.u8(ENDPOINT_IPV4)?;
				w.bytes(&v4.octets())?;
			}
			IpAddr::V6(v6) => {
				w.u8(ENDPOINT_IPV6)?;
				w.bytes(&v6.octets())?;
			}
		}

		w.u16(ep.port())?;
	}

	Ok(w.finish())
}

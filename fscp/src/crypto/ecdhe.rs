//! Named curves and ephemeral Diffie–Hellman contexts.

use core::fmt;

use p384::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::StdRng;
use zeroize::Zeroizing;

use crate::Error;

/// A named elliptic curve, as advertised in SESSION_REQUEST capability lists.
///
/// `sect571k1` is part of the wire protocol but no backend for binary curves
/// exists here, so the availability probe reports it unsupported and the
/// engine drops it from its advertised capabilities.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EllipticCurve {
	Sect571k1,
	Secp384r1,
	Secp521r1,
}

impl EllipticCurve {
	/// The wire value advertised by hosts that failed to agree.
	pub const UNSUPPORTED: u8 = 0x00;

	pub fn from_id(id: u8) -> Option<Self> {
		match id {
			0x01 => Some(Self::Sect571k1),
			0x02 => Some(Self::Secp384r1),
			0x03 => Some(Self::Secp521r1),
			_ => None,
		}
	}

	pub fn id(self) -> u8 {
		match self {
			Self::Sect571k1 => 0x01,
			Self::Secp384r1 => 0x02,
			Self::Secp521r1 => 0x03,
		}
	}

	/// Whether a key-agreement backend exists for the curve.
	pub fn is_available(self) -> bool {
		!matches!(self, Self::Sect571k1)
	}
}

impl fmt::Display for EllipticCurve {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(match self {
			Self::Sect571k1 => "sect571k1",
			Self::Secp384r1 => "secp384r1",
			Self::Secp521r1 => "secp521r1",
		})
	}
}

/// An ephemeral key-agreement context. The private scalar never leaves the
/// context and is wiped when the context is dropped.
pub enum Ecdhe {
	P384(p384::ecdh::EphemeralSecret),
	P521(p521::ecdh::EphemeralSecret),
}

impl Ecdhe {
	/// Generate a fresh key pair on `curve`, or `None` if the curve has no
	/// backend.
	pub fn generate(curve: EllipticCurve, rng: &mut StdRng) -> Option<Self> {
		match curve {
			EllipticCurve::Sect571k1 => None,
			EllipticCurve::Secp384r1 => Some(Self::P384(p384::ecdh::EphemeralSecret::random(rng))),
			EllipticCurve::Secp521r1 => Some(Self::P521(p521::ecdh::EphemeralSecret::random(rng))),
		}
	}

	/// The public key as an uncompressed SEC1 point.
	pub fn public_key(&self) -> Vec<u8> {
		match self {
			Self::P384(secret) => secret.public_key().to_encoded_point(false).as_bytes().to_vec(),
			Self::P521(secret) => secret.public_key().to_encoded_point(false).as_bytes().to_vec(),
		}
	}

	/// Combine with the peer's public point into the shared secret.
	pub fn agree(&self, peer_public_key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
		Ok(Zeroizing::new(match self {
			Self::P384(secret) => {
				let peer = p384::PublicKey::from_sec1_bytes(peer_public_key).map_err(|_| Error::MalformedMessage)?;
				secret.diffie_hellman(&peer).raw_secret_bytes().to_vec()
			}
			Self::P521(secret) => {
				let peer = p521::PublicKey::from_sec1_bytes(peer_public_key).map_err(|_| Error::MalformedMessage)?;
				secret.diffie_hellman(&peer).raw_secret_bytes().to_vec()
			}
		}))
	}
}

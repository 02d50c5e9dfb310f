//! Cipher suites, session-key derivation and the AEAD data channel.

use core::fmt;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit};
use hkdf::Hkdf;
use sha2::{Sha256, Sha384};
use zeroize::Zeroizing;

mod ecdhe;
pub mod sign;

pub use ecdhe::{Ecdhe, EllipticCurve};

use crate::{Error, HostIdentifier, SequenceNumber, GCM_TAG_SIZE, NONCE_PREFIX_SIZE};

/// A negotiated AEAD/digest pair.
///
/// The digest governs session-key derivation; the AEAD carries the data
/// channel with a 16-byte detached tag.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CipherSuite {
	EcdheRsaAes128GcmSha256,
	EcdheRsaAes256GcmSha384,
}

impl CipherSuite {
	/// The wire value advertised by hosts that failed to agree.
	pub const UNSUPPORTED: u8 = 0x00;

	pub fn from_id(id: u8) -> Option<Self> {
		match id {
			0x01 => Some(Self::EcdheRsaAes128GcmSha256),
			0x02 => Some(Self::EcdheRsaAes256GcmSha384),
			_ => None,
		}
	}

	pub fn id(self) -> u8 {
		match self {
			Self::EcdheRsaAes128GcmSha256 => 0x01,
			Self::EcdheRsaAes256GcmSha384 => 0x02,
		}
	}

	/// The AEAD key length in bytes.
	pub fn key_len(self) -> usize {
		match self {
			Self::EcdheRsaAes128GcmSha256 => 16,
			Self::EcdheRsaAes256GcmSha384 => 32,
		}
	}

	/// Expand an ECDHE shared secret into both directions' keys and nonce
	/// prefixes.
	///
	/// Both ends run the same expansion, so the output halves are labeled by
	/// host-identifier order: the lower identifier owns the first key and
	/// prefix and the higher identifier the second. The caller's own
	/// direction is then picked by comparing `local` against `remote`.
	pub fn derive(self, shared_secret: &[u8], local: &HostIdentifier, remote: &HostIdentifier) -> SessionKeys {
		let key_len = self.key_len();
		let mut okm = Zeroizing::new(vec![0; 2 * (key_len + NONCE_PREFIX_SIZE)]);

		let (low, high) = if local <= remote { (local, remote) } else { (remote, local) };
		let mut info = [0; 2 * HostIdentifier::SIZE];
		info[..HostIdentifier::SIZE].copy_from_slice(low.as_bytes());
		info[HostIdentifier::SIZE..].copy_from_slice(high.as_bytes());

		match self {
			Self::EcdheRsaAes128GcmSha256 => Hkdf::<Sha256>::new(None, shared_secret)
				.expand(&info, &mut okm)
				.expect("output length is valid for the digest"),
			Self::EcdheRsaAes256GcmSha384 => Hkdf::<Sha384>::new(None, shared_secret)
				.expand(&info, &mut okm)
				.expect("output length is valid for the digest"),
		}

		// okm = key(low→high) ‖ key(high→low) ‖ prefix(low→high) ‖ prefix(high→low)
		let (keys, prefixes) = okm.split_at(2 * key_len);
		let (key_lh, key_hl) = keys.split_at(key_len);
		let (prefix_lh, prefix_hl) = prefixes.split_at(NONCE_PREFIX_SIZE);

		let prefix = |bytes: &[u8]| {
			let mut out = Zeroizing::new([0; NONCE_PREFIX_SIZE]);
			out.copy_from_slice(bytes);
			out
		};

		let (local_key, remote_key, local_prefix, remote_prefix) = if local <= remote {
			(key_lh, key_hl, prefix_lh, prefix_hl)
		} else {
			(key_hl, key_lh, prefix_hl, prefix_lh)
		};

		SessionKeys {
			local_key: Zeroizing::new(local_key.to_vec()),
			remote_key: Zeroizing::new(remote_key.to_vec()),
			local_nonce_prefix: prefix(local_prefix),
			remote_nonce_prefix: prefix(remote_prefix),
		}
	}

	/// Encrypt `buf` in place, returning the detached tag.
	pub fn seal(self, key: &[u8], nonce_prefix: &[u8; NONCE_PREFIX_SIZE], sequence_number: SequenceNumber, buf: &mut [u8]) -> [u8; GCM_TAG_SIZE] {
		let nonce = nonce(nonce_prefix, sequence_number);

		let tag = match self {
			Self::EcdheRsaAes128GcmSha256 => Aes128Gcm::new_from_slice(key)
				.expect("key length matches the suite")
				.encrypt_in_place_detached(GenericArray::from_slice(&nonce), &[], buf)
				.expect("sealing does not fail"),
			Self::EcdheRsaAes256GcmSha384 => Aes256Gcm::new_from_slice(key)
				.expect("key length matches the suite")
				.encrypt_in_place_detached(GenericArray::from_slice(&nonce), &[], buf)
				.expect("sealing does not fail"),
		};

		let mut out = [0; GCM_TAG_SIZE];
		out.copy_from_slice(&tag);
		out
	}

	/// Decrypt `buf` in place, verifying the detached tag.
	pub fn open(
		self,
		key: &[u8],
		nonce_prefix: &[u8; NONCE_PREFIX_SIZE],
		sequence_number: SequenceNumber,
		buf: &mut [u8],
		tag: &[u8; GCM_TAG_SIZE],
	) -> Result<(), Error> {
		let nonce = nonce(nonce_prefix, sequence_number);
		let tag = GenericArray::from_slice(tag);

		match self {
			Self::EcdheRsaAes128GcmSha256 => Aes128Gcm::new_from_slice(key)
				.expect("key length matches the suite")
				.decrypt_in_place_detached(GenericArray::from_slice(&nonce), &[], buf, tag),
			Self::EcdheRsaAes256GcmSha384 => Aes256Gcm::new_from_slice(key)
				.expect("key length matches the suite")
				.decrypt_in_place_detached(GenericArray::from_slice(&nonce), &[], buf, tag),
		}
		.map_err(|_| Error::MalformedMessage)
	}
}

impl fmt::Display for CipherSuite {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(match self {
			Self::EcdheRsaAes128GcmSha256 => "ecdhe-rsa-aes128-gcm-sha256",
			Self::EcdheRsaAes256GcmSha384 => "ecdhe-rsa-aes256-gcm-sha384",
		})
	}
}

/// The AEAD nonce: the per-direction prefix followed by the big-endian
/// sequence number. Sequence numbers never repeat within a session, so
/// neither do nonces.
fn nonce(prefix: &[u8; NONCE_PREFIX_SIZE], sequence_number: SequenceNumber) -> [u8; NONCE_PREFIX_SIZE + 4] {
	let mut out = [0; NONCE_PREFIX_SIZE + 4];
	out[..NONCE_PREFIX_SIZE].copy_from_slice(prefix);
	out[NONCE_PREFIX_SIZE..].copy_from_slice(&sequence_number.to_be_bytes());
	out
}

/// The keys and nonce prefixes of an established session, one of each per
/// direction. Wiped on drop.
pub struct SessionKeys {
	pub local_key: Zeroizing<Vec<u8>>,
	pub remote_key: Zeroizing<Vec<u8>>,
	pub local_nonce_prefix: Zeroizing<[u8; NONCE_PREFIX_SIZE]>,
	pub remote_nonce_prefix: Zeroizing<[u8; NONCE_PREFIX_SIZE]>,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ids() -> (HostIdentifier, HostIdentifier) {
		(HostIdentifier([1; 32]), HostIdentifier([2; 32]))
	}

	#[test]
	fn suite_ids_round_trip() {
		for suite in [CipherSuite::EcdheRsaAes128GcmSha256, CipherSuite::EcdheRsaAes256GcmSha384] {
			assert_eq!(CipherSuite::from_id(suite.id()), Some(suite));
		}

		assert_eq!(CipherSuite::from_id(CipherSuite::UNSUPPORTED), None);
	}

	#[test]
	fn derivation_is_symmetric() {
		let (a, b) = ids();
		let shared = [0x5a; 48];

		for suite in [CipherSuite::EcdheRsaAes128GcmSha256, CipherSuite::EcdheRsaAes256GcmSha384] {
			let at_a = suite.derive(&shared, &a, &b);
			let at_b = suite.derive(&shared, &b, &a);

			assert_eq!(at_a.local_key[..], at_b.remote_key[..]);
			assert_eq!(at_a.remote_key[..], at_b.local_key[..]);
			assert_eq!(*at_a.local_nonce_prefix, *at_b.remote_nonce_prefix);
			assert_eq!(*at_a.remote_nonce_prefix, *at_b.local_nonce_prefix);

			// The two directions never share material.
			assert_ne!(at_a.local_key[..], at_a.remote_key[..]);
			assert_ne!(*at_a.local_nonce_prefix, *at_a.remote_nonce_prefix);
			assert_eq!(at_a.local_key.len(), suite.key_len());
		}
	}

	#[test]
	fn seal_open_round_trip() {
		let (a, b) = ids();
		let suite = CipherSuite::EcdheRsaAes256GcmSha384;
		let keys = suite.derive(&[7; 48], &a, &b);

		let mut buf = *b"a very secret payload";
		let tag = suite.seal(&keys.local_key, &keys.local_nonce_prefix, 1, &mut buf);

		assert_ne!(&buf, b"a very secret payload");

		suite.open(&keys.local_key, &keys.local_nonce_prefix, 1, &mut buf, &tag).unwrap();
		assert_eq!(&buf, b"a very secret payload");
	}

	#[test]
	fn open_rejects_wrong_sequence_number() {
		let suite = CipherSuite::EcdheRsaAes128GcmSha256;
		let (a, b) = ids();
		let keys = suite.derive(&[9; 32], &a, &b);

		let mut buf = *b"payload";
		let tag = suite.seal(&keys.local_key, &keys.local_nonce_prefix, 5, &mut buf);

		assert!(suite.open(&keys.local_key, &keys.local_nonce_prefix, 6, &mut buf, &tag).is_err());
	}
}

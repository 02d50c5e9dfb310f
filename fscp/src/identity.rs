//! Long-term identity material and per-peer presentation stores.

use core::fmt;

use rsa::pkcs1v15::SigningKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use x509_cert::der::referenced::OwnedToRef;
use x509_cert::der::Decode;
use zeroize::Zeroizing;

use crate::crypto::sign;
use crate::Error;

/// The SHA-256 digest of a certificate's DER encoding. Used to name
/// certificates in the contact book.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CertificateHash(pub [u8; 32]);

impl CertificateHash {
	pub const SIZE: usize = 32;
}

impl fmt::Display for CertificateHash {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		for b in &self.0 {
			write!(f, "{b:02x}")?;
		}

		Ok(())
	}
}

impl fmt::Debug for CertificateHash {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

/// An X.509 signature certificate: its DER encoding together with the RSA
/// public key extracted from it.
#[derive(Clone)]
pub struct Certificate {
	der: Box<[u8]>,
	public_key: RsaPublicKey,
	digest: CertificateHash,
}

impl Certificate {
	/// Parse a DER-encoded certificate and extract its RSA public key.
	pub fn from_der(der: &[u8]) -> Result<Self, Error> {
		let cert = x509_cert::Certificate::from_der(der).map_err(|_| Error::MalformedMessage)?;

		let spki = cert.tbs_certificate.subject_public_key_info;
		let public_key = RsaPublicKey::try_from(spki.owned_to_ref()).map_err(|_| Error::MalformedMessage)?;

		Ok(Self::from_parts(der.to_vec(), public_key))
	}

	/// Build a certificate from already-parsed material. `der` must be the
	/// encoding `public_key` was extracted from; it is what goes on the wire
	/// in PRESENTATION messages and what the certificate hash is computed
	/// over.
	pub fn from_parts(der: Vec<u8>, public_key: RsaPublicKey) -> Self {
		let digest = CertificateHash(Sha256::digest(&der).into());

		Self { der: der.into(), public_key, digest }
	}

	pub fn der(&self) -> &[u8] {
		&self.der
	}

	pub fn public_key(&self) -> &RsaPublicKey {
		&self.public_key
	}

	pub fn digest(&self) -> &CertificateHash {
		&self.digest
	}
}

impl PartialEq for Certificate {
	fn eq(&self, other: &Self) -> bool {
		self.der == other.der
	}
}

impl Eq for Certificate {}

/// An arbitrary-length pre-shared secret. Wiped on drop.
#[derive(Clone)]
pub struct PreSharedKey(Zeroizing<Vec<u8>>);

impl PreSharedKey {
	pub fn new(bytes: Vec<u8>) -> Self {
		Self(Zeroizing::new(bytes))
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

/// The local node's long-term identity: its signature certificate with the
/// matching private key, an optional pre-shared key, or both.
///
/// Signed handshake messages use the private key when one is present and fall
/// back to HMAC with the pre-shared key otherwise; a store with neither
/// cannot introduce itself at all.
pub struct IdentityStore {
	certificate: Option<Certificate>,
	signing_key: Option<SigningKey<Sha256>>,
	pre_shared_key: Option<PreSharedKey>,
}

impl IdentityStore {
	pub fn new(certificate: Option<Certificate>, private_key: Option<RsaPrivateKey>, pre_shared_key: Option<PreSharedKey>) -> Self {
		Self {
			certificate,
			signing_key: private_key.map(SigningKey::new),
			pre_shared_key: pre_shared_key.filter(|psk| !psk.is_empty()),
		}
	}

	pub fn certificate(&self) -> Option<&Certificate> {
		self.certificate.as_ref()
	}

	pub fn pre_shared_key(&self) -> Option<&PreSharedKey> {
		self.pre_shared_key.as_ref()
	}

	/// Whether the store can present itself to a peer.
	pub fn can_introduce(&self) -> bool {
		self.certificate.is_some() || self.pre_shared_key.is_some()
	}

	/// Sign a handshake span, preferring the private key over the PSK.
	pub(crate) fn sign(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
		if let Some(key) = &self.signing_key {
			return Ok(sign::rsa_sign(key, data));
		}

		if let Some(psk) = &self.pre_shared_key {
			return Ok(sign::hmac_sign(psk.as_bytes(), data));
		}

		Err(Error::MalformedMessage)
	}
}

/// What is known about a remote endpoint's identity: the certificate it
/// presented (if any) and the pre-shared key copied from the local identity
/// when the presentation was accepted. The store is the authority for
/// verifying SESSION_REQUEST and SESSION signatures; the certificate takes
/// precedence when both are present.
#[derive(Clone)]
pub struct PresentationStore {
	certificate: Option<Certificate>,
	pre_shared_key: Option<PreSharedKey>,
}

impl PresentationStore {
	pub fn new(certificate: Option<Certificate>, pre_shared_key: Option<PreSharedKey>) -> Self {
		Self {
			certificate,
			pre_shared_key: pre_shared_key.filter(|psk| !psk.is_empty()),
		}
	}

	/// A store with neither a certificate nor a PSK cannot verify anything.
	pub fn is_empty(&self) -> bool {
		self.certificate.is_none() && self.pre_shared_key.is_none()
	}

	pub fn certificate(&self) -> Option<&Certificate> {
		self.certificate.as_ref()
	}

	pub fn pre_shared_key(&self) -> Option<&PreSharedKey> {
		self.pre_shared_key.as_ref()
	}

	/// Verify a handshake signature against the stored material.
	pub(crate) fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
		if let Some(certificate) = &self.certificate {
			return sign::rsa_verify(certificate.public_key(), data, signature);
		}

		if let Some(psk) = &self.pre_shared_key {
			return sign::hmac_verify(psk.as_bytes(), data, signature);
		}

		false
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rsa_key() -> RsaPrivateKey {
		RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).unwrap()
	}

	#[test]
	fn psk_identity_signs_and_verifies() {
		let psk = PreSharedKey::new(b"swordfish".to_vec());
		let identity = IdentityStore::new(None, None, Some(psk.clone()));
		let store = PresentationStore::new(None, Some(psk));

		let sig = identity.sign(b"span").unwrap();
		assert!(store.verify(b"span", &sig));
		assert!(!store.verify(b"other span", &sig));
	}

	#[test]
	fn empty_identity_cannot_sign() {
		let identity = IdentityStore::new(None, None, None);

		assert!(!identity.can_introduce());
		assert!(identity.sign(b"span").is_err());
	}

	#[test]
	fn empty_psk_counts_as_absent() {
		let identity = IdentityStore::new(None, None, Some(PreSharedKey::new(Vec::new())));
		assert!(!identity.can_introduce());

		let store = PresentationStore::new(None, Some(PreSharedKey::new(Vec::new())));
		assert!(store.is_empty());
	}

	#[test]
	fn certificate_takes_precedence_over_psk() {
		let key = rsa_key();
		let public = RsaPublicKey::from(&key);
		let certificate = Certificate::from_parts(b"der".to_vec(), public);

		let psk = PreSharedKey::new(b"secret".to_vec());
		let identity = IdentityStore::new(Some(certificate.clone()), Some(key), Some(psk.clone()));
		let store = PresentationStore::new(Some(certificate), Some(psk));

		// The RSA signature verifies through the certificate even though a
		// PSK is present on both sides.
		let sig = identity.sign(b"span").unwrap();
		assert_eq!(sig.len(), 256);
		assert!(store.verify(b"span", &sig));
	}

	#[test]
	fn garbage_der_is_rejected() {
		assert!(Certificate::from_der(b"not a certificate").is_err());
	}
}

//! Handshake signatures.
//!
//! Certificate holders sign with RSA PKCS#1 v1.5 over SHA-256; hosts that
//! authenticate with a pre-shared key use HMAC-SHA256 instead. The digest is
//! fixed: SESSION_REQUEST is signed before any cipher suite has been agreed,
//! so the signature scheme cannot depend on the negotiation outcome.

use hmac::{Hmac, Mac};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::RsaPublicKey;
use sha2::Sha256;

pub(crate) fn rsa_sign(key: &SigningKey<Sha256>, data: &[u8]) -> Vec<u8> {
	key.sign(data).to_vec()
}

pub(crate) fn rsa_verify(key: &RsaPublicKey, data: &[u8], signature: &[u8]) -> bool {
	let Ok(signature) = Signature::try_from(signature) else {
		return false;
	};

	VerifyingKey::<Sha256>::new(key.clone()).verify(data, &signature).is_ok()
}

pub(crate) fn hmac_sign(key: &[u8], data: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
	mac.update(data);
	mac.finalize().into_bytes().to_vec()
}

pub(crate) fn hmac_verify(key: &[u8], data: &[u8], signature: &[u8]) -> bool {
	let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
	mac.update(data);
	mac.verify_slice(signature).is_ok()
}

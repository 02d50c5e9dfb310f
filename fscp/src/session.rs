//! Per-peer session state.
//!
//! A peer-session is created the first time the engine exchanges a message
//! with an endpoint and tracks everything negotiated with it since: the host
//! identifiers, the liveness timestamp, the *current* session carrying data
//! traffic and the *next* session being negotiated. The next slot holds the
//! pending ECDHE state and only promotes to current once the remote's
//! matching SESSION message has been verified, so a rekey never interrupts
//! the data channel.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;

use crate::crypto::{CipherSuite, Ecdhe, EllipticCurve, SessionKeys};
use crate::{Error, HostIdentifier, SequenceNumber, SessionNumber, GCM_TAG_SIZE};

/// The parameters a SESSION message carries.
#[derive(Clone)]
pub struct SessionParameters {
	pub session_number: SessionNumber,
	pub cipher_suite: CipherSuite,
	pub elliptic_curve: EllipticCurve,
	/// The local ephemeral public key, as it went (or will go) on the wire.
	pub public_key: Box<[u8]>,
}

struct NextSession {
	parameters: SessionParameters,
	ecdhe: Ecdhe,
}

/// An established session: finalized parameters, both directions' key
/// material and the sequence discipline.
pub struct CurrentSession {
	parameters: SessionParameters,
	local_sequence_number: SequenceNumber,
	remote_sequence_number: SequenceNumber,
	keys: SessionKeys,
}

impl CurrentSession {
	pub fn parameters(&self) -> &SessionParameters {
		&self.parameters
	}

	/// The highest sequence number accepted from the remote so far.
	pub fn remote_sequence_number(&self) -> SequenceNumber {
		self.remote_sequence_number
	}

	/// A session is old once either direction's sequence number has passed
	/// half its range; the engine must renegotiate before it can wrap.
	pub fn is_old(&self) -> bool {
		const HALF: SequenceNumber = SequenceNumber::MAX / 2;

		self.local_sequence_number > HALF || self.remote_sequence_number > HALF
	}

	/// Encrypt `buf` in place with the local send key, returning the tag.
	pub fn seal(&self, sequence_number: SequenceNumber, buf: &mut [u8]) -> [u8; GCM_TAG_SIZE] {
		self.parameters
			.cipher_suite
			.seal(&self.keys.local_key, &self.keys.local_nonce_prefix, sequence_number, buf)
	}

	/// Decrypt `buf` in place with the remote's send key.
	pub fn open(&self, sequence_number: SequenceNumber, buf: &mut [u8], tag: &[u8; GCM_TAG_SIZE]) -> Result<(), Error> {
		self.parameters
			.cipher_suite
			.open(&self.keys.remote_key, &self.keys.remote_nonce_prefix, sequence_number, buf, tag)
	}
}

/// The complete state kept for one remote endpoint.
pub struct PeerSession {
	local_host_identifier: HostIdentifier,
	remote_host_identifier: Option<HostIdentifier>,
	last_sign_of_life: Instant,
	next: Option<NextSession>,
	current: Option<CurrentSession>,
}

impl PeerSession {
	pub fn new(rng: &mut StdRng, now: Instant) -> Self {
		Self {
			local_host_identifier: HostIdentifier::random(rng),
			remote_host_identifier: None,
			last_sign_of_life: now,
			next: None,
			current: None,
		}
	}

	pub fn local_host_identifier(&self) -> &HostIdentifier {
		&self.local_host_identifier
	}

	pub fn remote_host_identifier(&self) -> Option<&HostIdentifier> {
		self.remote_host_identifier.as_ref()
	}

	/// Pin the remote host identifier on first contact. Returns false if a
	/// different identifier is already pinned, in which case the caller must
	/// ignore the message: the sender is not the host this session was
	/// negotiated with.
	pub fn set_first_remote_host_identifier(&mut self, host_identifier: &HostIdentifier) -> bool {
		match &self.remote_host_identifier {
			Some(pinned) => pinned == host_identifier,
			None => {
				self.remote_host_identifier = Some(*host_identifier);
				true
			}
		}
	}

	/// Refresh the liveness timestamp.
	pub fn keep_alive(&mut self, now: Instant) {
		self.last_sign_of_life = now;
	}

	pub fn has_timed_out(&self, now: Instant, timeout: Duration) -> bool {
		now.duration_since(self.last_sign_of_life) > timeout
	}

	pub fn has_current_session(&self) -> bool {
		self.current.is_some()
	}

	pub fn current_session(&self) -> Option<&CurrentSession> {
		self.current.as_ref()
	}

	/// The session number to propose for the next negotiation: strictly
	/// greater than the current session's, or zero for a first session.
	pub fn next_session_number(&self) -> SessionNumber {
		match &self.current {
			Some(current) => current.parameters.session_number + 1,
			None => 0,
		}
	}

	/// The parameters of the pending next session, if one is prepared.
	pub fn next_session_parameters(&self) -> Option<&SessionParameters> {
		self.next.as_ref().map(|next| &next.parameters)
	}

	/// Install a fresh ECDHE key pair as the next session. Returns false if
	/// an identical next session is already pending (a retransmitted request
	/// must not throw away the ECDHE state the peer is about to answer) or
	/// if the curve has no backend.
	pub fn prepare_session(&mut self, rng: &mut StdRng, session_number: SessionNumber, cipher_suite: CipherSuite, elliptic_curve: EllipticCurve) -> bool {
		if let Some(next) = &self.next {
			let p = &next.parameters;

			if p.session_number == session_number && p.cipher_suite == cipher_suite && p.elliptic_curve == elliptic_curve {
				return false;
			}
		}

		let Some(ecdhe) = Ecdhe::generate(elliptic_curve, rng) else {
			return false;
		};

		let public_key = ecdhe.public_key().into_boxed_slice();

		self.next = Some(NextSession {
			parameters: SessionParameters {
				session_number,
				cipher_suite,
				elliptic_curve,
				public_key,
			},
			ecdhe,
		});

		true
	}

	/// Derive the session keys from the pending next session and the remote
	/// public key, promote next to current and reset both sequence numbers.
	///
	/// Returns `Ok(false)` when no next session is pending or the remote
	/// host identifier has not been pinned yet; `Err` when the remote public
	/// key cannot be parsed.
	pub fn complete_session(&mut self, remote_public_key: &[u8]) -> Result<bool, Error> {
		let (Some(next), Some(remote)) = (&self.next, &self.remote_host_identifier) else {
			return Ok(false);
		};

		let shared_secret = next.ecdhe.agree(remote_public_key)?;
		let keys = next.parameters.cipher_suite.derive(&shared_secret, &self.local_host_identifier, remote);

		let next = self.next.take().expect("a next session is pending");

		self.current = Some(CurrentSession {
			parameters: next.parameters,
			local_sequence_number: 0,
			remote_sequence_number: 0,
			keys,
		});

		Ok(true)
	}

	/// Increment and return the local sequence number. `None` without a
	/// current session.
	pub fn increment_local_sequence_number(&mut self) -> Option<SequenceNumber> {
		let current = self.current.as_mut()?;
		current.local_sequence_number += 1;
		Some(current.local_sequence_number)
	}

	/// Accept a remote sequence number, which must be strictly greater than
	/// the last accepted one. Returns false (storing nothing) for replays
	/// and reorderings.
	pub fn set_remote_sequence_number(&mut self, sequence_number: SequenceNumber) -> bool {
		let Some(current) = self.current.as_mut() else {
			return false;
		};

		if sequence_number <= current.remote_sequence_number {
			return false;
		}

		current.remote_sequence_number = sequence_number;
		true
	}

	/// Jump the send counter, standing in for a long-running stream.
	#[cfg(test)]
	pub(crate) fn force_local_sequence_number(&mut self, sequence_number: SequenceNumber) {
		if let Some(current) = self.current.as_mut() {
			current.local_sequence_number = sequence_number;
		}
	}

	/// Wipe both the current and the next session. Key material and ECDHE
	/// state zeroize on drop. Reports whether a current session actually
	/// went away, so the engine knows to fire its session-lost callback.
	pub fn clear(&mut self) -> bool {
		self.next = None;
		self.current.take().is_some()
	}
}

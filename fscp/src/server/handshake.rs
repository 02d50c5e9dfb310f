//! HELLO, PRESENTATION, SESSION_REQUEST and SESSION handling.

use core::net::SocketAddr;

use log::{trace, warn};
use stakker::{fwd, ret, CX};

use super::{Link, PresentationStatus, Server, SessionFailed};
use crate::crypto::{CipherSuite, EllipticCurve};
use crate::identity::{Certificate, PresentationStore};
use crate::message::{Hello, Presentation, SessionMessage, SessionRequest};
use crate::session::PeerSession;
use crate::Error;

impl<L: Link> Server<L> {
	pub(super) fn handle_hello_request(&mut self, from: SocketAddr, hello: Hello) -> Result<(), Error> {
		let count = self.hello_counters.entry(from).or_insert(0);
		*count += 1;

		if *count > self.config.hello_limit {
			warn!("Received too many HELLO messages from {from}, limit is {} per window", self.config.hello_limit);
			return Ok(());
		}

		let mut allow = self.config.accept_hello_default;

		if let Some(accept) = &mut self.handlers.hello_accept {
			allow = accept(from, allow);
		}

		if !allow {
			trace!("Not answering HELLO_REQUEST from {from}");
			return Ok(());
		}

		self.send(from, |buf| Hello { unique_number: hello.unique_number }.encode_response(buf))
	}

	pub(super) fn handle_hello_response(&mut self, cx: CX![], from: SocketAddr, hello: Hello) -> Result<(), Error> {
		// Unsolicited or late responses fall through silently.
		if let Some(pending) = self.greet.remove(from, hello.unique_number) {
			cx.timer_del(pending.timer);
			ret!([pending.ret], Ok(cx.now() - pending.start));
		}

		Ok(())
	}

	pub(super) fn handle_presentation(&mut self, from: SocketAddr, presentation: Presentation) -> Result<(), Error> {
		let count = self.presentation_counters.entry(from).or_insert(0);
		*count += 1;

		if *count > self.config.presentation_limit {
			warn!(
				"Received too many PRESENTATION messages from {from}, limit is {} per window",
				self.config.presentation_limit
			);
			return Ok(());
		}

		let certificate = match presentation.certificate {
			[] => None,
			der => Some(Certificate::from_der(der)?),
		};

		let status = match self.presentations.get(&from) {
			None => PresentationStatus::First,
			Some(store) => match (store.certificate(), &certificate) {
				(Some(stored), Some(received)) if stored == received => PresentationStatus::Same,
				(None, None) => PresentationStatus::Same,
				_ => PresentationStatus::New,
			},
		};

		let has_session = self.peers.get(&from).is_some_and(PeerSession::has_current_session);

		let mut allow = self.config.accept_presentation_default;

		if let Some(accept) = &mut self.handlers.presentation_accept {
			allow = accept(from, certificate.as_ref(), status, has_session);
		}

		if !allow {
			trace!("Rejecting PRESENTATION from {from} ({status:?})");
			return Ok(());
		}

		// The PSK is copied from the local identity at acceptance time; a
		// store holding neither a certificate nor a PSK could never verify a
		// signature, so it is not installed at all.
		let store = PresentationStore::new(certificate, self.identity.pre_shared_key().cloned());

		if store.is_empty() {
			trace!("PRESENTATION from {from} carries no certificate and no PSK is configured. Ignoring.");
			return Ok(());
		}

		trace!("Accepted PRESENTATION from {from} ({status:?})");
		self.presentations.insert(from, store);

		Ok(())
	}

	/// Look up the presentation store for `endpoint` and verify a handshake
	/// signature with it.
	fn verify_handshake(&self, endpoint: SocketAddr, what: &str, signed: &[u8], signature: &[u8]) -> Result<(), Error> {
		let Some(store) = self.presentations.get(&endpoint).filter(|store| !store.is_empty()) else {
			trace!("Received a {what} from {endpoint} but no presentation is available. Ignoring.");
			return Err(Error::MalformedMessage);
		};

		if !store.verify(signed, signature) {
			trace!("Received a {what} from {endpoint} with an invalid signature. Ignoring.");
			return Err(Error::MalformedMessage);
		}

		Ok(())
	}

	fn emit_session_failed(&mut self, endpoint: SocketAddr, is_new: bool, remote_cipher_suites: Vec<u8>, remote_elliptic_curves: Vec<u8>) {
		if let Some(handler) = &self.handlers.session_failed {
			fwd!(
				[handler],
				SessionFailed {
					endpoint,
					is_new,
					local_cipher_suites: self.config.cipher_suites.iter().map(|suite| suite.id()).collect(),
					local_elliptic_curves: self.config.elliptic_curves.iter().map(|curve| curve.id()).collect(),
					remote_cipher_suites,
					remote_elliptic_curves,
				}
			);
		}
	}

	pub(super) fn handle_session_request(&mut self, cx: CX![], from: SocketAddr, request: SessionRequest) -> Result<(), Error> {
		self.verify_handshake(from, "SESSION_REQUEST", request.signed, request.signature)?;

		let now = cx.now();
		let peer = self.peer(from, now);

		if !peer.set_first_remote_host_identifier(&request.host_identifier) {
			trace!("Received a SESSION_REQUEST from {from} but the host identifier does not match. Ignoring.");
			return Ok(());
		}

		// Pick the first locally-preferred algorithms the remote also
		// supports.
		let cipher_suite = self.config.cipher_suites.iter().copied().find(|suite| request.cipher_suites.contains(&suite.id()));
		let elliptic_curve = self
			.config
			.elliptic_curves
			.iter()
			.copied()
			.find(|curve| request.elliptic_curves.contains(&curve.id()));

		let (Some(cipher_suite), Some(elliptic_curve)) = (cipher_suite, elliptic_curve) else {
			warn!("Received a SESSION_REQUEST from {from} but can't agree on the algorithms to use. Ignoring.");

			let is_new = !self.peers.get(&from).is_some_and(PeerSession::has_current_session);
			self.emit_session_failed(from, is_new, request.cipher_suites.to_vec(), request.elliptic_curves.to_vec());

			return Ok(());
		};

		let remote_suites: Vec<CipherSuite> = request.cipher_suites.iter().copied().filter_map(CipherSuite::from_id).collect();
		let remote_curves: Vec<EllipticCurve> = request.elliptic_curves.iter().copied().filter_map(EllipticCurve::from_id).collect();

		let mut allow = self.config.accept_session_request_default;

		if let Some(accept) = &mut self.handlers.session_request_accept {
			allow = accept(from, &remote_suites, &remote_curves, allow);
		}

		if !allow {
			trace!("Received a SESSION_REQUEST from {from} but not allowed to reply.");
			return Ok(());
		}

		let peer = self.peers.get_mut(&from).expect("the peer session was just created");

		let current_number = peer.current_session().map(|current| current.parameters().session_number);

		let parameters = match current_number {
			// No current session, or the peer asks for a newer one: prepare
			// a next session and announce it.
			None => {
				trace!(
					"Received a SESSION_REQUEST from {from} with session number {}. No current session exists: preparing one and sending it.",
					request.session_number
				);

				peer.prepare_session(&mut self.rng, request.session_number, cipher_suite, elliptic_curve);
				peer.next_session_parameters().cloned()
			}
			Some(number) if request.session_number > number => {
				trace!(
					"Received a SESSION_REQUEST from {from} with session number {} (current is {number}): preparing a new session and sending it.",
					request.session_number
				);

				peer.prepare_session(&mut self.rng, request.session_number, cipher_suite, elliptic_curve);
				peer.next_session_parameters().cloned()
			}
			// An old session is requested: re-announce the current one.
			Some(number) => {
				trace!(
					"Received a SESSION_REQUEST from {from} with session number {} (current is {number}): sending the current session.",
					request.session_number
				);

				peer.current_session().map(|current| current.parameters().clone())
			}
		};

		match parameters {
			Some(parameters) => self.send_session(from, &parameters),
			// The curve probe passed, so this only happens if preparation
			// raced with nothing to offer; drop quietly.
			None => Ok(()),
		}
	}

	pub(super) fn handle_session(&mut self, cx: CX![], from: SocketAddr, session: SessionMessage) -> Result<(), Error> {
		self.verify_handshake(from, "SESSION", session.signed, session.signature)?;

		let now = cx.now();
		let peer = self.peer(from, now);

		if !peer.set_first_remote_host_identifier(&session.host_identifier) {
			trace!("Received a SESSION from {from} but the host identifier does not match. Ignoring.");
			return Ok(());
		}

		let is_new = !peer.has_current_session();
		let current = peer.current_session().map(|current| (current.parameters().session_number, current.parameters().cipher_suite.id()));

		if let Some((number, cipher_suite)) = current {
			if session.session_number == number {
				if cipher_suite != session.cipher_suite {
					trace!("Received a SESSION from {from} matching the current number but not its cipher suite: requesting a new session.");
					return self.send_session_request(cx, from);
				}

				trace!("Received a SESSION from {from} matching the current session. Ignoring.");
				return Ok(());
			}

			if session.session_number < number {
				trace!("Received an outdated SESSION from {from} (number {} < {number}). Ignoring.", session.session_number);
				return Ok(());
			}
		}

		let cipher_suite = CipherSuite::from_id(session.cipher_suite);
		let elliptic_curve = EllipticCurve::from_id(session.elliptic_curve).filter(|curve| curve.is_available());

		let (Some(cipher_suite), Some(elliptic_curve)) = (cipher_suite, elliptic_curve) else {
			trace!("Received a SESSION from {from} with unsupported algorithms. Failing the handshake.");
			self.emit_session_failed(from, is_new, vec![session.cipher_suite], vec![session.elliptic_curve]);
			return Ok(());
		};

		let mut allow = self.config.accept_session_default;

		if let Some(accept) = &mut self.handlers.session_accept {
			allow = accept(from, cipher_suite, elliptic_curve, allow);
		}

		if !allow {
			trace!("Received a SESSION from {from} but not allowed to accept.");
			return Ok(());
		}

		let peer = self.peers.get_mut(&from).expect("the peer session was just created");

		if !peer.complete_session(session.public_key)? {
			// Unsolicited SESSION: nothing was prepared yet. Prepare from
			// the received parameters and retry; completing implicitly
			// triggers our own SESSION announcement as acknowledgement.
			trace!(
				"Received a SESSION from {from} with session number {} but no session was prepared yet. Preparing one.",
				session.session_number
			);

			peer.prepare_session(&mut self.rng, session.session_number, cipher_suite, elliptic_curve);

			if !peer.complete_session(session.public_key)? {
				warn!("Unable to compute the session keys with {from}.");
				return Ok(());
			}
		}

		let Some(parameters) = self.peers.get(&from).and_then(|peer| peer.current_session()).map(|current| current.parameters().clone()) else {
			return Ok(());
		};

		trace!("Session established with {from}. Sending acknowledgement SESSION back.");

		self.send_session(from, &parameters)?;

		if let Some(handler) = &self.handlers.session_established {
			fwd!(
				[handler],
				super::SessionEstablished {
					endpoint: from,
					is_new,
					cipher_suite: parameters.cipher_suite,
					elliptic_curve: parameters.elliptic_curve,
				}
			);
		}

		Ok(())
	}
}

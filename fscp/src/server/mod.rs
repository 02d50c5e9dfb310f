//! The protocol engine.
//!
//! One [`Server`] actor owns the UDP endpoint and every piece of per-peer
//! protocol state; running inside a single actor context serializes all state
//! transitions, so no handler ever observes a peer session mid-change. Public
//! operations complete through [`Ret`] one-shots and notifications fan out
//! through the [`Fwd`] handles supplied at init.

use core::mem;
use core::net::SocketAddr;
use core::time::Duration;
use std::io;
use std::net::UdpSocket;

use log::{trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use runtime::{Datagram, Io, RECV_BUFFER_SIZE};
use stakker::{fwd, fwd_to, ret, Fwd, Ret, CX};

use crate::crypto::{CipherSuite, EllipticCurve};
use crate::identity::{Certificate, CertificateHash, IdentityStore, PresentationStore};
use crate::message::{Hello, Kind, Message, Presentation};
use crate::session::{PeerSession, SessionParameters};
use crate::{ChannelNumber, Error, Map, KEEP_ALIVE_DATA_SIZE, KEEP_ALIVE_PERIOD, RATE_LIMIT_WINDOW, SESSION_TIMEOUT};

mod data;
mod greet;
mod handshake;

/// The UDP socket abstraction the engine consumes. Sends must not block;
/// implementations queue instead.
pub trait Link: 'static {
	fn send_to(&self, to: SocketAddr, bytes: &[u8]) -> io::Result<()>;
}

impl Link for Io {
	fn send_to(&self, to: SocketAddr, bytes: &[u8]) -> io::Result<()> {
		Io::send_to(self, to, bytes)
	}
}

/// How a received PRESENTATION relates to what the endpoint presented
/// before.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PresentationStatus {
	/// Nothing was presented before.
	First,
	/// A different certificate was presented before.
	New,
	/// The same certificate was presented before.
	Same,
}

/// Why a session went away.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionLossReason {
	Timeout,
	ManualTermination,
}

/// Fired when a current session is installed, on first establishment and on
/// every rekey.
pub struct SessionEstablished {
	pub endpoint: SocketAddr,
	pub is_new: bool,
	pub cipher_suite: CipherSuite,
	pub elliptic_curve: EllipticCurve,
}

/// Fired exactly once whenever a current session is removed.
pub struct SessionLost {
	pub endpoint: SocketAddr,
	pub reason: SessionLossReason,
}

/// Fired when negotiation with a peer cannot agree on algorithms.
pub struct SessionFailed {
	pub endpoint: SocketAddr,
	pub is_new: bool,
	/// Locally supported cipher suite and curve identifiers.
	pub local_cipher_suites: Vec<u8>,
	pub local_elliptic_curves: Vec<u8>,
	/// What the remote offered, raw, since it may include identifiers this
	/// build does not know.
	pub remote_cipher_suites: Vec<u8>,
	pub remote_elliptic_curves: Vec<u8>,
}

/// Fired for every decrypted DATA message.
pub struct DataReceived {
	pub endpoint: SocketAddr,
	pub channel: ChannelNumber,
	pub bytes: Box<[u8]>,
}

/// Fired for every entry of a received CONTACT message.
pub struct ContactReceived {
	pub endpoint: SocketAddr,
	pub hash: CertificateHash,
	pub contact: SocketAddr,
}

/// The embedder's hooks. Accept predicates run synchronously on the engine's
/// strand and return whether to proceed; notifications are forwarded.
#[derive(Default)]
pub struct Handlers {
	pub hello_accept: Option<Box<dyn FnMut(SocketAddr, bool) -> bool>>,
	pub presentation_accept: Option<Box<dyn FnMut(SocketAddr, Option<&Certificate>, PresentationStatus, bool) -> bool>>,
	pub session_request_accept: Option<Box<dyn FnMut(SocketAddr, &[CipherSuite], &[EllipticCurve], bool) -> bool>>,
	pub session_accept: Option<Box<dyn FnMut(SocketAddr, CipherSuite, EllipticCurve, bool) -> bool>>,
	pub contact_request_accept: Option<Box<dyn FnMut(SocketAddr, &Certificate, &CertificateHash, SocketAddr) -> bool>>,

	pub session_established: Option<Fwd<SessionEstablished>>,
	pub session_lost: Option<Fwd<SessionLost>>,
	pub session_failed: Option<Fwd<SessionFailed>>,
	pub data_received: Option<Fwd<DataReceived>>,
	pub contact_received: Option<Fwd<ContactReceived>>,
}

/// Engine tunables. The capability lists are in preference order; curves
/// without a backend are dropped at init.
pub struct ServerConfig {
	pub cipher_suites: Vec<CipherSuite>,
	pub elliptic_curves: Vec<EllipticCurve>,
	/// Maximum HELLO_REQUESTs answered per endpoint per rate-limit window.
	pub hello_limit: u32,
	/// Maximum PRESENTATIONs processed per endpoint per rate-limit window.
	pub presentation_limit: u32,
	pub accept_hello_default: bool,
	pub accept_presentation_default: bool,
	pub accept_session_request_default: bool,
	pub accept_session_default: bool,
	pub keep_alive_period: Duration,
	pub session_timeout: Duration,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			cipher_suites: vec![CipherSuite::EcdheRsaAes256GcmSha384, CipherSuite::EcdheRsaAes128GcmSha256],
			elliptic_curves: vec![EllipticCurve::Sect571k1, EllipticCurve::Secp384r1, EllipticCurve::Secp521r1],
			hello_limit: 10,
			presentation_limit: 10,
			accept_hello_default: true,
			accept_presentation_default: true,
			accept_session_request_default: true,
			accept_session_default: true,
			keep_alive_period: KEEP_ALIVE_PERIOD,
			session_timeout: SESSION_TIMEOUT,
		}
	}
}

/// The protocol engine actor.
pub struct Server<L: Link> {
	link: L,
	identity: IdentityStore,
	config: ServerConfig,
	handlers: Handlers,
	rng: StdRng,

	peers: Map<SocketAddr, PeerSession>,
	presentations: Map<SocketAddr, PresentationStore>,
	greet: greet::Book,
	hello_counters: Map<SocketAddr, u32>,
	presentation_counters: Map<SocketAddr, u32>,

	send_buffer: Vec<u8>,
	open: bool,
}

impl Server<Io> {
	/// Bind the engine to a UDP socket registered with the poll loop.
	pub fn init(cx: CX![], socket: UdpSocket, identity: IdentityStore, config: ServerConfig, handlers: Handlers) -> Option<Self> {
		let fwd = fwd_to!([cx], receive() as (Datagram));

		let link = match Io::new(socket, fwd) {
			Ok(link) => link,
			Err(err) => {
				log::error!("Failed to register the socket: {err}");
				return None;
			}
		};

		Self::with_link(cx, link, identity, config, handlers)
	}
}

impl<L: Link> Server<L> {
	/// Start the engine over an already-constructed link.
	pub fn with_link(cx: CX![], link: L, identity: IdentityStore, mut config: ServerConfig, handlers: Handlers) -> Option<Self> {
		// Probe curve availability and drop what has no backend from the
		// advertised capabilities.
		config.elliptic_curves.retain(|curve| curve.is_available());

		let mut this = Self {
			link,
			identity,
			config,
			handlers,
			rng: StdRng::from_entropy(),
			peers: Map::default(),
			presentations: Map::default(),
			greet: greet::Book::default(),
			hello_counters: Map::default(),
			presentation_counters: Map::default(),
			send_buffer: vec![0; RECV_BUFFER_SIZE],
			open: true,
		};

		this.arm_keep_alive(cx);
		this.arm_rate_limit(cx);

		Some(this)
	}

	/// Feed one received datagram into the engine.
	pub fn receive(&mut self, cx: CX![], datagram: Datagram) {
		if !self.open {
			return;
		}

		let from = normalize(datagram.from);

		// Parse and verification failures drop the datagram silently; an
		// attacker must not learn which check failed.
		if let Err(err) = self.handle(cx, from, &datagram.bytes) {
			trace!("Dropping datagram from {from}: {err}");
		}
	}

	fn handle(&mut self, cx: CX![], from: SocketAddr, bytes: &[u8]) -> Result<(), Error> {
		match Message::decode(bytes)? {
			Message::HelloRequest(hello) => self.handle_hello_request(from, hello),
			Message::HelloResponse(hello) => self.handle_hello_response(cx, from, hello),
			Message::Presentation(presentation) => self.handle_presentation(from, presentation),
			Message::SessionRequest(request) => self.handle_session_request(cx, from, request),
			Message::Session(session) => self.handle_session(cx, from, session),
			Message::Data { kind, data } => self.handle_data(cx, from, kind, data),
		}
	}

	// ---- Public operations --------------------------------------------

	/// Send a HELLO_REQUEST and complete with the measured round-trip once
	/// the response arrives, or with `HelloRequestTimedOut`.
	pub fn greet(&mut self, cx: CX![], target: SocketAddr, timeout: Duration, ret: Ret<Result<Duration, Error>>) {
		if !self.open {
			ret!([ret], Err(Error::ServerOffline));
			return;
		}

		let unique_number = self.greet.next_unique_number(target, &mut self.rng);

		if let Err(err) = self.send(target, |buf| Hello { unique_number }.encode_request(buf)) {
			ret!([ret], Err(err));
			return;
		}

		let actor = cx.access_actor().clone();
		let timer = cx.after(timeout, move |s| actor.apply(s, move |this, cx| this.greet_timeout(cx, target, unique_number)));

		self.greet.insert(target, unique_number, greet::Pending { ret, timer, start: cx.now() });
	}

	fn greet_timeout(&mut self, _cx: CX![], target: SocketAddr, unique_number: u32) {
		if let Some(pending) = self.greet.remove(target, unique_number) {
			trace!("HELLO_REQUEST {unique_number:08x} to {target} timed out");
			ret!([pending.ret], Err(Error::HelloRequestTimedOut));
		}
	}

	/// Present the local identity to `target`.
	pub fn introduce_to(&mut self, _cx: CX![], target: SocketAddr, ret: Ret<Result<(), Error>>) {
		ret!([ret], self.introduce(target));
	}

	/// Present the local identity to every endpoint a presentation is known
	/// for.
	pub fn reintroduce_to_all(&mut self, _cx: CX![], ret: Ret<Vec<(SocketAddr, Result<(), Error>)>>) {
		let targets: Vec<SocketAddr> = self.presentations.keys().copied().collect();
		let results = targets.into_iter().map(|target| (target, self.introduce(target))).collect();
		ret!([ret], results);
	}

	fn introduce(&mut self, target: SocketAddr) -> Result<(), Error> {
		if !self.open {
			return Err(Error::ServerOffline);
		}

		if !self.identity.can_introduce() {
			// Neither a certificate nor a PSK: nothing to present.
			return Err(Error::MalformedMessage);
		}

		let certificate = self.identity.certificate().map(|cert| cert.der().to_vec()).unwrap_or_default();

		self.send(target, |buf| Presentation { certificate: &certificate }.encode(buf))
	}

	/// Open a session negotiation with `target` by sending a signed
	/// SESSION_REQUEST advertising the local capabilities.
	pub fn request_session(&mut self, cx: CX![], target: SocketAddr, ret: Ret<Result<(), Error>>) {
		if !self.open {
			ret!([ret], Err(Error::ServerOffline));
			return;
		}

		if self.peers.get(&target).is_some_and(PeerSession::has_current_session) {
			ret!([ret], Err(Error::SessionAlreadyExists));
			return;
		}

		ret!([ret], self.send_session_request(cx, target));
	}

	/// AEAD-encrypt `bytes` to `target` on `channel`.
	pub fn send_data(&mut self, _cx: CX![], target: SocketAddr, channel: ChannelNumber, bytes: Vec<u8>, ret: Ret<Result<(), Error>>) {
		ret!([ret], self.send_sealed(target, Kind::of_channel(channel), &bytes));
	}

	/// Send the same payload to several peers, gathering per-endpoint
	/// results into one completion.
	pub fn send_data_to_list(
		&mut self,
		_cx: CX![],
		targets: Vec<SocketAddr>,
		channel: ChannelNumber,
		bytes: Vec<u8>,
		ret: Ret<Vec<(SocketAddr, Result<(), Error>)>>,
	) {
		let results = targets
			.into_iter()
			.map(|target| (target, self.send_sealed(target, Kind::of_channel(channel), &bytes)))
			.collect();

		ret!([ret], results);
	}

	/// Send the same payload to every peer with an established session.
	pub fn send_data_to_all(&mut self, cx: CX![], channel: ChannelNumber, bytes: Vec<u8>, ret: Ret<Vec<(SocketAddr, Result<(), Error>)>>) {
		let targets = self.session_endpoints();
		self.send_data_to_list(cx, targets, channel, bytes, ret);
	}

	/// Ask `target` for the endpoints of the hosts owning the given
	/// certificates.
	pub fn send_contact_request(&mut self, _cx: CX![], target: SocketAddr, hashes: Vec<CertificateHash>, ret: Ret<Result<(), Error>>) {
		let mut plaintext = vec![0; hashes.len() * CertificateHash::SIZE];

		let result = crate::message::write_hash_list(&hashes, &mut plaintext)
			.and_then(|n| self.send_sealed(target, Kind::CONTACT_REQUEST, &plaintext[..n]));

		ret!([ret], result);
	}

	/// Tear down the session with `target`.
	pub fn close_session(&mut self, _cx: CX![], target: SocketAddr, ret: Ret<Result<(), Error>>) {
		if !self.open {
			ret!([ret], Err(Error::ServerOffline));
			return;
		}

		let lost = self.peers.get_mut(&target).is_some_and(PeerSession::clear);

		if !lost {
			ret!([ret], Err(Error::NoSessionForHost));
			return;
		}

		self.emit_session_lost(target, SessionLossReason::ManualTermination);
		ret!([ret], Ok(()))
	}

	/// Pre-seed or replace what is known about a remote identity.
	pub fn set_presentation(&mut self, _cx: CX![], target: SocketAddr, store: PresentationStore) {
		if !store.is_empty() {
			self.presentations.insert(target, store);
		}
	}

	/// Forget a remote identity.
	pub fn clear_presentation(&mut self, _cx: CX![], target: SocketAddr) {
		self.presentations.remove(&target);
	}

	pub fn has_presentation_for(&mut self, _cx: CX![], target: SocketAddr, ret: Ret<bool>) {
		ret!([ret], self.presentations.get(&target).is_some_and(|store| !store.is_empty()));
	}

	/// The endpoints with an established session.
	pub fn get_session_endpoints(&mut self, _cx: CX![], ret: Ret<Vec<SocketAddr>>) {
		ret!([ret], self.session_endpoints());
	}

	pub fn has_session_with(&mut self, _cx: CX![], target: SocketAddr, ret: Ret<bool>) {
		ret!([ret], self.peers.get(&target).is_some_and(PeerSession::has_current_session));
	}

	/// Replace the local identity and re-present it to every known peer.
	pub fn set_identity(&mut self, cx: CX![], identity: IdentityStore, ret: Ret<Vec<(SocketAddr, Result<(), Error>)>>) {
		self.identity = identity;
		self.reintroduce_to_all(cx, ret);
	}

	/// Shut the engine down: outstanding greets cancel, per-peer state is
	/// wiped and later operations fail with `ServerOffline`.
	pub fn close(&mut self, cx: CX![]) {
		if !mem::take(&mut self.open) {
			return;
		}

		for pending in self.greet.drain() {
			cx.timer_del(pending.timer);
			ret!([pending.ret], Err(Error::ServerOffline));
		}

		let endpoints: Vec<SocketAddr> = self.peers.keys().copied().collect();

		for endpoint in endpoints {
			if self.peers.get_mut(&endpoint).is_some_and(PeerSession::clear) {
				self.emit_session_lost(endpoint, SessionLossReason::ManualTermination);
			}
		}

		self.peers.clear();
	}

	// ---- Internals ----------------------------------------------------

	fn session_endpoints(&self) -> Vec<SocketAddr> {
		self.peers
			.iter()
			.filter(|(_, peer)| peer.has_current_session())
			.map(|(endpoint, _)| *endpoint)
			.collect()
	}

	/// Encode into the reusable send buffer and transmit.
	fn send(&mut self, to: SocketAddr, encode: impl FnOnce(&mut [u8]) -> Result<usize, Error>) -> Result<(), Error> {
		let mut buf = mem::take(&mut self.send_buffer);

		let result = encode(&mut buf).and_then(|n| {
			if !self.open {
				return Err(Error::ServerOffline);
			}

			self.link.send_to(to, &buf[..n]).map_err(Error::Io)
		});

		self.send_buffer = buf;
		result
	}

	/// Get-or-create the peer session for an endpoint.
	fn peer(&mut self, endpoint: SocketAddr, now: std::time::Instant) -> &mut PeerSession {
		self.peers.entry(endpoint).or_insert_with(|| PeerSession::new(&mut self.rng, now))
	}

	fn send_session_request(&mut self, cx: CX![], target: SocketAddr) -> Result<(), Error> {
		let now = cx.now();
		let peer = self.peer(target, now);

		let session_number = peer.next_session_number();
		let host_identifier = *peer.local_host_identifier();

		let cipher_suites: Vec<u8> = self.config.cipher_suites.iter().map(|suite| suite.id()).collect();
		let elliptic_curves: Vec<u8> = self.config.elliptic_curves.iter().map(|curve| curve.id()).collect();

		trace!("Sending SESSION_REQUEST to {target} (session number: {session_number})");

		let identity = &self.identity;
		let link = &self.link;
		let open = self.open;

		let mut buf = mem::take(&mut self.send_buffer);

		let result = crate::message::SessionRequest::encode(
			&mut buf,
			session_number,
			&host_identifier,
			&cipher_suites,
			&elliptic_curves,
			|span| identity.sign(span),
		)
		.and_then(|n| {
			if !open {
				return Err(Error::ServerOffline);
			}

			link.send_to(target, &buf[..n]).map_err(Error::Io)
		});

		self.send_buffer = buf;
		result
	}

	/// Emit a SESSION message carrying the given parameters.
	fn send_session(&mut self, target: SocketAddr, parameters: &SessionParameters) -> Result<(), Error> {
		trace!(
			"Sending SESSION to {target} (session number: {}, cipher suite: {}, elliptic curve: {})",
			parameters.session_number,
			parameters.cipher_suite,
			parameters.elliptic_curve
		);

		let host_identifier = match self.peers.get(&target) {
			Some(peer) => *peer.local_host_identifier(),
			None => return Err(Error::NoSessionForHost),
		};

		let identity = &self.identity;
		let link = &self.link;
		let open = self.open;

		let mut buf = mem::take(&mut self.send_buffer);

		let result = crate::message::SessionMessage::encode(
			&mut buf,
			parameters.session_number,
			&host_identifier,
			parameters.cipher_suite.id(),
			parameters.elliptic_curve.id(),
			&parameters.public_key,
			|span| identity.sign(span),
		)
		.and_then(|n| {
			if !open {
				return Err(Error::ServerOffline);
			}

			link.send_to(target, &buf[..n]).map_err(Error::Io)
		});

		self.send_buffer = buf;
		result
	}

	/// Prepare a follow-up session and announce it, keeping the current
	/// session carrying traffic until the peer's answer verifies.
	fn rekey(&mut self, target: SocketAddr) {
		let Some(peer) = self.peers.get_mut(&target) else {
			return;
		};

		let Some(current) = peer.current_session() else {
			return;
		};

		let session_number = peer.next_session_number();
		let cipher_suite = current.parameters().cipher_suite;
		let elliptic_curve = current.parameters().elliptic_curve;

		// An identical pending proposal means the announcement is already
		// out; do not churn the ECDHE state while waiting for the answer.
		if !peer.prepare_session(&mut self.rng, session_number, cipher_suite, elliptic_curve) {
			return;
		}

		log::info!("Session with {target} is old, renegotiating (session number: {session_number})");

		if let Some(parameters) = self.peers.get(&target).and_then(PeerSession::next_session_parameters) {
			let parameters = parameters.clone();

			if let Err(err) = self.send_session(target, &parameters) {
				warn!("Failed to announce the renegotiated session to {target}: {err}");
			}
		}
	}

	fn emit_session_lost(&mut self, endpoint: SocketAddr, reason: SessionLossReason) {
		trace!("Session with {endpoint} lost: {reason:?}");

		if let Some(handler) = &self.handlers.session_lost {
			fwd!([handler], SessionLost { endpoint, reason });
		}
	}

	// ---- Timers -------------------------------------------------------

	fn arm_keep_alive(&mut self, cx: CX![]) {
		let actor = cx.access_actor().clone();
		cx.after(self.config.keep_alive_period, move |s| actor.apply(s, |this, cx| this.keep_alive_tick(cx)));
	}

	/// Sweep every peer session: time out the dead, keep the rest alive.
	fn keep_alive_tick(&mut self, cx: CX![]) {
		if !self.open {
			return;
		}

		let now = cx.now();
		let endpoints: Vec<SocketAddr> = self.peers.keys().copied().collect();

		for endpoint in endpoints {
			let Some(peer) = self.peers.get_mut(&endpoint) else {
				continue;
			};

			if peer.has_timed_out(now, self.config.session_timeout) {
				if peer.clear() {
					self.emit_session_lost(endpoint, SessionLossReason::Timeout);
				}
			} else if peer.has_current_session() {
				let mut payload = [0; KEEP_ALIVE_DATA_SIZE];
				self.rng.fill(&mut payload);

				if let Err(err) = self.send_sealed(endpoint, Kind::KEEP_ALIVE, &payload) {
					trace!("Failed to send keep-alive to {endpoint}: {err}");
				}
			}
		}

		self.arm_keep_alive(cx);
	}

	fn arm_rate_limit(&mut self, cx: CX![]) {
		let actor = cx.access_actor().clone();
		cx.after(RATE_LIMIT_WINDOW, move |s| actor.apply(s, |this, cx| this.rate_limit_tick(cx)));
	}

	fn rate_limit_tick(&mut self, cx: CX![]) {
		if !self.open {
			return;
		}

		self.hello_counters.clear();
		self.presentation_counters.clear();
		self.arm_rate_limit(cx);
	}
}

/// Collapse IPv4-mapped addresses delivered through a dual-stack socket to
/// their native IPv4 form, so both views of a peer land on the same session.
fn normalize(endpoint: SocketAddr) -> SocketAddr {
	match endpoint {
		SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
			Some(v4) => SocketAddr::new(v4.into(), v6.port()),
			None => endpoint,
		},
		SocketAddr::V4(_) => endpoint,
	}
}

#[cfg(test)]
mod tests;

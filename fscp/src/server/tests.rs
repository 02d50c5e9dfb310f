use core::cell::RefCell;
use core::net::SocketAddr;
use core::time::Duration;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::Instant;

use stakker::{actor, fwd_do, ret_nop, ret_some_do, ActorOwn, Stakker};

use super::*;
use crate::identity::PreSharedKey;

type Queue = Rc<RefCell<VecDeque<(SocketAddr, Vec<u8>)>>>;

/// A link that records datagrams instead of hitting a socket.
struct TestLink {
	queue: Queue,
}

impl Link for TestLink {
	fn send_to(&self, to: SocketAddr, bytes: &[u8]) -> io::Result<()> {
		self.queue.borrow_mut().push_back((to, bytes.to_vec()));
		Ok(())
	}
}

type TestServer = Server<TestLink>;

/// Everything observed about one engine under test.
#[derive(Default)]
struct Observed {
	established: Vec<SessionEstablished>,
	lost: Vec<SessionLost>,
	failed: Vec<SessionFailed>,
	data: Vec<DataReceived>,
	contacts: Vec<ContactReceived>,
}

struct Node {
	actor: ActorOwn<TestServer>,
	queue: Queue,
	addr: SocketAddr,
	observed: Rc<RefCell<Observed>>,
}

fn psk_identity() -> IdentityStore {
	IdentityStore::new(None, None, Some(PreSharedKey::new(b"a shared secret".to_vec())))
}

fn handlers(observed: &Rc<RefCell<Observed>>) -> Handlers {
	let mut handlers = Handlers::default();

	let o = observed.clone();
	handlers.session_established = Some(fwd_do!(move |ev: SessionEstablished| o.borrow_mut().established.push(ev)));
	let o = observed.clone();
	handlers.session_lost = Some(fwd_do!(move |ev: SessionLost| o.borrow_mut().lost.push(ev)));
	let o = observed.clone();
	handlers.session_failed = Some(fwd_do!(move |ev: SessionFailed| o.borrow_mut().failed.push(ev)));
	let o = observed.clone();
	handlers.data_received = Some(fwd_do!(move |ev: DataReceived| o.borrow_mut().data.push(ev)));
	let o = observed.clone();
	handlers.contact_received = Some(fwd_do!(move |ev: ContactReceived| o.borrow_mut().contacts.push(ev)));

	handlers
}

fn node(s: &mut Stakker, addr: &str, identity: IdentityStore, config: ServerConfig) -> Node {
	let queue: Queue = Queue::default();
	let observed = Rc::new(RefCell::new(Observed::default()));

	let link = TestLink { queue: queue.clone() };
	let h = handlers(&observed);

	let actor = actor!(s, TestServer::with_link(link, identity, config, h), ret_nop!());

	Node {
		actor,
		queue,
		addr: addr.parse().unwrap(),
		observed,
	}
}

/// Move queued datagrams between the two nodes until the wire is silent.
fn pump(s: &mut Stakker, now: Instant, a: &Node, b: &Node) {
	loop {
		s.run(now, false);

		let mut moved = false;

		for (from, to) in [(a, b), (b, a)] {
			let queued: Vec<(SocketAddr, Vec<u8>)> = from.queue.borrow_mut().drain(..).collect();

			for (target, bytes) in queued {
				moved = true;

				if target == to.addr {
					let source = from.addr;
					to.actor.apply(s, move |this, cx| this.receive(cx, Datagram { from: source, bytes: bytes.into() }));
				}
			}
		}

		s.run(now, false);

		if !moved {
			return;
		}
	}
}

/// Run both sides through greet, presentation and session negotiation.
fn establish(s: &mut Stakker, now: Instant, a: &Node, b: &Node) {
	let b_addr = b.addr;
	let a_addr = a.addr;

	a.actor.apply(s, move |this, cx| {
		this.greet(cx, b_addr, Duration::from_secs(3), ret_some_do!(|result: Result<Duration, Error>| {
			result.unwrap();
		}));
	});
	pump(s, now, a, b);

	a.actor.apply(s, move |this, cx| this.introduce_to(cx, b_addr, ret_some_do!(|r: Result<(), Error>| r.unwrap())));
	b.actor.apply(s, move |this, cx| this.introduce_to(cx, a_addr, ret_some_do!(|r: Result<(), Error>| r.unwrap())));
	pump(s, now, a, b);

	a.actor.apply(s, move |this, cx| this.request_session(cx, b_addr, ret_some_do!(|r: Result<(), Error>| r.unwrap())));
	pump(s, now, a, b);

	assert_eq!(a.observed.borrow().established.len(), 1, "initiator establishes exactly once");
	assert_eq!(b.observed.borrow().established.len(), 1, "responder establishes exactly once");
}

fn send_data(s: &mut Stakker, node: &Node, to: SocketAddr, bytes: &[u8]) -> Rc<RefCell<Option<Result<(), Error>>>> {
	let slot = Rc::new(RefCell::new(None));
	let out = slot.clone();
	let bytes = bytes.to_vec();

	node.actor.apply(s, move |this, cx| {
		this.send_data(cx, to, ChannelNumber::ZERO, bytes, ret_some_do!(move |r: Result<(), Error>| *out.borrow_mut() = Some(r)));
	});

	slot
}

#[test]
fn two_peer_handshake() {
	let now = Instant::now();
	let mut stakker = Stakker::new(now);
	let s = &mut stakker;

	let a = node(s, "127.0.0.1:12000", psk_identity(), ServerConfig::default());
	let b = node(s, "127.0.0.1:12001", psk_identity(), ServerConfig::default());
	s.run(now, false);

	establish(s, now, &a, &b);

	for observed in [&a.observed, &b.observed] {
		let observed = observed.borrow();
		let ev = &observed.established[0];

		assert!(ev.is_new);
		assert_eq!(ev.cipher_suite, CipherSuite::EcdheRsaAes256GcmSha384);
		// sect571k1 has no backend, so the probe leaves secp384r1 first.
		assert_eq!(ev.elliptic_curve, EllipticCurve::Secp384r1);
	}
}

#[test]
fn data_flows_and_replays_are_rejected() {
	let now = Instant::now();
	let mut stakker = Stakker::new(now);
	let s = &mut stakker;

	let a = node(s, "127.0.0.1:12000", psk_identity(), ServerConfig::default());
	let b = node(s, "127.0.0.1:12001", psk_identity(), ServerConfig::default());
	s.run(now, false);
	establish(s, now, &a, &b);

	let result = send_data(s, &a, b.addr, b"frame one");
	s.run(now, false);
	assert!(result.borrow().as_ref().unwrap().is_ok());

	// Capture the datagram so it can be replayed later.
	let (to, bytes) = a.queue.borrow_mut().pop_front().unwrap();
	assert_eq!(to, b.addr);

	let (a_addr, replay) = (a.addr, bytes.clone());
	b.actor.apply(s, move |this, cx| this.receive(cx, Datagram { from: a_addr, bytes: bytes.into() }));
	s.run(now, false);

	{
		let observed = b.observed.borrow();
		assert_eq!(observed.data.len(), 1);
		assert_eq!(&*observed.data[0].bytes, b"frame one");
		assert_eq!(observed.data[0].channel, ChannelNumber::ZERO);
		assert_eq!(observed.data[0].endpoint, a.addr);
	}

	// Re-inject the captured datagram: decryption is not even attempted and
	// no second data event fires.
	let a_addr = a.addr;
	b.actor.apply(s, move |this, cx| this.receive(cx, Datagram { from: a_addr, bytes: replay.into() }));
	s.run(now, false);

	assert_eq!(b.observed.borrow().data.len(), 1);
}

#[test]
fn greet_times_out_without_a_responder() {
	let now = Instant::now();
	let mut stakker = Stakker::new(now);
	let s = &mut stakker;

	let a = node(s, "127.0.0.1:12000", psk_identity(), ServerConfig::default());
	s.run(now, false);

	let slot = Rc::new(RefCell::new(None));
	let out = slot.clone();

	let target: SocketAddr = "127.0.0.254:12000".parse().unwrap();
	a.actor.apply(s, move |this, cx| {
		this.greet(cx, target, Duration::ZERO, ret_some_do!(move |r: Result<Duration, Error>| *out.borrow_mut() = Some(r)));
	});

	s.run(now, false);

	assert!(matches!(*slot.borrow(), Some(Err(Error::HelloRequestTimedOut))));
	// The request itself did go out.
	assert_eq!(a.queue.borrow().len(), 1);
}

#[test]
fn greet_measures_the_round_trip() {
	let t0 = Instant::now();
	let mut stakker = Stakker::new(t0);
	let s = &mut stakker;

	let a = node(s, "127.0.0.1:12000", psk_identity(), ServerConfig::default());
	let b = node(s, "127.0.0.1:12001", psk_identity(), ServerConfig::default());
	s.run(t0, false);

	let slot = Rc::new(RefCell::new(None));
	let out = slot.clone();

	let b_addr = b.addr;
	a.actor.apply(s, move |this, cx| {
		this.greet(cx, b_addr, Duration::from_secs(3), ret_some_do!(move |r: Result<Duration, Error>| *out.borrow_mut() = Some(r)));
	});
	s.run(t0, false);

	// The response comes back 100ms later.
	let t1 = t0 + Duration::from_millis(100);
	pump(s, t1, &a, &b);

	let borrowed = slot.borrow();
	match &*borrowed {
		Some(Ok(rtt)) => assert_eq!(*rtt, Duration::from_millis(100)),
		other => panic!("expected a round-trip, got {other:?}"),
	}
}

#[test]
fn hello_rate_limit_holds_per_window() {
	let mut now = Instant::now();
	let mut stakker = Stakker::new(now);
	let s = &mut stakker;

	let b = node(s, "127.0.0.1:12001", psk_identity(), ServerConfig::default());
	s.run(now, false);

	let flooder: SocketAddr = "127.0.0.9:9999".parse().unwrap();

	let mut hello = |s: &mut Stakker, n: u32| {
		let mut buf = [0; 16];
		let len = Hello { unique_number: n }.encode_request(&mut buf).unwrap();
		let bytes = buf[..len].to_vec();

		b.actor.apply(s, move |this, cx| this.receive(cx, Datagram { from: flooder, bytes: bytes.into() }));
	};

	for n in 0..15 {
		hello(s, n);
	}
	s.run(now, false);

	// Only the configured limit is answered within the window.
	assert_eq!(b.queue.borrow().len(), 10);
	b.queue.borrow_mut().clear();

	// The reset timer reopens the window.
	now += RATE_LIMIT_WINDOW + Duration::from_millis(1);
	s.run(now, false);

	hello(s, 99);
	s.run(now, false);
	assert_eq!(b.queue.borrow().len(), 1);
}

#[test]
fn blocked_peer_times_out_and_sends_fail() {
	let t0 = Instant::now();
	let mut stakker = Stakker::new(t0);
	let s = &mut stakker;

	let a = node(s, "127.0.0.1:12000", psk_identity(), ServerConfig::default());
	let b = node(s, "127.0.0.1:12001", psk_identity(), ServerConfig::default());
	s.run(t0, false);
	establish(s, t0, &a, &b);

	// Block all packets from B: time passes, A's sweep fires keep-alives
	// into the void and finally tears the session down.
	let mut now = t0;

	for _ in 0..4 {
		now += Duration::from_secs(10);
		s.run(now, false);
		a.queue.borrow_mut().clear();
	}

	{
		let observed = a.observed.borrow();
		assert_eq!(observed.lost.len(), 1);
		assert_eq!(observed.lost[0].endpoint, b.addr);
		assert_eq!(observed.lost[0].reason, SessionLossReason::Timeout);
	}

	let result = send_data(s, &a, b.addr, b"too late");
	s.run(now, false);
	assert!(matches!(*result.borrow(), Some(Err(Error::NoSessionForHost))));
}

#[test]
fn old_session_rekeys_without_a_gap() {
	let now = Instant::now();
	let mut stakker = Stakker::new(now);
	let s = &mut stakker;

	let a = node(s, "127.0.0.1:12000", psk_identity(), ServerConfig::default());
	let b = node(s, "127.0.0.1:12001", psk_identity(), ServerConfig::default());
	s.run(now, false);
	establish(s, now, &a, &b);

	// Fast-forward the stream to just past half the sequence range.
	let b_addr = b.addr;
	a.actor.apply(s, move |this, _cx| {
		this.peers.get_mut(&b_addr).unwrap().force_local_sequence_number(u32::MAX / 2);
	});

	let result = send_data(s, &a, b.addr, b"the message that crosses the line");
	pump(s, now, &a, &b);
	assert!(result.borrow().as_ref().unwrap().is_ok());

	// The engine renegotiated behind the scenes.
	{
		let observed = a.observed.borrow();
		assert_eq!(observed.established.len(), 2);
		assert!(!observed.established[1].is_new);
	}

	// The payload arrived and the stream continues on the fresh session.
	assert_eq!(b.observed.borrow().data.len(), 1);

	let result = send_data(s, &a, b.addr, b"and one more");
	pump(s, now, &a, &b);
	assert!(result.borrow().as_ref().unwrap().is_ok());
	assert_eq!(b.observed.borrow().data.len(), 2);

	// The fresh session restarted its sequence numbers.
	let b_addr = b.addr;
	a.actor.apply(s, move |this, _cx| {
		let current = this.peers.get(&b_addr).unwrap().current_session().unwrap();
		assert!(!current.is_old());
	});
	s.run(now, false);
}

#[test]
fn close_session_is_manual_termination() {
	let now = Instant::now();
	let mut stakker = Stakker::new(now);
	let s = &mut stakker;

	let a = node(s, "127.0.0.1:12000", psk_identity(), ServerConfig::default());
	let b = node(s, "127.0.0.1:12001", psk_identity(), ServerConfig::default());
	s.run(now, false);
	establish(s, now, &a, &b);

	let b_addr = b.addr;
	a.actor.apply(s, move |this, cx| this.close_session(cx, b_addr, ret_some_do!(|r: Result<(), Error>| r.unwrap())));
	s.run(now, false);

	{
		let observed = a.observed.borrow();
		assert_eq!(observed.lost.len(), 1);
		assert_eq!(observed.lost[0].reason, SessionLossReason::ManualTermination);
	}

	// Closing again reports the absence.
	let slot = Rc::new(RefCell::new(None));
	let out = slot.clone();
	a.actor.apply(s, move |this, cx| {
		this.close_session(cx, b_addr, ret_some_do!(move |r: Result<(), Error>| *out.borrow_mut() = Some(r)));
	});
	s.run(now, false);
	assert!(matches!(*slot.borrow(), Some(Err(Error::NoSessionForHost))));
}

#[test]
fn mismatched_capabilities_fail_the_session() {
	let now = Instant::now();
	let mut stakker = Stakker::new(now);
	let s = &mut stakker;

	let mut config_a = ServerConfig::default();
	config_a.cipher_suites = vec![CipherSuite::EcdheRsaAes256GcmSha384];

	let mut config_b = ServerConfig::default();
	config_b.cipher_suites = vec![CipherSuite::EcdheRsaAes128GcmSha256];

	let a = node(s, "127.0.0.1:12000", psk_identity(), config_a);
	let b = node(s, "127.0.0.1:12001", psk_identity(), config_b);
	s.run(now, false);

	let (a_addr, b_addr) = (a.addr, b.addr);
	a.actor.apply(s, move |this, cx| this.introduce_to(cx, b_addr, ret_some_do!(|r: Result<(), Error>| r.unwrap())));
	b.actor.apply(s, move |this, cx| this.introduce_to(cx, a_addr, ret_some_do!(|r: Result<(), Error>| r.unwrap())));
	pump(s, now, &a, &b);

	a.actor.apply(s, move |this, cx| this.request_session(cx, b_addr, ret_some_do!(|r: Result<(), Error>| r.unwrap())));
	pump(s, now, &a, &b);

	let observed = b.observed.borrow();
	assert!(observed.established.is_empty());
	assert_eq!(observed.failed.len(), 1);
	assert!(observed.failed[0].is_new);
	assert_eq!(observed.failed[0].remote_cipher_suites, vec![CipherSuite::EcdheRsaAes256GcmSha384.id()]);
}

#[test]
fn presentation_status_classification() {
	let now = Instant::now();
	let mut stakker = Stakker::new(now);
	let s = &mut stakker;

	let statuses = Rc::new(RefCell::new(Vec::new()));

	let a = node(s, "127.0.0.1:12000", psk_identity(), ServerConfig::default());

	let queue: Queue = Queue::default();
	let observed = Rc::new(RefCell::new(Observed::default()));
	let mut h = handlers(&observed);

	let seen = statuses.clone();
	h.presentation_accept = Some(Box::new(move |_, _, status, _| {
		seen.borrow_mut().push(status);
		true
	}));

	let link = TestLink { queue: queue.clone() };
	let b = Node {
		actor: actor!(s, TestServer::with_link(link, psk_identity(), ServerConfig::default(), h), ret_nop!()),
		queue,
		addr: "127.0.0.1:12001".parse().unwrap(),
		observed,
	};
	s.run(now, false);

	let b_addr = b.addr;

	for _ in 0..2 {
		a.actor.apply(s, move |this, cx| this.introduce_to(cx, b_addr, ret_some_do!(|r: Result<(), Error>| r.unwrap())));
		pump(s, now, &a, &b);
	}

	assert_eq!(*statuses.borrow(), vec![PresentationStatus::First, PresentationStatus::Same]);
}

#[test]
fn close_cancels_outstanding_greets() {
	let now = Instant::now();
	let mut stakker = Stakker::new(now);
	let s = &mut stakker;

	let a = node(s, "127.0.0.1:12000", psk_identity(), ServerConfig::default());
	s.run(now, false);

	let slot = Rc::new(RefCell::new(None));
	let out = slot.clone();

	let target: SocketAddr = "127.0.0.254:12000".parse().unwrap();
	a.actor.apply(s, move |this, cx| {
		this.greet(cx, target, Duration::from_secs(60), ret_some_do!(move |r: Result<Duration, Error>| *out.borrow_mut() = Some(r)));
		this.close(cx);
	});
	s.run(now, false);

	assert!(matches!(*slot.borrow(), Some(Err(Error::ServerOffline))));

	// Later operations fail fast.
	let slot = Rc::new(RefCell::new(None));
	let out = slot.clone();
	a.actor.apply(s, move |this, cx| {
		this.request_session(cx, target, ret_some_do!(move |r: Result<(), Error>| *out.borrow_mut() = Some(r)));
	});
	s.run(now, false);
	assert!(matches!(*slot.borrow(), Some(Err(Error::ServerOffline))));
}

#[test]
fn contact_requests_resolve_known_certificates() {
	// Contact answers only advertise certificate-backed presentations, so
	// seed C's certificate into B's store out of band and have A ask B.
	let now = Instant::now();
	let mut stakker = Stakker::new(now);
	let s = &mut stakker;

	let a = node(s, "127.0.0.1:12000", psk_identity(), ServerConfig::default());
	let b = node(s, "127.0.0.1:12001", psk_identity(), ServerConfig::default());
	s.run(now, false);
	establish(s, now, &a, &b);

	let key = rsa::RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).unwrap();
	let certificate = Certificate::from_parts(b"third party".to_vec(), rsa::RsaPublicKey::from(&key));
	let hash = *certificate.digest();

	let c_addr: SocketAddr = "127.0.0.1:12002".parse().unwrap();
	b.actor.apply(s, move |this, cx| {
		this.set_presentation(cx, c_addr, PresentationStore::new(Some(certificate), None));
	});
	s.run(now, false);

	let b_addr = b.addr;
	a.actor.apply(s, move |this, cx| {
		this.send_contact_request(cx, b_addr, vec![hash], ret_some_do!(|r: Result<(), Error>| r.unwrap()));
	});
	pump(s, now, &a, &b);

	let observed = a.observed.borrow();
	assert_eq!(observed.contacts.len(), 1);
	assert_eq!(observed.contacts[0].hash, hash);
	assert_eq!(observed.contacts[0].contact, c_addr);
}

//! The FSCP secure channel: message codec, per-peer session state and the
//! protocol engine that drives discovery, identity presentation, session
//! negotiation, key rotation and authenticated data transport over UDP.

use core::fmt;
use core::hash::BuildHasherDefault;
use core::time::Duration;

use ahash::AHasher;
use rand::RngCore;

pub mod crypto;
pub mod identity;
pub mod message;
mod server;
mod session;

pub use server::{
	ContactReceived, DataReceived, Handlers, Link, PresentationStatus, Server, ServerConfig, SessionEstablished, SessionFailed, SessionLost,
	SessionLossReason,
};
pub use session::PeerSession;

/// The hash map type used for all endpoint-keyed tables.
pub(crate) type Map<K, V> = hashbrown::HashMap<K, V, BuildHasherDefault<AHasher>>;

/// The wire protocol version.
pub const PROTOCOL_VERSION: u8 = 3;

/// The AEAD tag length. Both supported suites are GCM-based.
pub const GCM_TAG_SIZE: usize = 16;

/// The per-direction nonce prefix length.
pub const NONCE_PREFIX_SIZE: usize = 8;

/// The random payload length of KEEP_ALIVE messages.
pub const KEEP_ALIVE_DATA_SIZE: usize = 32;

/// How often the engine sends keep-alives and sweeps for dead sessions.
pub const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(10);

/// A session with no sign of life for this long is torn down.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// The window over which per-endpoint HELLO and PRESENTATION counters run.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(10);

/// A session number. The initiator picks it; renegotiations must use a
/// strictly greater value than any prior session with the same peer.
pub type SessionNumber = u32;

/// A per-direction datagram sequence number.
pub type SequenceNumber = u32;

/// Errors surfaced through operation completions.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("the server is closed")]
	ServerOffline,
	#[error("a session already exists for this host")]
	SessionAlreadyExists,
	#[error("no session exists for this host")]
	NoSessionForHost,
	#[error("the hello request timed out")]
	HelloRequestTimedOut,
	#[error("malformed or unverifiable message")]
	MalformedMessage,
	#[error("the destination buffer is too small")]
	BufferTooSmall,
	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),
}

impl Error {
	/// Whether `other` names the same error kind, ignoring I/O details.
	pub fn is(&self, other: &Self) -> bool {
		core::mem::discriminant(self) == core::mem::discriminant(other)
	}
}

impl From<utils::bytes::Short> for Error {
	fn from(_: utils::bytes::Short) -> Self {
		Self::MalformedMessage
	}
}

impl From<utils::bytes::Full> for Error {
	fn from(_: utils::bytes::Full) -> Self {
		Self::BufferTooSmall
	}
}

/// A 32-byte tag generated randomly for each peer-session, used by the remote
/// side to detect a restarted peer presenting fresh parameters from a known
/// endpoint.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HostIdentifier(pub [u8; 32]);

impl HostIdentifier {
	pub const SIZE: usize = 32;

	pub fn random(rng: &mut impl RngCore) -> Self {
		let mut bytes = [0; 32];
		rng.fill_bytes(&mut bytes);
		Self(bytes)
	}

	#[inline]
	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}
}

impl fmt::Display for HostIdentifier {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		for b in &self.0 {
			write!(f, "{b:02x}")?;
		}

		Ok(())
	}
}

impl fmt::Debug for HostIdentifier {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

/// A channel tag multiplexed into the DATA message type byte, letting the
/// embedder route plaintext to different sinks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChannelNumber(u8);

impl ChannelNumber {
	pub const ZERO: Self = Self(0);

	/// Accepts 0 through 15.
	pub fn new(n: u8) -> Option<Self> {
		(n < 16).then_some(Self(n))
	}

	#[inline]
	pub fn value(self) -> u8 {
		self.0
	}
}

impl fmt::Display for ChannelNumber {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		self.0.fmt(f)
	}
}

//! Outstanding HELLO request bookkeeping.
//!
//! Each endpoint gets a context holding a unique-number counter (seeded
//! randomly so numbers do not collide across restarts) and the set of
//! pending requests. A pending request owns its timeout timer key, so
//! cancellation on reply or on engine close is a local operation.

use core::net::SocketAddr;
use core::time::Duration;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::Rng;
use stakker::{FixedTimerKey, Ret};

use crate::{Error, Map};

pub(super) struct Pending {
	pub ret: Ret<Result<Duration, Error>>,
	pub timer: FixedTimerKey,
	pub start: Instant,
}

#[derive(Default)]
struct Context {
	next_unique_number: Option<u32>,
	pending: Map<u32, Pending>,
}

/// All greet state, keyed by endpoint.
#[derive(Default)]
pub(super) struct Book {
	contexts: Map<SocketAddr, Context>,
}

impl Book {
	/// The unique number to use for the next request to `endpoint`.
	pub fn next_unique_number(&mut self, endpoint: SocketAddr, rng: &mut StdRng) -> u32 {
		let context = self.contexts.entry(endpoint).or_default();

		let current = match context.next_unique_number {
			Some(n) => n,
			None => rng.gen(),
		};

		context.next_unique_number = Some(current.wrapping_add(1));
		current
	}

	pub fn insert(&mut self, endpoint: SocketAddr, unique_number: u32, pending: Pending) {
		self.contexts.entry(endpoint).or_default().pending.insert(unique_number, pending);
	}

	/// Remove a pending request, either because its reply arrived or because
	/// it timed out.
	pub fn remove(&mut self, endpoint: SocketAddr, unique_number: u32) -> Option<Pending> {
		self.contexts.get_mut(&endpoint)?.pending.remove(&unique_number)
	}

	/// Take every pending request, for cancellation on engine close.
	pub fn drain(&mut self) -> Vec<Pending> {
		self.contexts
			.values_mut()
			.flat_map(|context| context.pending.drain().map(|(_, pending)| pending))
			.collect()
	}
}

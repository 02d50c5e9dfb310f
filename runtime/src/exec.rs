//! The event loop: one thread interleaving actor timers with the datagram
//! reactor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use stakker::Stakker;
use utils::error::*;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Owns the actor system and drives it, together with every socket
/// registered with the reactor, on the calling thread.
pub struct Runtime {
	stakker: Stakker,
}

impl Runtime {
	pub fn new() -> Self {
		// Anchor the wall clock to the monotonic clock at startup, so actors
		// and timers share one view of the current time.
		let mut stakker = Stakker::new(Instant::now());
		stakker.set_systime(Some(SystemTime::now()));

		Self { stakker }
	}

	/// Access the actor system, for creating actors before (or while)
	/// running.
	pub fn stakker(&mut self) -> &mut Stakker {
		&mut self.stakker
	}

	/// Run until an interrupt arrives, the actor system shuts down, or
	/// there is nothing left to wait on.
	///
	/// `shutdown` fires once when the loop is about to stop on an interrupt
	/// or a reactor failure; the embedder closes its engine there, and the
	/// queue is drained one last time so session teardown still runs.
	pub fn run(mut self, shutdown: impl FnOnce()) -> Result {
		ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed))
			.map_err(|err| log::error!("Failed to install the interrupt handler: {err}"))?;

		let mut now = Instant::now();
		let mut idle_work = self.stakker.run(now, false);

		while self.stakker.not_shutdown() {
			if INTERRUPTED.load(Ordering::Relaxed) {
				log::info!("Interrupted, shutting down");
				self.stop(now, shutdown);
				return Ok(());
			}

			// With idle-priority work queued, only pick up datagrams that
			// are already waiting; otherwise sleep until the next timer is
			// due.
			let timeout = match idle_work {
				true => Some(Duration::ZERO),
				false => self.stakker.next_wait(now),
			};

			if timeout.is_none() && !crate::sockets_registered() {
				// No timer to wait for and no socket to watch.
				return Ok(());
			}

			let Ok(ready) = crate::poll_sockets(timeout) else {
				self.stop(now, shutdown);
				return Err(());
			};

			now = Instant::now();
			// Run the main queue; give the spare cycle to idle work only if
			// no datagram got in ahead of it.
			idle_work = self.stakker.run(now, idle_work && !ready);
		}

		Ok(())
	}

	fn stop(&mut self, now: Instant, shutdown: impl FnOnce()) {
		shutdown();
		self.stakker.run(now, false);
	}
}

impl Default for Runtime {
	fn default() -> Self {
		Self::new()
	}
}

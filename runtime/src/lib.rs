extern crate alloc;

use alloc::collections::VecDeque;
use core::cell::RefCell;
use core::net::SocketAddr;
use core::time::Duration;
use std::io::{self, ErrorKind};
use std::net::UdpSocket;

use log::{error, trace};
use stakker::Fwd;

mod exec;
mod logger;

pub use exec::Runtime;
pub use logger::Logger;

#[cfg(target_family = "unix")]
mod sys {
	pub use std::os::fd::{AsRawFd, RawFd};

	pub use libc::{poll, pollfd as Poll, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_fd()
	}
}

#[cfg(target_family = "windows")]
mod sys {
	pub use std::os::windows::io::AsRawSocket as AsRawFd;

	pub use windows_sys::Win32::Networking::WinSock::{
		WSAPoll as poll, POLLERR, POLLHUP, POLLNVAL, POLLRDNORM as POLLIN, POLLWRNORM as POLLOUT, SOCKET as RawFd, WSAPOLLFD as Poll,
	};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_socket() as _
	}
}

pub use sys::AsRawFd;
use sys::*;
use utils::error::*;

/// The receive buffer size. Incoming datagrams larger than this are truncated
/// by the kernel and will fail to parse downstream.
pub const RECV_BUFFER_SIZE: usize = 65536;

/// A datagram received from the network, tagged with its source endpoint.
pub struct Datagram {
	pub from: SocketAddr,
	pub bytes: Box<[u8]>,
}

fn as_timeout(t: Option<Duration>) -> i32 {
	t.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

thread_local! {
	static GLOBAL: RefCell<State> = const {
		RefCell::new(State {
			fds: Vec::new(),
			entries: Vec::new()
		})
	};
}

struct State {
	fds: Vec<Poll>,
	entries: Vec<Entry>,
}

impl State {
	fn with<X, F: FnOnce(&mut Self) -> X>(f: F) -> X {
		GLOBAL.with(|x| f(&mut x.borrow_mut()))
	}

	fn idx_of(&mut self, socket: &UdpSocket) -> usize {
		let raw = as_raw(socket);
		self.fds.iter().position(|f| f.fd == raw).expect("Socket is present")
	}

	/// Returns whether any more I/O is waiting.
	fn is_io(&self) -> bool {
		!self.fds.is_empty()
	}

	/// Poll the fds. Returns whether any file descriptors are ready for I/O.
	fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
		let ret = unsafe {
			poll(
				self.fds.as_mut_ptr(),
				self.fds.len().try_into().expect("Fewer than u32::MAX fds"),
				as_timeout(timeout),
			)
		};

		let mut pending: u32 = ret.try_into().map_err(|_| error!("poll() failed: {}", io::Error::last_os_error()))?;

		if pending == 0 {
			return Ok(false);
		}

		for idx in 0.. {
			let Poll { events, revents, .. } = &mut self.fds[idx];
			let entry = &mut self.entries[idx];

			if *revents == 0 {
				continue;
			}

			if *revents & (POLLERR | POLLHUP | POLLNVAL) != 0 {
				// An asynchronous socket error (e.g. a routing failure
				// reported via ICMP). Drain it and carry on; the datagram it
				// concerns is already lost.
				match entry.socket.take_error() {
					Ok(Some(err)) => error!("Asynchronous socket error: {err}"),
					_ => error!("Socket signalled an error condition while polling"),
				}
			}

			if *revents & POLLIN != 0 {
				entry.flush_read()?;
			}

			if *revents & POLLOUT != 0 {
				entry.flush_write()?;
			};

			*events = POLLIN;

			if !entry.queue.is_empty() {
				*events |= POLLOUT;
			}

			*revents = 0;

			pending -= 1;

			if pending == 0 {
				break;
			}
		}

		Ok(true)
	}
}

/// Whether any sockets are registered with the reactor.
pub(crate) fn sockets_registered() -> bool {
	State::with(|state| state.is_io())
}

/// Poll the registered sockets once, dispatching reads and draining write
/// queues. Returns whether any socket was ready.
pub(crate) fn poll_sockets(timeout: Option<Duration>) -> Result<bool> {
	State::with(|state| state.poll(timeout))
}

struct Entry {
	socket: UdpSocket,
	fwd: Fwd<Datagram>,
	queue: VecDeque<(SocketAddr, Box<[u8]>)>,
}

impl Entry {
	fn flush_read(&mut self) -> Result {
		let mut buf = vec![0; RECV_BUFFER_SIZE];

		loop {
			match self.socket.recv_from(&mut buf) {
				Ok((n, from)) => self.fwd.fwd(Datagram { from, bytes: buf[..n].into() }),
				Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
				Err(err) => {
					error!("Failed to receive datagram: {err}");
					return Err(());
				}
			}
		}
	}

	fn flush_write(&mut self) -> Result {
		while let Some((to, bytes)) = self.queue.back() {
			match self.socket.send_to(bytes, *to) {
				Ok(_) => {
					self.queue.pop_back();
				}
				Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
				Err(err) => {
					// Drop the queued datagram; UDP gives no delivery
					// guarantee, so the peer protocol must cope anyway.
					trace!("Discarding queued datagram to {to}: {err}");
					self.queue.pop_back();
				}
			}
		}

		Ok(())
	}
}

/// A non-blocking UDP socket registered with the thread's poll loop.
///
/// Received datagrams are forwarded together with their source endpoint.
/// Writes that would block are queued and drained in FIFO order when the
/// socket becomes writable again.
pub struct Io {
	socket: UdpSocket,
}

impl Io {
	pub fn new(socket: UdpSocket, fwd: Fwd<Datagram>) -> io::Result<Self> {
		socket.set_nonblocking(true)?;

		let queue_socket = socket.try_clone()?;

		State::with(|i| {
			i.fds.push(Poll { fd: as_raw(&socket), events: POLLIN, revents: 0 });

			i.entries.push(Entry { socket: queue_socket, fwd, queue: VecDeque::new() });
		});

		Ok(Self { socket })
	}

	pub fn local_addr(&self) -> io::Result<SocketAddr> {
		self.socket.local_addr()
	}

	/// Send one datagram to `to`, queueing it if the socket is not ready.
	pub fn send_to(&self, to: SocketAddr, bytes: &[u8]) -> io::Result<()> {
		match self.socket.send_to(bytes, to) {
			Ok(n) if n == bytes.len() => Ok(()),
			Ok(n) => Err(io::Error::new(ErrorKind::Other, format!("sent {n}/{} bytes", bytes.len()))),
			Err(err) if err.kind() == ErrorKind::WouldBlock => {
				State::with(|i| {
					let idx = i.idx_of(&self.socket);
					i.entries[idx].queue.push_front((to, bytes.into()));
					i.fds[idx].events |= POLLOUT;
				});

				Ok(())
			}
			Err(err) => Err(err),
		}
	}
}

impl Drop for Io {
	fn drop(&mut self) {
		State::with(|i| {
			let idx = i.idx_of(&self.socket);
			i.entries.swap_remove(idx);
			i.fds.swap_remove(idx);
		})
	}
}

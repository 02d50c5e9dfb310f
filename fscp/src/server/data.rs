//! The sealed data channel: DATA_0..DATA_15, CONTACT_REQUEST, CONTACT and
//! KEEP_ALIVE.

use core::net::SocketAddr;

use log::trace;
use stakker::{fwd, CX};

use super::{ContactReceived, DataReceived, Link, Server};
use crate::identity::CertificateHash;
use crate::message::{self, Data, Kind};
use crate::Error;

impl<L: Link> Server<L> {
	/// Seal `plaintext` with the current session's send key under a freshly
	/// incremented sequence number and transmit it as `kind`.
	pub(super) fn send_sealed(&mut self, target: SocketAddr, kind: Kind, plaintext: &[u8]) -> Result<(), Error> {
		if !self.open {
			return Err(Error::ServerOffline);
		}

		let Some(peer) = self.peers.get_mut(&target) else {
			return Err(Error::NoSessionForHost);
		};

		let Some(sequence_number) = peer.increment_local_sequence_number() else {
			return Err(Error::NoSessionForHost);
		};

		let current = peer.current_session().expect("a sequence number implies a current session");

		let mut scratch = plaintext.to_vec();
		let tag = current.seal(sequence_number, &mut scratch);

		let message = Data {
			sequence_number,
			tag,
			ciphertext: &scratch,
		};

		let link = &self.link;
		let mut buf = core::mem::take(&mut self.send_buffer);

		let result = message.encode(kind, &mut buf).and_then(|n| link.send_to(target, &buf[..n]).map_err(Error::Io));

		self.send_buffer = buf;
		result?;

		// Renegotiate before the sequence number can wrap.
		if self.peers.get(&target).and_then(|peer| peer.current_session()).is_some_and(|current| current.is_old()) {
			self.rekey(target);
		}

		Ok(())
	}

	pub(super) fn handle_data(&mut self, cx: CX![], from: SocketAddr, kind: Kind, data: Data) -> Result<(), Error> {
		let Some(peer) = self.peers.get_mut(&from) else {
			trace!("Received a data message from {from} but no session exists. Ignoring.");
			return Ok(());
		};

		let Some(current) = peer.current_session() else {
			trace!("Received a data message from {from} but no session exists. Ignoring.");
			return Ok(());
		};

		// Replays and reorderings are rejected before any crypto runs.
		if data.sequence_number <= current.remote_sequence_number() {
			trace!(
				"Received a data message from {from} with an outdated sequence number ({} <= {}). Ignoring.",
				data.sequence_number,
				current.remote_sequence_number()
			);
			return Ok(());
		}

		let mut plaintext = data.ciphertext.to_vec();
		current.open(data.sequence_number, &mut plaintext, &data.tag)?;

		peer.set_remote_sequence_number(data.sequence_number);
		peer.keep_alive(cx.now());

		let rekey = peer.current_session().is_some_and(|current| current.is_old());

		if rekey {
			self.rekey(from);
		}

		match kind {
			Kind::KEEP_ALIVE => Ok(()),
			Kind::CONTACT_REQUEST => {
				let hashes = message::parse_hash_list(&plaintext)?;
				self.handle_contact_request(from, hashes)
			}
			Kind::CONTACT => {
				for (hash, contact) in message::parse_contact_map(&plaintext)? {
					trace!("Received a contact for {hash} from {from}: {contact}");

					if let Some(handler) = &self.handlers.contact_received {
						fwd!([handler], ContactReceived { endpoint: from, hash, contact });
					}
				}

				Ok(())
			}
			kind => {
				let channel = kind.channel().ok_or(Error::MalformedMessage)?;

				if let Some(handler) = &self.handlers.data_received {
					fwd!(
						[handler],
						DataReceived {
							endpoint: from,
							channel,
							bytes: plaintext.into_boxed_slice(),
						}
					);
				}

				Ok(())
			}
		}
	}

	/// Answer a CONTACT_REQUEST with the endpoints of the requested
	/// certificates, as far as the presentation stores know them. Hosts
	/// known only by PSK are never advertised.
	fn handle_contact_request(&mut self, from: SocketAddr, hashes: Vec<CertificateHash>) -> Result<(), Error> {
		let mut contacts = Vec::new();

		for hash in hashes {
			for (endpoint, store) in &self.presentations {
				// Do not tell a host about itself.
				if *endpoint == from {
					continue;
				}

				let Some(certificate) = store.certificate() else {
					continue;
				};

				if *certificate.digest() != hash {
					continue;
				}

				let mut allow = true;

				if let Some(accept) = &mut self.handlers.contact_request_accept {
					allow = accept(from, certificate, &hash, *endpoint);
				}

				if allow {
					contacts.push((hash, *endpoint));
				}
			}
		}

		if contacts.is_empty() {
			return Ok(());
		}

		trace!("Answering a CONTACT_REQUEST from {from} with {} endpoint(s)", contacts.len());

		let mut plaintext = vec![0; contacts.len() * (CertificateHash::SIZE + 1 + 16 + 2)];
		let n = message::write_contact_map(&contacts, &mut plaintext)?;

		self.send_sealed(from, Kind::CONTACT, &plaintext[..n])
	}
}

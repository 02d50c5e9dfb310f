//! Ports and write-result gathering.

use core::cell::RefCell;
use core::mem;
use std::rc::Rc;

use stakker::{ret, ret_do, Fwd, Ret};
use utils::error::Result;

/// An opaque index naming a registered port.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PortIndex(pub u32);

/// Ports in the same group are not forwarded to each other unless relay mode
/// is enabled.
pub type Group = u32;

/// A frame sink. The payload is shared, so flooding one frame to many ports
/// does not copy it; the `Ret` reports the outcome of the write.
pub struct Port {
	pub write: Fwd<(Rc<[u8]>, Ret<Result>)>,
	pub group: Group,
}

struct Inner {
	pending: usize,
	results: Vec<(PortIndex, Result)>,
	ret: Option<Ret<Vec<(PortIndex, Result)>>>,
}

/// Aggregates per-port write completions into a single multi-endpoint
/// completion. A slot whose `Ret` is dropped without firing counts as a
/// failed write.
pub struct Gatherer {
	inner: Rc<RefCell<Inner>>,
}

impl Gatherer {
	/// With no targets at all, the completion fires immediately with an
	/// empty result set.
	pub fn new(ret: Ret<Vec<(PortIndex, Result)>>, targets: usize) -> Self {
		if targets == 0 {
			ret!([ret], Vec::new());

			return Self {
				inner: Rc::new(RefCell::new(Inner { pending: 0, results: Vec::new(), ret: None })),
			};
		}

		Self {
			inner: Rc::new(RefCell::new(Inner {
				pending: targets,
				results: Vec::with_capacity(targets),
				ret: Some(ret),
			})),
		}
	}

	/// A completion slot for one target port.
	pub fn slot(&self, index: PortIndex) -> Ret<Result> {
		let inner = self.inner.clone();

		ret_do!(move |result: Option<Result>| {
			let mut inner = inner.borrow_mut();

			inner.results.push((index, result.unwrap_or(Err(()))));
			inner.pending -= 1;

			if inner.pending == 0 {
				let results = mem::take(&mut inner.results);

				if let Some(ret) = inner.ret.take() {
					ret!([ret], results);
				}
			}
		})
	}
}

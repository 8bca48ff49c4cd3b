//! Tracks every bound downstream watch by the identity of the request that
//! opened it, independent of which aggregated key it currently maps to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use relay_core::ErrorKind;
use relay_xds::{Request, Response};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(Uuid);

impl WatchId {
	fn new() -> Self {
		WatchId(Uuid::new_v4())
	}
}

impl std::fmt::Display for WatchId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// What gets pushed down a watch's channel: a new response, or a terminal
/// error after which the watch is tombstoned and no further sends occur.
pub enum Delivery {
	Response(Arc<Response>),
	Terminal(ErrorKind),
}

const OPEN: u8 = 0;
const CLOSED: u8 = 1;

/// A single bound watch. Cloning shares the same underlying channel and
/// tombstone flag — every clone observes the same close.
#[derive(Clone)]
pub struct Watch {
	id: WatchId,
	request: Request,
	sink: mpsc::Sender<Delivery>,
	closed: Arc<AtomicU8>,
}

impl Watch {
	pub fn id(&self) -> WatchId {
		self.id
	}

	pub fn request(&self) -> &Request {
		&self.request
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire) == CLOSED
	}

	/// Non-blocking delivery: a full channel means the consumer isn't
	/// keeping up, and the watch is tombstoned rather than left to block
	/// the sender (spec's "no watch blocks another" invariant).
	pub fn deliver(&self, response: Arc<Response>) -> Result<(), ErrorKind> {
		self.send(Delivery::Response(response))
	}

	pub fn close(&self, reason: ErrorKind) {
		if self.closed.swap(CLOSED, Ordering::AcqRel) == OPEN {
			let _ = self.sink.try_send(Delivery::Terminal(reason));
		}
	}

	fn send(&self, msg: Delivery) -> Result<(), ErrorKind> {
		if self.is_closed() {
			return Err(ErrorKind::Shutdown);
		}
		match self.sink.try_send(msg) {
			Ok(()) => Ok(()),
			Err(mpsc::error::TrySendError::Full(_)) => {
				self.closed.store(CLOSED, Ordering::Release);
				Err(ErrorKind::SlowConsumer)
			},
			Err(mpsc::error::TrySendError::Closed(_)) => {
				self.closed.store(CLOSED, Ordering::Release);
				Err(ErrorKind::Shutdown)
			},
		}
	}
}

struct Inner {
	by_request: HashMap<Request, WatchId>,
	by_id: HashMap<WatchId, Watch>,
}

/// Registry of all currently bound downstream watches. A single mutex
/// guards both indices so `create`'s tombstone-and-replace step is atomic
/// with respect to concurrent `get`/`delete` callers (mirrors the single
/// `responseMap` in the original's `downstreamResponseMap`).
pub struct DownstreamRegistry {
	inner: Mutex<Inner>,
	channel_capacity: usize,
}

impl Default for DownstreamRegistry {
	fn default() -> Self {
		Self::new(16)
	}
}

impl DownstreamRegistry {
	pub fn new(channel_capacity: usize) -> Self {
		DownstreamRegistry {
			inner: Mutex::new(Inner { by_request: HashMap::new(), by_id: HashMap::new() }),
			channel_capacity,
		}
	}

	/// Registers a new watch for `request`. If one already exists for the
	/// same request identity, it is tombstoned and replaced — this models a
	/// client re-sending the same request on a fresh stream.
	pub fn create(&self, request: Request) -> (Watch, mpsc::Receiver<Delivery>) {
		let (tx, rx) = mpsc::channel(self.channel_capacity);
		let watch = Watch { id: WatchId::new(), request: request.clone(), sink: tx, closed: Arc::new(AtomicU8::new(OPEN)) };

		let mut inner = self.inner.lock();
		if let Some(old_id) = inner.by_request.insert(request, watch.id) {
			if let Some(old) = inner.by_id.remove(&old_id) {
				debug!(watch = %old_id, "tombstoning superseded watch");
				old.close(ErrorKind::Shutdown);
			}
		}
		inner.by_id.insert(watch.id, watch.clone());
		(watch, rx)
	}

	pub fn get_by_request(&self, request: &Request) -> Option<Watch> {
		let inner = self.inner.lock();
		let id = inner.by_request.get(request)?;
		inner.by_id.get(id).cloned()
	}

	pub fn get_by_id(&self, id: WatchId) -> Option<Watch> {
		self.inner.lock().by_id.get(&id).cloned()
	}

	pub fn delete(&self, request: &Request) {
		let mut inner = self.inner.lock();
		if let Some(id) = inner.by_request.remove(request) {
			if let Some(watch) = inner.by_id.remove(&id) {
				watch.close(ErrorKind::Shutdown);
			}
		}
	}

	pub fn delete_by_id(&self, id: WatchId) {
		let mut inner = self.inner.lock();
		if let Some(watch) = inner.by_id.remove(&id) {
			inner.by_request.remove(&watch.request);
			watch.close(ErrorKind::Shutdown);
		}
	}

	/// Removes every request present in `requests`, leaving the rest intact.
	pub fn delete_all(&self, requests: &[Request]) {
		let mut inner = self.inner.lock();
		for request in requests {
			if let Some(id) = inner.by_request.remove(request) {
				if let Some(watch) = inner.by_id.remove(&id) {
					watch.close(ErrorKind::Shutdown);
				}
			}
		}
	}

	pub fn len(&self) -> usize {
		self.inner.lock().by_id.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::warn;

use crate::http::exchange::{MockedResponse, ParsedRequest, RequestHead};

/// Per-subscriber queue soft cap. Delivery never blocks request handling;
/// instead a subscriber that falls this far behind starts losing its oldest
/// events, with a one-shot warning.
const QUEUE_SOFT_CAP: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
	/// Request line and headers parsed; body not yet read.
	RequestInitiated,
	/// Request fully read (body captured up to the configured cap).
	Request,
	/// A response was produced. The only success terminal.
	Response,
	/// The exchange ended without a response (socket action, cancellation).
	Abort,
	/// TLS handshake failed, including zero-byte connections.
	TlsClientError,
	/// Protocol-level client error (malformed request, early disconnect).
	ClientError,
}

#[derive(Debug, Clone)]
pub struct AbortedRequest {
	pub request: Option<Arc<RequestHead>>,
	pub reason: String,
}

#[derive(Debug, Clone)]
pub struct TlsClientFailure {
	pub peer: Option<SocketAddr>,
	pub server_name: Option<String>,
	pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ClientFailure {
	pub peer: Option<SocketAddr>,
	pub reason: String,
}

#[derive(Debug, Clone)]
pub enum Event {
	RequestInitiated(Arc<RequestHead>),
	Request(Arc<ParsedRequest>),
	Response(Arc<MockedResponse>),
	Abort(Arc<AbortedRequest>),
	TlsClientError(Arc<TlsClientFailure>),
	ClientError(Arc<ClientFailure>),
}

impl Event {
	pub fn kind(&self) -> EventKind {
		match self {
			Event::RequestInitiated(_) => EventKind::RequestInitiated,
			Event::Request(_) => EventKind::Request,
			Event::Response(_) => EventKind::Response,
			Event::Abort(_) => EventKind::Abort,
			Event::TlsClientError(_) => EventKind::TlsClientError,
			Event::ClientError(_) => EventKind::ClientError,
		}
	}
}

#[derive(Default)]
struct QueueState {
	items: VecDeque<Event>,
	closed: bool,
	warned: bool,
}

struct SubscriberQueue {
	kind: EventKind,
	state: Mutex<QueueState>,
	notify: Notify,
}

impl SubscriberQueue {
	fn push(&self, event: Event) {
		let mut st = self.state.lock();
		if st.closed {
			return;
		}
		if st.items.len() >= QUEUE_SOFT_CAP {
			st.items.pop_front();
			if !st.warned {
				st.warned = true;
				warn!(kind = ?self.kind, "event subscriber fell behind; dropping oldest events");
			}
		}
		st.items.push_back(event);
		drop(st);
		self.notify.notify_one();
	}

	fn close(&self) {
		self.state.lock().closed = true;
		self.notify.notify_one();
	}
}

/// Fans lifecycle events out to subscribers. Each subscriber owns a FIFO
/// queue (single producer, single consumer); publication is synchronous with
/// the pipeline so an event is enqueued before the corresponding bytes are
/// flushed, while consumption is fully decoupled.
#[derive(Default)]
pub(crate) struct EventBus {
	subs: RwLock<Vec<Arc<SubscriberQueue>>>,
}

impl EventBus {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a subscriber. Once this returns, every later `publish` of a
	/// matching event reaches the subscription.
	pub fn subscribe(&self, kind: EventKind) -> EventSubscription {
		let q = Arc::new(SubscriberQueue {
			kind,
			state: Mutex::new(QueueState::default()),
			notify: Notify::new(),
		});
		let mut subs = self.subs.write();
		subs.retain(|s| !s.state.lock().closed);
		subs.push(q.clone());
		EventSubscription { q }
	}

	pub fn publish(&self, event: Event) {
		let kind = event.kind();
		let subs = self.subs.read();
		for sub in subs.iter().filter(|s| s.kind == kind) {
			sub.push(event.clone());
		}
	}

	/// Ends every subscription; pending events stay readable, then `recv`
	/// returns `None`.
	pub fn close_all(&self) {
		for sub in self.subs.read().iter() {
			sub.close();
		}
	}
}

/// Receiving half handed to the caller by `subscribe`.
pub struct EventSubscription {
	q: Arc<SubscriberQueue>,
}

impl EventSubscription {
	/// Next event, in publication order. `None` once the server stopped and
	/// the queue drained.
	pub async fn recv(&mut self) -> Option<Event> {
		loop {
			let notified = self.q.notify.notified();
			{
				let mut st = self.q.state.lock();
				if let Some(e) = st.items.pop_front() {
					// Leave a wakeup for any remaining items.
					if !st.items.is_empty() {
						self.q.notify.notify_one();
					}
					return Some(e);
				}
				if st.closed {
					return None;
				}
			}
			notified.await;
		}
	}

	pub fn kind(&self) -> EventKind {
		self.q.kind
	}
}

impl Drop for EventSubscription {
	fn drop(&mut self) {
		self.q.close();
	}
}

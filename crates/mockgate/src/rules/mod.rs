pub mod builder;
pub mod dispatch;
pub mod endpoint;
pub mod handler;
pub mod matcher;
pub mod store;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::http::StatusCode;
use crate::http::exchange::ParsedRequest;
pub use handler::{Handler, WsHandler};
pub use matcher::Matcher;

/// Opaque unique rule identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleId(Uuid);

impl RuleId {
	fn new() -> Self {
		RuleId(Uuid::new_v4())
	}
}

impl std::fmt::Display for RuleId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.0.fmt(f)
	}
}

/// An immutable rule: a matcher, an optional completion limit, and the
/// handler that produces the response. Generic over the handler kind so HTTP
/// and WebSocket rules share the machinery.
#[derive(Debug, Clone)]
pub struct RuleSpec<H> {
	pub id: RuleId,
	pub matcher: Matcher,
	pub limit: Option<u64>,
	pub handler: H,
}

pub type Rule = RuleSpec<Handler>;
pub type WsRule = RuleSpec<WsHandler>;

impl<H> RuleSpec<H> {
	pub fn new(matcher: Matcher, handler: H) -> Self {
		RuleSpec {
			id: RuleId::new(),
			matcher,
			limit: None,
			handler,
		}
	}

	pub fn with_limit(mut self, limit: u64) -> Self {
		self.limit = Some(limit);
		self
	}
}

/// One recorded exchange on a rule, kept while `record_traffic` is on.
#[derive(Debug, Clone)]
pub struct SeenExchange {
	pub request: Arc<ParsedRequest>,
	/// `None` when the exchange ended without a response.
	pub status: Option<StatusCode>,
}

/// Shared mutable state of a registered rule: the invocation counter the
/// dispatcher claims against, and the seen-traffic log. Endpoint handles keep
/// the allocation alive after the rule leaves the store, freezing the
/// counters at their last values.
#[derive(Debug)]
pub struct RuleState<H> {
	pub spec: RuleSpec<H>,
	invocations: AtomicU64,
	seen: Mutex<Vec<SeenExchange>>,
}

impl<H> RuleState<H> {
	pub fn new(spec: RuleSpec<H>) -> Arc<Self> {
		Arc::new(RuleState {
			spec,
			invocations: AtomicU64::new(0),
			seen: Mutex::new(vec![]),
		})
	}

	/// Atomically claims one invocation slot. Concurrent claimers may both
	/// see spare capacity; the increment decides who gets the last slot and
	/// the loser falls through to the next rule.
	pub fn try_claim(&self) -> bool {
		match self.spec.limit {
			None => {
				self.invocations.fetch_add(1, Ordering::SeqCst);
				true
			},
			Some(limit) => self
				.invocations
				.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
					(n < limit).then_some(n + 1)
				})
				.is_ok(),
		}
	}

	pub fn has_capacity(&self) -> bool {
		match self.spec.limit {
			None => true,
			Some(limit) => self.invocations.load(Ordering::SeqCst) < limit,
		}
	}

	pub fn invocations(&self) -> u64 {
		self.invocations.load(Ordering::SeqCst)
	}

	/// Pending means the rule still expects traffic: a limited rule until its
	/// limit is consumed, an unlimited one until its first match.
	pub fn is_pending(&self) -> bool {
		let n = self.invocations();
		match self.spec.limit {
			Some(limit) => n < limit,
			None => n == 0,
		}
	}

	pub fn record(&self, request: Arc<ParsedRequest>, status: Option<StatusCode>) {
		self.seen.lock().push(SeenExchange { request, status });
	}

	pub fn seen(&self) -> Vec<SeenExchange> {
		self.seen.lock().clone()
	}

	pub fn reset_counters(&self) {
		self.invocations.store(0, Ordering::SeqCst);
		self.seen.lock().clear();
	}
}

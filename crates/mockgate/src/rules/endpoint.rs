use std::sync::Arc;

use crate::http::exchange::ParsedRequest;
use crate::rules::{RuleId, RuleState, SeenExchange};

/// Observer surface an endpoint handle needs, independent of the handler
/// kind.
pub(crate) trait EndpointState: Send + Sync {
	fn id(&self) -> RuleId;
	fn invocations(&self) -> u64;
	fn is_pending(&self) -> bool;
	fn seen(&self) -> Vec<SeenExchange>;
}

impl<H: Send + Sync> EndpointState for RuleState<H> {
	fn id(&self) -> RuleId {
		self.spec.id
	}

	fn invocations(&self) -> u64 {
		RuleState::invocations(self)
	}

	fn is_pending(&self) -> bool {
		RuleState::is_pending(self)
	}

	fn seen(&self) -> Vec<SeenExchange> {
		RuleState::seen(self)
	}
}

/// Live reference to a registered rule, exposing its counters and seen
/// traffic.
///
/// The handle shares the rule's counter allocation rather than going through
/// the store, so it stays valid after `reset()` or a `set_*_rules` replaced
/// the rule; observers then simply see the last-known values.
#[derive(Clone)]
pub struct MockedEndpoint {
	state: Arc<dyn EndpointState>,
}

impl MockedEndpoint {
	pub(crate) fn new(state: Arc<dyn EndpointState>) -> Self {
		MockedEndpoint { state }
	}

	pub fn id(&self) -> RuleId {
		self.state.id()
	}

	/// How many requests this rule has handled.
	pub fn request_count(&self) -> u64 {
		self.state.invocations()
	}

	/// Whether the rule still expects traffic; see spec of the rule limits.
	pub fn is_pending(&self) -> bool {
		self.state.is_pending()
	}

	/// The requests this rule matched, in order. Empty forever when the
	/// server runs with `record_traffic: false`.
	pub fn seen_requests(&self) -> Vec<Arc<ParsedRequest>> {
		self
			.state
			.seen()
			.into_iter()
			.map(|e| e.request)
			.collect()
	}

	/// The recorded exchanges including the response status each produced.
	pub fn seen_exchanges(&self) -> Vec<SeenExchange> {
		self.state.seen()
	}
}

impl std::fmt::Debug for MockedEndpoint {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MockedEndpoint")
			.field("id", &self.state.id())
			.field("requests", &self.state.invocations())
			.finish()
	}
}

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::ConfigError;
use crate::rules::endpoint::MockedEndpoint;
use crate::rules::{Handler, Rule, RuleState, WsHandler, WsRule};

/// Ordered rule lists plus the single optional HTTP fallback slot.
///
/// Writes are serialized behind the lock; the dispatcher takes a snapshot per
/// request and never holds the lock across a suspension point.
#[derive(Default)]
pub(crate) struct RuleStore {
	inner: RwLock<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
	http: Vec<Arc<RuleState<Handler>>>,
	ws: Vec<Arc<RuleState<WsHandler>>>,
	fallback: Option<Arc<RuleState<Handler>>>,
}

/// Consistent view used to dispatch one request.
#[derive(Clone)]
pub(crate) struct HttpSnapshot {
	pub rules: Vec<Arc<RuleState<Handler>>>,
	pub fallback: Option<Arc<RuleState<Handler>>>,
}

impl RuleStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_http(&self, rule: Rule) -> Arc<RuleState<Handler>> {
		let state = RuleState::new(rule);
		self.inner.write().http.push(state.clone());
		state
	}

	/// Atomic replacement of the HTTP sequence. The WebSocket sequence and
	/// the fallback slot are left untouched.
	pub fn set_http(&self, rules: Vec<Rule>) -> Vec<Arc<RuleState<Handler>>> {
		let states: Vec<_> = rules.into_iter().map(RuleState::new).collect();
		self.inner.write().http = states.clone();
		states
	}

	pub fn add_ws(&self, rule: WsRule) -> Arc<RuleState<WsHandler>> {
		let state = RuleState::new(rule);
		self.inner.write().ws.push(state.clone());
		state
	}

	/// Atomic replacement of the WebSocket sequence; HTTP rules and the
	/// fallback are untouched.
	pub fn set_ws(&self, rules: Vec<WsRule>) -> Vec<Arc<RuleState<WsHandler>>> {
		let states: Vec<_> = rules.into_iter().map(RuleState::new).collect();
		self.inner.write().ws = states.clone();
		states
	}

	pub fn set_fallback(&self, rule: Rule) -> Result<Arc<RuleState<Handler>>, ConfigError> {
		if !rule.matcher.is_always() {
			return Err(ConfigError::FallbackMatcher);
		}
		let mut inner = self.inner.write();
		if inner.fallback.is_some() {
			return Err(ConfigError::FallbackExists);
		}
		let state = RuleState::new(rule);
		inner.fallback = Some(state.clone());
		Ok(state)
	}

	/// Clears both sequences, the fallback, and every counter. Live
	/// connections are not touched.
	pub fn reset(&self) {
		let mut inner = self.inner.write();
		for r in &inner.http {
			r.reset_counters();
		}
		for r in &inner.ws {
			r.reset_counters();
		}
		if let Some(f) = &inner.fallback {
			f.reset_counters();
		}
		inner.http.clear();
		inner.ws.clear();
		inner.fallback = None;
	}

	pub fn http_snapshot(&self) -> HttpSnapshot {
		let inner = self.inner.read();
		HttpSnapshot {
			rules: inner.http.clone(),
			fallback: inner.fallback.clone(),
		}
	}

	pub fn ws_snapshot(&self) -> Vec<Arc<RuleState<WsHandler>>> {
		self.inner.read().ws.clone()
	}

	pub fn endpoints(&self) -> Vec<MockedEndpoint> {
		let inner = self.inner.read();
		let mut out: Vec<MockedEndpoint> = vec![];
		for r in &inner.http {
			out.push(MockedEndpoint::new(r.clone()));
		}
		if let Some(f) = &inner.fallback {
			out.push(MockedEndpoint::new(f.clone()));
		}
		for r in &inner.ws {
			out.push(MockedEndpoint::new(r.clone()));
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::StatusCode;
	use crate::rules::handler::ResponseDefinition;
	use crate::rules::{Matcher, RuleSpec};

	fn reply(matcher: Matcher) -> Rule {
		RuleSpec::new(
			matcher,
			Handler::Reply(ResponseDefinition::new(StatusCode::OK, "ok")),
		)
	}

	#[test]
	fn set_http_leaves_ws_and_fallback_alone() {
		let store = RuleStore::new();
		store.add_ws(RuleSpec::new(Matcher::always(), WsHandler::Echo));
		store.set_fallback(reply(Matcher::always())).unwrap();
		store.set_http(vec![reply(Matcher::Url("/a".into()))]);
		assert_eq!(store.ws_snapshot().len(), 1);
		assert!(store.http_snapshot().fallback.is_some());
		assert_eq!(store.http_snapshot().rules.len(), 1);
	}

	#[test]
	fn fallback_requires_always_matcher_and_is_single() {
		let store = RuleStore::new();
		assert!(matches!(
			store.set_fallback(reply(Matcher::Url("/a".into()))),
			Err(ConfigError::FallbackMatcher)
		));
		store.set_fallback(reply(Matcher::always())).unwrap();
		assert!(matches!(
			store.set_fallback(reply(Matcher::always())),
			Err(ConfigError::FallbackExists)
		));
	}

	#[test]
	fn reset_zeroes_counters_and_clears() {
		let store = RuleStore::new();
		let state = store.add_http(reply(Matcher::always()));
		assert!(state.try_claim());
		assert_eq!(state.invocations(), 1);
		store.reset();
		assert_eq!(state.invocations(), 0);
		assert!(store.http_snapshot().rules.is_empty());
	}
}

use std::sync::Arc;

use crate::http::Method;
use crate::http::exchange::ParsedRequest;
use crate::rules::store::HttpSnapshot;
use crate::rules::{Handler, RuleState, WsHandler};

/// Outcome of scanning the rule list for one request.
pub(crate) enum Dispatch<H> {
	Matched(Arc<RuleState<H>>),
	/// No rule applied; carries the plain-text explanation for the 503.
	Miss(String),
}

/// Scans HTTP rules in declaration order. A rule is eligible when its matcher
/// matches and a completion-limit slot can still be claimed; exhausted rules
/// fall through to the next match, then to the fallback.
pub(crate) fn select_http(
	snapshot: &HttpSnapshot,
	req: &ParsedRequest,
	suggest_changes: bool,
) -> Dispatch<Handler> {
	for rule in &snapshot.rules {
		if rule.spec.matcher.matches(req) && rule.try_claim() {
			return Dispatch::Matched(rule.clone());
		}
	}
	if let Some(fallback) = &snapshot.fallback
		&& fallback.try_claim()
	{
		return Dispatch::Matched(fallback.clone());
	}
	Dispatch::Miss(miss_body(req, &snapshot.rules, suggest_changes))
}

pub(crate) fn select_ws(
	snapshot: &[Arc<RuleState<WsHandler>>],
	req: &ParsedRequest,
	suggest_changes: bool,
) -> Dispatch<WsHandler> {
	for rule in snapshot {
		if rule.spec.matcher.matches(req) && rule.try_claim() {
			return Dispatch::Matched(rule.clone());
		}
	}
	Dispatch::Miss(miss_body(req, snapshot, suggest_changes))
}

/// Plain-text explanation of why nothing matched, listing the request and
/// every candidate rule. Tests match on the leading sentence, not the full
/// text.
fn miss_body<H>(
	req: &ParsedRequest,
	candidates: &[Arc<RuleState<H>>],
	suggest_changes: bool,
) -> String
where
	RuleState<H>: CandidateSummary,
{
	let mut body = String::new();
	body.push_str("No rules were found matching this request.\n\n");
	body.push_str(&format!("{} {}\n\n", req.head.method, req.head.url()));
	if candidates.is_empty() {
		body.push_str("No rules are configured on this server.\n");
	} else {
		body.push_str("The configured rules were:\n");
		for (i, rule) in candidates.iter().enumerate() {
			body.push_str(&format!("  {}. {}\n", i + 1, rule.summarize(req)));
		}
	}
	if suggest_changes {
		body.push('\n');
		body.push_str("To handle this request, add a rule like:\n\n");
		body.push_str(&format!("  {}\n", suggestion(req)));
	}
	body
}

/// One line per candidate: what it matches, how used it is, and why it did
/// not take this request.
pub(crate) trait CandidateSummary {
	fn summarize(&self, req: &ParsedRequest) -> String;
}

impl CandidateSummary for RuleState<Handler> {
	fn summarize(&self, req: &ParsedRequest) -> String {
		summarize(
			&self.spec.matcher,
			&self.spec.handler.to_string(),
			self.spec.limit,
			self.invocations(),
			self.spec.matcher.matches(req),
		)
	}
}

impl CandidateSummary for RuleState<WsHandler> {
	fn summarize(&self, req: &ParsedRequest) -> String {
		summarize(
			&self.spec.matcher,
			&self.spec.handler.to_string(),
			self.spec.limit,
			self.invocations(),
			self.spec.matcher.matches(req),
		)
	}
}

fn summarize(
	matcher: &crate::rules::Matcher,
	handler: &str,
	limit: Option<u64>,
	used: u64,
	matched: bool,
) -> String {
	let usage = match limit {
		Some(limit) => format!("{used} of {limit} responses used"),
		None => format!("handled {used} times"),
	};
	let why = if !matched {
		"the request did not match"
	} else {
		"its completion limit was reached"
	};
	format!("Match {matcher}, then {handler} ({usage}); skipped because {why}")
}

/// A builder-code snippet reproducing the missed request.
fn suggestion(req: &ParsedRequest) -> String {
	let helper = match req.head.method {
		Method::GET => "get",
		Method::POST => "post",
		Method::PUT => "put",
		Method::DELETE => "delete",
		Method::PATCH => "patch",
		Method::HEAD => "head",
		Method::OPTIONS => "options",
		_ => {
			return format!(
				"server.any_request().then_reply(200, \"\"); // for {} {}",
				req.head.method,
				req.head.path
			);
		},
	};
	format!(
		"server.{helper}({:?}).then_reply(200, \"\");",
		req.head.path
	)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::exchange::{CapturedBody, RequestHead};
	use crate::http::{HeaderMap, Scheme, StatusCode, Version};
	use crate::rules::handler::ResponseDefinition;
	use crate::rules::store::RuleStore;
	use crate::rules::{Matcher, RuleSpec};
	use std::time::SystemTime;

	fn get(path: &str) -> ParsedRequest {
		ParsedRequest {
			head: Arc::new(RequestHead {
				id: 1,
				received: SystemTime::now(),
				peer: "127.0.0.1:1".parse().unwrap(),
				version: Version::HTTP_11,
				scheme: Scheme::HTTP,
				host: "localhost".into(),
				port: 80,
				method: Method::GET,
				path: path.into(),
				query: None,
				headers: HeaderMap::new(),
			}),
			body: CapturedBody::Empty,
			trailers: None,
		}
	}

	fn reply(matcher: Matcher) -> crate::rules::Rule {
		RuleSpec::new(
			matcher,
			Handler::Reply(ResponseDefinition::new(StatusCode::OK, "")),
		)
	}

	#[test]
	fn declaration_order_wins() {
		let store = RuleStore::new();
		let first = store.add_http(reply(Matcher::Url("/a".into())));
		store.add_http(reply(Matcher::always()));
		let snap = store.http_snapshot();
		let Dispatch::Matched(hit) = select_http(&snap, &get("/a"), false) else {
			panic!("expected a match")
		};
		assert_eq!(hit.spec.id, first.spec.id);
	}

	#[test]
	fn exhausted_rule_falls_through() {
		let store = RuleStore::new();
		store.add_http(reply(Matcher::Url("/a".into())).with_limit(1));
		let second = store.add_http(reply(Matcher::always()));
		let snap = store.http_snapshot();
		let Dispatch::Matched(_) = select_http(&snap, &get("/a"), false) else {
			panic!("first request should match")
		};
		let Dispatch::Matched(hit) = select_http(&snap, &get("/a"), false) else {
			panic!("second request should fall through")
		};
		assert_eq!(hit.spec.id, second.spec.id);
	}

	#[test]
	fn fallback_takes_unmatched() {
		let store = RuleStore::new();
		store.add_http(reply(Matcher::Url("/a".into())));
		let fb = store.set_fallback(reply(Matcher::always())).unwrap();
		let snap = store.http_snapshot();
		let Dispatch::Matched(hit) = select_http(&snap, &get("/other"), false) else {
			panic!("fallback should match")
		};
		assert_eq!(hit.spec.id, fb.spec.id);
	}

	#[test]
	fn miss_body_names_candidates_and_suggests() {
		let store = RuleStore::new();
		store.add_http(reply(Matcher::Url("/a".into())));
		let snap = store.http_snapshot();
		let Dispatch::Miss(body) = select_http(&snap, &get("/missing"), true) else {
			panic!("expected a miss")
		};
		assert!(body.starts_with("No rules were found matching"));
		assert!(body.contains("for /a"));
		assert!(body.contains("then_reply(200"));
	}

	#[test]
	fn miss_body_without_rules() {
		let store = RuleStore::new();
		let snap = store.http_snapshot();
		let Dispatch::Miss(body) = select_http(&snap, &get("/x"), false) else {
			panic!("expected a miss")
		};
		assert!(body.contains("No rules are configured"));
		assert!(!body.contains("add a rule"));
	}
}

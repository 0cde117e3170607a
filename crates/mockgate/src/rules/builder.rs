use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use regex::Regex;

use crate::config::ConfigError;
use crate::http::exchange::ParsedRequest;
use crate::http::{BoxError, HeaderMap, HeaderName, HeaderValue, Scheme, StatusCode};
use crate::rules::endpoint::MockedEndpoint;
use crate::rules::handler::{ForwardTarget, PassthroughSpec, ResponseDefinition};
use crate::rules::{Handler, Matcher, Rule, RuleSpec, WsHandler, WsRule};

/// Where builders register their finished rules. Implemented by the server
/// facade.
pub(crate) trait RegisterRules: Send + Sync {
	fn register_http(&self, rule: Rule, fallback: bool) -> Result<MockedEndpoint, ConfigError>;
	fn register_ws(&self, rule: WsRule) -> Result<MockedEndpoint, ConfigError>;
}

/// URL argument of the verb helpers: nothing, a string (path, host-relative,
/// or absolute), or a regex tried against both URL and path.
#[derive(Debug, Clone)]
pub enum UrlPattern {
	Any,
	Text(String),
	Regex(Regex),
}

impl From<&str> for UrlPattern {
	fn from(value: &str) -> Self {
		UrlPattern::Text(value.to_string())
	}
}

impl From<String> for UrlPattern {
	fn from(value: String) -> Self {
		UrlPattern::Text(value)
	}
}

impl From<Regex> for UrlPattern {
	fn from(value: Regex) -> Self {
		UrlPattern::Regex(value)
	}
}

impl UrlPattern {
	pub(crate) fn into_matcher(self) -> Option<Matcher> {
		match self {
			UrlPattern::Any => None,
			UrlPattern::Text(s) => Some(Matcher::Url(s)),
			UrlPattern::Regex(re) => Some(Matcher::UrlRegex(re)),
		}
	}
}

/// Builds one HTTP rule. Matcher methods refine the match; a `then_*` call
/// registers the rule and hands back its endpoint. The builder is plain
/// construction sugar over the immutable `Rule` record.
pub struct RuleBuilder<'a> {
	sink: &'a dyn RegisterRules,
	matchers: Vec<Matcher>,
	limit: Option<u64>,
	fallback: bool,
}

impl<'a> RuleBuilder<'a> {
	pub(crate) fn new(sink: &'a dyn RegisterRules, matchers: Vec<Matcher>, fallback: bool) -> Self {
		RuleBuilder {
			sink,
			matchers,
			limit: None,
			fallback,
		}
	}

	pub fn matching(mut self, matcher: Matcher) -> Self {
		self.matchers.push(matcher);
		self
	}

	/// Requires `key=value` (and any further pairs) among the query
	/// parameters.
	pub fn with_query<K: Into<String>, V: Into<String>>(
		mut self,
		pairs: impl IntoIterator<Item = (K, V)>,
	) -> Self {
		self.matchers.push(Matcher::Query(
			pairs
				.into_iter()
				.map(|(k, v)| (k.into(), v.into()))
				.collect(),
		));
		self
	}

	pub fn with_exact_query(mut self, query: impl Into<String>) -> Self {
		self.matchers.push(Matcher::ExactQuery(query.into()));
		self
	}

	pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
		self.matchers.push(Matcher::Header(name, value));
		self
	}

	pub fn with_header_regex(mut self, name: HeaderName, value: Regex) -> Self {
		self.matchers.push(Matcher::HeaderRegex(name, value));
		self
	}

	pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self
			.matchers
			.push(Matcher::Cookie(name.into(), value.into()));
		self
	}

	pub fn with_body_including(mut self, text: impl Into<String>) -> Self {
		self.matchers.push(Matcher::BodyIncludes(text.into()));
		self
	}

	pub fn with_json_body(mut self, value: serde_json::Value) -> Self {
		self.matchers.push(Matcher::JsonBody(value));
		self
	}

	pub fn with_form_body<K: Into<String>, V: Into<String>>(
		mut self,
		pairs: impl IntoIterator<Item = (K, V)>,
	) -> Self {
		self.matchers.push(Matcher::FormBody(
			pairs
				.into_iter()
				.map(|(k, v)| (k.into(), v.into()))
				.collect(),
		));
		self
	}

	pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
		self.matchers.push(Matcher::Hostname(hostname.into()));
		self
	}

	pub fn with_port(mut self, port: u16) -> Self {
		self.matchers.push(Matcher::Port(port));
		self
	}

	pub fn for_protocol(mut self, scheme: Scheme) -> Self {
		self.matchers.push(Matcher::Protocol(scheme));
		self
	}

	/// Handle at most one request, then fall through to later rules.
	pub fn once(self) -> Self {
		self.times(1)
	}

	pub fn twice(self) -> Self {
		self.times(2)
	}

	pub fn times(mut self, n: u64) -> Self {
		self.limit = Some(n);
		self
	}

	fn register(self, handler: Handler) -> Result<MockedEndpoint, ConfigError> {
		let mut rule = RuleSpec::new(Matcher::All(self.matchers), handler);
		rule.limit = self.limit;
		self.sink.register_http(rule, self.fallback)
	}

	pub fn then_reply(
		self,
		status: u16,
		body: impl Into<Bytes>,
	) -> Result<MockedEndpoint, ConfigError> {
		let status = parse_status(status)?;
		self.register(Handler::Reply(ResponseDefinition::new(status, body)))
	}

	pub fn then_reply_with(self, response: ResponseDefinition) -> Result<MockedEndpoint, ConfigError> {
		self.register(Handler::Reply(response))
	}

	/// Replies with a JSON body and content type.
	pub fn then_json(
		self,
		status: u16,
		value: &impl serde::Serialize,
	) -> Result<MockedEndpoint, ConfigError> {
		let status = parse_status(status)?;
		let body = serde_json::to_vec(value)
			.map_err(|e| ConfigError::InvalidRule(format!("unserializable JSON body: {e}")))?;
		let mut response = ResponseDefinition::new(status, body);
		response.headers.insert(
			crate::http::header::CONTENT_TYPE,
			HeaderValue::from_static("application/json"),
		);
		self.register(Handler::Reply(response))
	}

	/// Streams a response body. The factory runs once per matched request.
	pub fn then_stream<F, S>(
		self,
		status: u16,
		headers: HeaderMap,
		factory: F,
	) -> Result<MockedEndpoint, ConfigError>
	where
		F: Fn() -> S + Send + Sync + 'static,
		S: Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
	{
		let status = parse_status(status)?;
		self.register(Handler::Stream {
			status,
			headers,
			stream: Arc::new(move || factory().boxed()),
		})
	}

	/// Produces the response from a user callback, bounded by the server's
	/// callback timeout. Errors and timeouts surface to the peer as a 500.
	pub fn then_callback<F, Fut>(self, callback: F) -> Result<MockedEndpoint, ConfigError>
	where
		F: Fn(Arc<ParsedRequest>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<ResponseDefinition, BoxError>> + Send + 'static,
	{
		self.register(Handler::Callback(Arc::new(
			move |req| -> BoxFuture<'static, Result<ResponseDefinition, BoxError>> {
				Box::pin(callback(req))
			},
		)))
	}

	/// Serves the contents of a file, read lazily per request.
	pub fn then_file(
		self,
		status: u16,
		path: impl Into<PathBuf>,
	) -> Result<MockedEndpoint, ConfigError> {
		let status = parse_status(status)?;
		self.register(Handler::File {
			status,
			headers: HeaderMap::new(),
			path: path.into(),
		})
	}

	/// Holds the socket open without ever responding.
	pub fn then_timeout(self) -> Result<MockedEndpoint, ConfigError> {
		self.register(Handler::Timeout)
	}

	pub fn then_close_connection(self) -> Result<MockedEndpoint, ConfigError> {
		self.register(Handler::CloseConnection)
	}

	pub fn then_reset_connection(self) -> Result<MockedEndpoint, ConfigError> {
		self.register(Handler::ResetConnection)
	}

	/// Forwards matched requests to their original destination.
	pub fn then_pass_through(self) -> Result<MockedEndpoint, ConfigError> {
		self.register(Handler::Passthrough(PassthroughSpec::default()))
	}

	pub fn then_pass_through_with(
		self,
		spec: PassthroughSpec,
	) -> Result<MockedEndpoint, ConfigError> {
		self.register(Handler::Passthrough(spec))
	}

	/// Passthrough with the destination overridden, e.g.
	/// `"https://real.example:8443"`.
	pub fn then_forward_to(self, target: &str) -> Result<MockedEndpoint, ConfigError> {
		let target = ForwardTarget::parse(target)
			.map_err(|e| ConfigError::InvalidRule(format!("invalid forwarding target: {e}")))?;
		self.register(Handler::Passthrough(PassthroughSpec {
			target: Some(target),
			..Default::default()
		}))
	}
}

/// Builds one WebSocket rule.
pub struct WsRuleBuilder<'a> {
	sink: &'a dyn RegisterRules,
	matchers: Vec<Matcher>,
	limit: Option<u64>,
}

impl<'a> WsRuleBuilder<'a> {
	pub(crate) fn new(sink: &'a dyn RegisterRules, matchers: Vec<Matcher>) -> Self {
		WsRuleBuilder {
			sink,
			matchers,
			limit: None,
		}
	}

	pub fn matching(mut self, matcher: Matcher) -> Self {
		self.matchers.push(matcher);
		self
	}

	pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
		self.matchers.push(Matcher::Hostname(hostname.into()));
		self
	}

	pub fn with_port(mut self, port: u16) -> Self {
		self.matchers.push(Matcher::Port(port));
		self
	}

	pub fn once(self) -> Self {
		self.times(1)
	}

	pub fn times(mut self, n: u64) -> Self {
		self.limit = Some(n);
		self
	}

	fn register(self, handler: WsHandler) -> Result<MockedEndpoint, ConfigError> {
		let mut rule = RuleSpec::new(Matcher::All(self.matchers), handler);
		rule.limit = self.limit;
		self.sink.register_ws(rule)
	}

	/// Accepts the upgrade and echoes every frame back to the client.
	pub fn then_echo(self) -> Result<MockedEndpoint, ConfigError> {
		self.register(WsHandler::Echo)
	}

	/// Refuses the upgrade with a plain HTTP response.
	pub fn then_reject(
		self,
		status: u16,
		body: impl Into<Bytes>,
	) -> Result<MockedEndpoint, ConfigError> {
		let status = parse_status(status)?;
		self.register(WsHandler::Reject {
			status,
			body: body.into(),
		})
	}

	/// Pipes frames between the client and the original upstream.
	pub fn then_pass_through(self) -> Result<MockedEndpoint, ConfigError> {
		self.register(WsHandler::Passthrough(PassthroughSpec::default()))
	}

	pub fn then_pass_through_with(
		self,
		spec: PassthroughSpec,
	) -> Result<MockedEndpoint, ConfigError> {
		self.register(WsHandler::Passthrough(spec))
	}

	pub fn then_forward_to(self, target: &str) -> Result<MockedEndpoint, ConfigError> {
		let target = ForwardTarget::parse(target)
			.map_err(|e| ConfigError::InvalidRule(format!("invalid forwarding target: {e}")))?;
		self.register(WsHandler::Passthrough(PassthroughSpec {
			target: Some(target),
			..Default::default()
		}))
	}
}

fn parse_status(status: u16) -> Result<StatusCode, ConfigError> {
	StatusCode::from_u16(status)
		.map_err(|_| ConfigError::InvalidRule(format!("invalid status code {status}")))
}

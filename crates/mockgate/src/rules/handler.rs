use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;

use crate::http::exchange::ParsedRequest;
use crate::http::{BoxError, HeaderMap, Method, Scheme, StatusCode};

/// A fully materialized response, as produced by `then_reply` rules and user
/// callbacks.
#[derive(Debug, Clone, Default)]
pub struct ResponseDefinition {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
}

impl ResponseDefinition {
	pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
		ResponseDefinition {
			status,
			headers: HeaderMap::new(),
			body: body.into(),
		}
	}
}

pub type Callback =
	Arc<dyn Fn(Arc<ParsedRequest>) -> BoxFuture<'static, Result<ResponseDefinition, BoxError>> + Send + Sync>;

/// Produces a fresh body stream per invocation, so a streaming rule can fire
/// more than once.
pub type StreamFactory =
	Arc<dyn Fn() -> BoxStream<'static, Result<Bytes, BoxError>> + Send + Sync>;

/// The request as a passthrough rewrite callback sees it. A `body` of `None`
/// leaves the original body streaming untouched.
#[derive(Debug, Clone)]
pub struct PassthroughRequest {
	pub method: Method,
	pub url: String,
	pub headers: HeaderMap,
	pub body: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct PassthroughResponse {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
}

pub type RequestRewrite =
	Arc<dyn Fn(PassthroughRequest) -> BoxFuture<'static, Result<PassthroughRequest, BoxError>> + Send + Sync>;
pub type ResponseRewrite =
	Arc<dyn Fn(PassthroughResponse) -> BoxFuture<'static, Result<PassthroughResponse, BoxError>> + Send + Sync>;

/// Overrides applied to the upstream destination of a passthrough exchange.
/// Unset fields keep the incoming request's values.
#[derive(Debug, Clone, Default)]
pub struct ForwardTarget {
	pub scheme: Option<Scheme>,
	pub host: Option<String>,
	pub port: Option<u16>,
}

impl ForwardTarget {
	/// Parses `https://host:port`, `host:port` or a bare `host`.
	pub fn parse(s: &str) -> anyhow::Result<ForwardTarget> {
		let (scheme, rest) = match s.split_once("://") {
			Some((scheme, rest)) => {
				let scheme = match scheme {
					"http" | "ws" => Scheme::HTTP,
					"https" | "wss" => Scheme::HTTPS,
					other => anyhow::bail!("unsupported forwarding scheme {other}"),
				};
				(Some(scheme), rest)
			},
			None => (None, s),
		};
		let rest = rest.trim_end_matches('/');
		anyhow::ensure!(!rest.is_empty(), "forwarding target must name a host");
		let (host, port) = match rest.rsplit_once(':') {
			Some((host, port)) => (host.to_string(), Some(port.parse::<u16>()?)),
			None => (rest.to_string(), None),
		};
		Ok(ForwardTarget {
			scheme,
			host: Some(host),
			port,
		})
	}
}

#[derive(Clone, Default)]
pub struct PassthroughSpec {
	pub target: Option<ForwardTarget>,
	pub before_request: Option<RequestRewrite>,
	pub before_response: Option<ResponseRewrite>,
	/// Destinations (host, `host:port` or `*.suffix`) whose certificates are
	/// accepted without verification, for this rule's exchanges only.
	pub ignore_host_certificate_errors: Vec<String>,
}

impl PassthroughSpec {
	pub fn with_target(mut self, target: ForwardTarget) -> Self {
		self.target = Some(target);
		self
	}

	pub fn with_before_request<F, Fut>(mut self, f: F) -> Self
	where
		F: Fn(PassthroughRequest) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<PassthroughRequest, BoxError>> + Send + 'static,
	{
		self.before_request = Some(Arc::new(
			move |r| -> BoxFuture<'static, Result<PassthroughRequest, BoxError>> { Box::pin(f(r)) },
		));
		self
	}

	pub fn with_before_response<F, Fut>(mut self, f: F) -> Self
	where
		F: Fn(PassthroughResponse) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<PassthroughResponse, BoxError>> + Send + 'static,
	{
		self.before_response = Some(Arc::new(
			move |r| -> BoxFuture<'static, Result<PassthroughResponse, BoxError>> { Box::pin(f(r)) },
		));
		self
	}

	pub fn ignoring_host_certificate_errors(
		mut self,
		hosts: impl IntoIterator<Item = impl Into<String>>,
	) -> Self {
		self.ignore_host_certificate_errors = hosts.into_iter().map(Into::into).collect();
		self
	}
}

impl std::fmt::Debug for PassthroughSpec {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PassthroughSpec")
			.field("target", &self.target)
			.field("before_request", &self.before_request.is_some())
			.field("before_response", &self.before_response.is_some())
			.field(
				"ignore_host_certificate_errors",
				&self.ignore_host_certificate_errors,
			)
			.finish()
	}
}

/// What a matched HTTP rule does with the exchange.
#[derive(Clone)]
pub enum Handler {
	Reply(ResponseDefinition),
	Stream {
		status: StatusCode,
		headers: HeaderMap,
		stream: StreamFactory,
	},
	Callback(Callback),
	File {
		status: StatusCode,
		headers: HeaderMap,
		path: PathBuf,
	},
	/// Hold the connection open and never respond.
	Timeout,
	CloseConnection,
	ResetConnection,
	Passthrough(PassthroughSpec),
}

impl std::fmt::Debug for Handler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Handler::Reply(r) => f.debug_tuple("Reply").field(&r.status).finish(),
			Handler::Stream { status, .. } => f.debug_tuple("Stream").field(status).finish(),
			Handler::Callback(_) => f.write_str("Callback"),
			Handler::File { path, .. } => f.debug_tuple("File").field(path).finish(),
			Handler::Timeout => f.write_str("Timeout"),
			Handler::CloseConnection => f.write_str("CloseConnection"),
			Handler::ResetConnection => f.write_str("ResetConnection"),
			Handler::Passthrough(p) => f.debug_tuple("Passthrough").field(p).finish(),
		}
	}
}

impl std::fmt::Display for Handler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Handler::Reply(r) => write!(f, "respond with status {}", r.status.as_u16()),
			Handler::Stream { status, .. } => {
				write!(f, "stream a response with status {}", status.as_u16())
			},
			Handler::Callback(_) => write!(f, "respond via a callback"),
			Handler::File { path, .. } => write!(f, "respond with the contents of {}", path.display()),
			Handler::Timeout => write!(f, "time out (never respond)"),
			Handler::CloseConnection => write!(f, "close the connection"),
			Handler::ResetConnection => write!(f, "reset the connection"),
			Handler::Passthrough(_) => write!(f, "pass the request through to the target host"),
		}
	}
}

/// What a matched WebSocket rule does with the stream.
#[derive(Clone)]
pub enum WsHandler {
	/// Accept the upgrade and echo every frame back.
	Echo,
	/// Refuse the upgrade with a plain HTTP response.
	Reject { status: StatusCode, body: Bytes },
	Passthrough(PassthroughSpec),
}

impl std::fmt::Debug for WsHandler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			WsHandler::Echo => f.write_str("Echo"),
			WsHandler::Reject { status, .. } => f.debug_tuple("Reject").field(status).finish(),
			WsHandler::Passthrough(p) => f.debug_tuple("Passthrough").field(p).finish(),
		}
	}
}

impl std::fmt::Display for WsHandler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			WsHandler::Echo => write!(f, "echo all frames"),
			WsHandler::Reject { status, .. } => {
				write!(f, "reject the upgrade with status {}", status.as_u16())
			},
			WsHandler::Passthrough(_) => write!(f, "pipe frames to the target host"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn forward_target_parsing() {
		let t = ForwardTarget::parse("https://other.test:8443").unwrap();
		assert_eq!(t.scheme, Some(Scheme::HTTPS));
		assert_eq!(t.host.as_deref(), Some("other.test"));
		assert_eq!(t.port, Some(8443));

		let t = ForwardTarget::parse("other.test").unwrap();
		assert_eq!(t.scheme, None);
		assert_eq!(t.port, None);

		assert!(ForwardTarget::parse("ftp://x").is_err());
		assert!(ForwardTarget::parse("").is_err());
	}
}

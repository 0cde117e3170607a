use std::net::SocketAddr;
use std::time::SystemTime;

use bytes::Bytes;

use crate::http::{HeaderMap, Method, Scheme, StatusCode, Version};

/// Body bytes as captured for matching and events.
///
/// `Discarded` covers both a request body that overflowed `max_body_size`
/// (matchers then treat it as empty, while passthrough still streams it) and
/// a streamed response whose bytes were never materialized.
#[derive(Debug, Clone, Default)]
pub enum CapturedBody {
	#[default]
	Empty,
	Complete(Bytes),
	Discarded,
}

impl CapturedBody {
	/// The bytes a matcher sees. A discarded body matches as if empty.
	pub fn for_matching(&self) -> &[u8] {
		match self {
			CapturedBody::Complete(b) => b,
			_ => &[],
		}
	}

	pub fn bytes(&self) -> Option<&Bytes> {
		match self {
			CapturedBody::Complete(b) => Some(b),
			_ => None,
		}
	}
}

/// Everything known about a request before its body has been read.
#[derive(Debug, Clone)]
pub struct RequestHead {
	pub id: u64,
	pub received: SystemTime,
	pub peer: SocketAddr,
	pub version: Version,
	pub scheme: Scheme,
	pub host: String,
	pub port: u16,
	pub method: Method,
	pub path: String,
	pub query: Option<String>,
	pub headers: HeaderMap,
}

impl RequestHead {
	/// The absolute URL of the request, query included.
	pub fn url(&self) -> String {
		let default_port = if self.scheme == Scheme::HTTPS { 443 } else { 80 };
		let mut url = if self.port == default_port {
			format!("{}://{}{}", self.scheme, self.host, self.path)
		} else {
			format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
		};
		if let Some(q) = &self.query {
			url.push('?');
			url.push_str(q);
		}
		url
	}

	/// The absolute URL with the query stripped, the form URL matchers
	/// compare against.
	pub fn url_without_query(&self) -> String {
		let default_port = if self.scheme == Scheme::HTTPS { 443 } else { 80 };
		if self.port == default_port {
			format!("{}://{}{}", self.scheme, self.host, self.path)
		} else {
			format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
		}
	}
}

/// A fully read request as seen by matchers, handlers and event subscribers.
/// Immutable once built.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
	pub head: std::sync::Arc<RequestHead>,
	pub body: CapturedBody,
	pub trailers: Option<HeaderMap>,
}

impl ParsedRequest {
	pub fn id(&self) -> u64 {
		self.head.id
	}

	pub fn method(&self) -> &Method {
		&self.head.method
	}

	pub fn path(&self) -> &str {
		&self.head.path
	}
}

/// The response half of an observed exchange, as delivered to `response`
/// event subscribers.
#[derive(Debug, Clone)]
pub struct MockedResponse {
	pub request_id: u64,
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: CapturedBody,
}

pub mod body;
pub mod cors;
pub mod exchange;

use bytes::Bytes;
use headers::HeaderMapExt;
use http_body_util::{BodyExt, Empty, Full};
use hyper::upgrade::OnUpgrade;

pub use ::http::uri::{Authority, Scheme};
pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version, header, uri};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
// Unsync because hyper's streaming bodies are Send-only.
pub type Body = http_body_util::combinators::UnsyncBoxBody<Bytes, BoxError>;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

pub fn empty_body() -> Body {
	Empty::new().map_err(|never| match never {}).boxed_unsync()
}

pub fn full_body(data: impl Into<Bytes>) -> Body {
	Full::new(data.into())
		.map_err(|never| match never {})
		.boxed_unsync()
}

pub fn plain_response(status: StatusCode, msg: impl Into<Bytes>) -> Response {
	::http::Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "text/plain")
		.body(full_body(msg))
		.expect("static response must build")
}

pub fn modify_req_uri<B>(
	req: &mut ::http::Request<B>,
	f: impl FnOnce(&mut uri::Parts) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
	let mut parts = std::mem::take(req.uri_mut()).into_parts();
	f(&mut parts)?;
	*req.uri_mut() = Uri::from_parts(parts)?;
	Ok(())
}

/// The http library will not put the authority into `req.uri()` for HTTP/1
/// origin-form requests. Normalize so the rest of the pipeline can always read
/// scheme/authority off the URI. `default_authority` covers requests arriving
/// inside a CONNECT tunnel whose Host header is absent.
pub fn normalize_uri<B>(
	req: &mut ::http::Request<B>,
	secure: bool,
	default_authority: Option<&Authority>,
) -> anyhow::Result<()> {
	if req.uri().authority().is_none() {
		let mut parts = std::mem::take(req.uri_mut()).into_parts();
		let host = req
			.headers()
			.get(header::HOST)
			.and_then(|h| h.to_str().ok())
			.and_then(|h| h.parse::<Authority>().ok())
			.or_else(|| default_authority.cloned())
			.ok_or_else(|| anyhow::anyhow!("no authority or host"))?;
		parts.authority = Some(host);
		if parts.path_and_query.is_none() {
			parts.path_and_query = Some(::http::uri::PathAndQuery::from_static("/"));
		}
		parts.scheme = Some(if secure { Scheme::HTTPS } else { Scheme::HTTP });
		*req.uri_mut() = Uri::from_parts(parts)?;
	} else if req.uri().scheme().is_none() {
		let mut parts = std::mem::take(req.uri_mut()).into_parts();
		parts.scheme = Some(if secure { Scheme::HTTPS } else { Scheme::HTTP });
		*req.uri_mut() = Uri::from_parts(parts)?;
	}
	Ok(())
}

pub fn effective_port(uri: &Uri) -> u16 {
	uri
		.port_u16()
		.unwrap_or(if uri.scheme() == Some(&Scheme::HTTPS) {
			443
		} else {
			80
		})
}

// Hop-by-hop headers, removed when a request is forwarded. The set from the
// obsoleted RFC 2616 (section 13.5.1), kept for backward compatibility.
static HOP_HEADERS: [HeaderName; 9] = [
	header::CONNECTION,
	// non-standard but still sent by libcurl and rejected by e.g. google
	HeaderName::from_static("proxy-connection"),
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

pub struct RequestUpgrade {
	pub upgrade_type: HeaderValue,
	pub upgrade: OnUpgrade,
}

/// Strips hop-by-hop headers in place, restoring the headers a protocol
/// upgrade needs. Returns the upgrade handle when the client asked for one.
pub fn hop_by_hop_headers<B>(req: &mut ::http::Request<B>) -> Option<RequestUpgrade> {
	let trailers = req
		.headers()
		.get(header::TE)
		.and_then(|h| h.to_str().ok())
		.map(|s| s.contains("trailers"))
		.unwrap_or(false);
	let upgrade_type = upgrade_type(req.headers());
	for h in HOP_HEADERS.iter() {
		req.headers_mut().remove(h);
	}
	if trailers {
		req.headers_mut().typed_insert(headers::Te::trailers());
	}
	if let Some(upgrade_type) = upgrade_type.clone() {
		req
			.headers_mut()
			.typed_insert(headers::Connection::upgrade());
		req.headers_mut().insert(header::UPGRADE, upgrade_type);
	}
	let on_upgrade = req.extensions_mut().remove::<OnUpgrade>();
	if let Some(t) = upgrade_type
		&& let Some(u) = on_upgrade
	{
		Some(RequestUpgrade {
			upgrade_type: t,
			upgrade: u,
		})
	} else {
		None
	}
}

pub fn strip_hop_headers(headers: &mut HeaderMap) {
	for h in HOP_HEADERS.iter() {
		headers.remove(h);
	}
}

pub fn upgrade_type(headers: &HeaderMap) -> Option<HeaderValue> {
	if let Some(con) = headers.typed_get::<headers::Connection>() {
		if con.contains(header::UPGRADE) {
			headers.get(header::UPGRADE).cloned()
		} else {
			None
		}
	} else {
		None
	}
}

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
	upgrade_type(headers)
		.map(|v| {
			v.to_str()
				.map(|s| s.eq_ignore_ascii_case("websocket"))
				.unwrap_or(false)
		})
		.unwrap_or(false)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn normalize_fills_scheme_and_authority() {
		let mut req = ::http::Request::builder()
			.uri("/a/b?x=1")
			.header(header::HOST, "example.test:8000")
			.body(())
			.unwrap();
		normalize_uri(&mut req, false, None).unwrap();
		assert_eq!(
			req.uri().to_string(),
			"http://example.test:8000/a/b?x=1"
		);
	}

	#[test]
	fn normalize_prefers_existing_authority() {
		let mut req = ::http::Request::builder()
			.uri("http://other.test/x")
			.header(header::HOST, "example.test")
			.body(())
			.unwrap();
		normalize_uri(&mut req, false, None).unwrap();
		assert_eq!(req.uri().host(), Some("other.test"));
	}

	#[test]
	fn websocket_upgrade_detection() {
		let mut headers = HeaderMap::new();
		headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
		headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
		assert!(is_websocket_upgrade(&headers));
		headers.remove(header::UPGRADE);
		assert!(!is_websocket_upgrade(&headers));
	}
}

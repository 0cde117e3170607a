use itertools::Itertools;
use regex::Regex;

use crate::http::exchange::ParsedRequest;
use crate::http::{HeaderName, HeaderValue, Method, Scheme, header};

/// A predicate over a parsed request. Leaves test one attribute; `All`/`Any`
/// combine. Evaluation is deterministic and side-effect free.
#[derive(Debug, Clone)]
pub enum Matcher {
	All(Vec<Matcher>),
	Any(Vec<Matcher>),
	Method(Method),
	/// String URL with the three-way policy: leading `/` compares the path,
	/// `scheme://` compares the absolute URL, `host:port/path` compares
	/// host-relative. The query is never part of the comparison.
	Url(String),
	/// Tries the absolute URL first, then the bare path.
	UrlRegex(Regex),
	PathRegex(Regex),
	/// Every pair must be present among the request's query parameters.
	Query(Vec<(String, String)>),
	/// The raw query string must match exactly.
	ExactQuery(String),
	Header(HeaderName, HeaderValue),
	HeaderRegex(HeaderName, Regex),
	Cookie(String, String),
	BodyIncludes(String),
	/// Structural subset match against the JSON-decoded body.
	JsonBody(serde_json::Value),
	/// Every pair must be present in the urlencoded body.
	FormBody(Vec<(String, String)>),
	Hostname(String),
	Port(u16),
	Protocol(Scheme),
}

impl Matcher {
	/// The matcher a fallback rule must carry: matches every request.
	pub fn always() -> Matcher {
		Matcher::All(vec![])
	}

	pub fn is_always(&self) -> bool {
		matches!(self, Matcher::All(children) if children.is_empty())
	}

	pub fn matches(&self, req: &ParsedRequest) -> bool {
		match self {
			Matcher::All(children) => children.iter().all(|m| m.matches(req)),
			Matcher::Any(children) => children.iter().any(|m| m.matches(req)),
			Matcher::Method(m) => req.head.method == *m,
			Matcher::Url(url) => url_matches(url, req),
			Matcher::UrlRegex(re) => {
				re.is_match(&req.head.url_without_query()) || re.is_match(&req.head.path)
			},
			Matcher::PathRegex(re) => re.is_match(&req.head.path),
			Matcher::Query(pairs) => {
				let present = query_pairs(req.head.query.as_deref().unwrap_or(""));
				pairs.iter().all(|p| present.contains(p))
			},
			Matcher::ExactQuery(q) => {
				req.head.query.as_deref().unwrap_or("") == q.strip_prefix('?').unwrap_or(q)
			},
			Matcher::Header(name, value) => req.head.headers.get_all(name).iter().any(|v| v == value),
			Matcher::HeaderRegex(name, re) => req
				.head
				.headers
				.get_all(name)
				.iter()
				.any(|v| v.to_str().map(|s| re.is_match(s)).unwrap_or(false)),
			Matcher::Cookie(name, value) => cookies(req).any(|(n, v)| n == *name && v == *value),
			Matcher::BodyIncludes(s) => {
				String::from_utf8_lossy(req.body.for_matching()).contains(s.as_str())
			},
			Matcher::JsonBody(expected) => serde_json::from_slice::<serde_json::Value>(
				req.body.for_matching(),
			)
			.map(|actual| json_subset(expected, &actual))
			.unwrap_or(false),
			Matcher::FormBody(pairs) => {
				let present = query_pairs(&String::from_utf8_lossy(req.body.for_matching()));
				pairs.iter().all(|p| present.contains(p))
			},
			Matcher::Hostname(host) => req.head.host.eq_ignore_ascii_case(host),
			Matcher::Port(port) => req.head.port == *port,
			Matcher::Protocol(scheme) => req.head.scheme == *scheme,
		}
	}
}

fn query_pairs(raw: &str) -> Vec<(String, String)> {
	serde_urlencoded::from_str::<Vec<(String, String)>>(raw).unwrap_or_default()
}

fn cookies(req: &ParsedRequest) -> impl Iterator<Item = (String, String)> + '_ {
	req
		.head
		.headers
		.get_all(header::COOKIE)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split("; "))
		.filter_map(|pair| {
			pair
				.split_once('=')
				.map(|(n, v)| (n.to_string(), v.to_string()))
		})
}

/// The three-way string URL policy of §4.1.
fn url_matches(url: &str, req: &ParsedRequest) -> bool {
	if url.starts_with('/') {
		return strip_query(url) == req.head.path;
	}
	if url.contains("://") {
		let Some(wanted) = normalize_absolute(url) else {
			return false;
		};
		return wanted == req.head.url_without_query();
	}
	// A colon before the first slash (`host:8000/p`) makes it host-relative.
	let (authority, path) = url.split_at(url.find('/').unwrap_or(url.len()));
	if authority.contains(':') {
		let wanted_path = if path.is_empty() { "/" } else { path };
		return authority == format!("{}:{}", req.head.host, req.head.port)
			&& strip_query(wanted_path) == req.head.path;
	}
	// Anything else cannot name a request; compare verbatim against the path.
	strip_query(url) == req.head.path
}

fn strip_query(s: &str) -> &str {
	s.split('?').next().unwrap_or(s)
}

/// Canonical `scheme://host[:port]/path` with default ports elided and the
/// query dropped. WebSocket schemes compare as their HTTP equivalents.
fn normalize_absolute(s: &str) -> Option<String> {
	let u = url::Url::parse(s).ok()?;
	let scheme = match u.scheme() {
		"ws" => "http",
		"wss" => "https",
		other => other,
	};
	let host = u.host_str()?;
	let default = match scheme {
		"http" => 80,
		"https" => 443,
		_ => return None,
	};
	let port = u.port().unwrap_or(default);
	Some(if port == default {
		format!("{scheme}://{host}{}", u.path())
	} else {
		format!("{scheme}://{host}:{port}{}", u.path())
	})
}

fn json_subset(expected: &serde_json::Value, actual: &serde_json::Value) -> bool {
	use serde_json::Value;
	match (expected, actual) {
		(Value::Object(exp), Value::Object(act)) => exp
			.iter()
			.all(|(k, v)| act.get(k).map(|a| json_subset(v, a)).unwrap_or(false)),
		(Value::Array(exp), Value::Array(act)) => {
			exp.len() <= act.len() && exp.iter().zip(act).all(|(e, a)| json_subset(e, a))
		},
		(e, a) => e == a,
	}
}

impl std::fmt::Display for Matcher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Matcher::All(children) if children.is_empty() => write!(f, "any request"),
			Matcher::All(children) => {
				write!(f, "{}", children.iter().map(|c| c.to_string()).join(" and "))
			},
			Matcher::Any(children) => {
				write!(
					f,
					"({})",
					children.iter().map(|c| c.to_string()).join(" or ")
				)
			},
			Matcher::Method(m) => write!(f, "{m} requests"),
			Matcher::Url(u) => write!(f, "for {u}"),
			Matcher::UrlRegex(re) => write!(f, "for URLs matching /{re}/"),
			Matcher::PathRegex(re) => write!(f, "for paths matching /{re}/"),
			Matcher::Query(q) => write!(
				f,
				"with query {}",
				q.iter().map(|(k, v)| format!("{k}={v}")).join("&")
			),
			Matcher::ExactQuery(q) => write!(f, "with exactly query {q}"),
			Matcher::Header(name, value) => {
				write!(f, "with header {name}: {}", String::from_utf8_lossy(value.as_bytes()))
			},
			Matcher::HeaderRegex(name, re) => write!(f, "with header {name} matching /{re}/"),
			Matcher::Cookie(name, value) => write!(f, "with cookie {name}={value}"),
			Matcher::BodyIncludes(s) => write!(f, "with a body including {s:?}"),
			Matcher::JsonBody(v) => write!(f, "with a JSON body matching {v}"),
			Matcher::FormBody(pairs) => write!(
				f,
				"with form data {}",
				pairs.iter().map(|(k, v)| format!("{k}={v}")).join("&")
			),
			Matcher::Hostname(h) => write!(f, "for hostname {h}"),
			Matcher::Port(p) => write!(f, "for port {p}"),
			Matcher::Protocol(s) => write!(f, "over {s}"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::exchange::{CapturedBody, RequestHead};
	use crate::http::{HeaderMap, Version};
	use bytes::Bytes;
	use std::sync::Arc;
	use std::time::SystemTime;

	fn request(method: Method, scheme: Scheme, host: &str, port: u16, path_q: &str) -> ParsedRequest {
		let (path, query) = match path_q.split_once('?') {
			Some((p, q)) => (p.to_string(), Some(q.to_string())),
			None => (path_q.to_string(), None),
		};
		ParsedRequest {
			head: Arc::new(RequestHead {
				id: 1,
				received: SystemTime::now(),
				peer: "127.0.0.1:1234".parse().unwrap(),
				version: Version::HTTP_11,
				scheme,
				host: host.to_string(),
				port,
				method,
				path,
				query,
				headers: HeaderMap::new(),
			}),
			body: CapturedBody::Empty,
			trailers: None,
		}
	}

	fn get(path_q: &str) -> ParsedRequest {
		request(Method::GET, Scheme::HTTP, "localhost", 8000, path_q)
	}

	#[test]
	fn relative_url_compares_path_sans_query() {
		let m = Matcher::Url("/a".into());
		assert!(m.matches(&get("/a")));
		assert!(m.matches(&get("/a?x=1")));
		assert!(!m.matches(&get("/a/b")));
	}

	#[test]
	fn absolute_url_compares_whole_url() {
		let m = Matcher::Url("http://localhost:8000/a".into());
		assert!(m.matches(&get("/a?q=1")));
		assert!(!m.matches(&request(
			Method::GET,
			Scheme::HTTP,
			"other",
			8000,
			"/a"
		)));
	}

	#[test]
	fn absolute_url_elides_default_ports() {
		let m = Matcher::Url("https://example.test/x".into());
		assert!(m.matches(&request(
			Method::GET,
			Scheme::HTTPS,
			"example.test",
			443,
			"/x"
		)));
	}

	#[test]
	fn host_relative_url() {
		let m = Matcher::Url("localhost:8000/p".into());
		assert!(m.matches(&get("/p")));
		assert!(!m.matches(&request(
			Method::GET,
			Scheme::HTTP,
			"localhost",
			8001,
			"/p"
		)));
	}

	#[test]
	fn url_regex_tries_absolute_and_path() {
		let m = Matcher::UrlRegex(Regex::new("^/x").unwrap());
		assert!(m.matches(&get("/x/1")));
		let m = Matcher::UrlRegex(Regex::new("^http://localhost").unwrap());
		assert!(m.matches(&get("/anything")));
	}

	#[test]
	fn query_subset_and_exact() {
		let m = Matcher::Query(vec![("a".into(), "1".into())]);
		assert!(m.matches(&get("/p?a=1&b=2")));
		assert!(!m.matches(&get("/p?a=2")));
		let m = Matcher::ExactQuery("a=1&b=2".into());
		assert!(m.matches(&get("/p?a=1&b=2")));
		assert!(!m.matches(&get("/p?a=1")));
	}

	#[test]
	fn body_matchers_treat_discarded_as_empty() {
		let mut req = get("/p");
		req.body = CapturedBody::Complete(Bytes::from_static(b"{\"a\": 1, \"b\": 2}"));
		assert!(Matcher::BodyIncludes("\"a\"".into()).matches(&req));
		assert!(Matcher::JsonBody(serde_json::json!({"a": 1})).matches(&req));
		req.body = CapturedBody::Discarded;
		assert!(!Matcher::BodyIncludes("\"a\"".into()).matches(&req));
		assert!(Matcher::BodyIncludes("".into()).matches(&req));
	}

	#[test]
	fn cookie_matching() {
		let mut req = get("/p");
		let head = Arc::get_mut(&mut req.head).unwrap();
		head.headers.insert(
			header::COOKIE,
			HeaderValue::from_static("session=abc; theme=dark"),
		);
		assert!(Matcher::Cookie("theme".into(), "dark".into()).matches(&req));
		assert!(!Matcher::Cookie("theme".into(), "light".into()).matches(&req));
	}

	#[test]
	fn combinators_and_always() {
		assert!(Matcher::always().matches(&get("/whatever")));
		let m = Matcher::All(vec![
			Matcher::Method(Method::GET),
			Matcher::Url("/a".into()),
		]);
		assert!(m.matches(&get("/a")));
		let m = Matcher::Any(vec![
			Matcher::Url("/a".into()),
			Matcher::Url("/b".into()),
		]);
		assert!(m.matches(&get("/b")));
		assert!(!m.matches(&get("/c")));
	}
}

use std::str::FromStr;
use std::time::Duration;

use crate::http::{HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode, header};

/// User-facing CORS configuration. `CorsOptions::default()` (what `cors:
/// true` expands to) allows everything, which is what test suites almost
/// always want from a mock.
#[derive(Debug, Clone)]
pub struct CorsOptions {
	pub allow_origins: Vec<String>,
	pub allow_methods: Vec<String>,
	pub allow_headers: Vec<String>,
	pub expose_headers: Vec<String>,
	pub allow_credentials: bool,
	pub max_age: Option<Duration>,
}

impl Default for CorsOptions {
	fn default() -> Self {
		CorsOptions {
			allow_origins: vec!["*".to_string()],
			allow_methods: vec!["*".to_string()],
			allow_headers: vec!["*".to_string()],
			expose_headers: vec![],
			allow_credentials: false,
			max_age: None,
		}
	}
}

#[derive(Default, Debug, Clone)]
enum WildcardOrList<T> {
	#[default]
	None,
	Wildcard,
	List(Vec<T>),
}

impl<T: FromStr> TryFrom<Vec<String>> for WildcardOrList<T> {
	type Error = T::Err;

	fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
		if value.contains(&"*".to_string()) {
			Ok(WildcardOrList::Wildcard)
		} else if value.is_empty() {
			Ok(WildcardOrList::None)
		} else {
			let vec: Vec<T> = value
				.into_iter()
				.map(|v| T::from_str(&v))
				.collect::<Result<_, _>>()?;
			Ok(WildcardOrList::List(vec))
		}
	}
}

impl<T: ToString> WildcardOrList<T> {
	fn to_header_value(&self) -> Option<HeaderValue> {
		match self {
			WildcardOrList::None => None,
			WildcardOrList::Wildcard => Some(HeaderValue::from_static("*")),
			WildcardOrList::List(list) => {
				let value = list
					.iter()
					.map(|item| item.to_string())
					.collect::<Vec<_>>()
					.join(",");
				HeaderValue::from_str(&value).ok()
			},
		}
	}
}

/// Validated CORS policy, applied to preflights before rule dispatch and to
/// mocked responses afterwards.
#[derive(Debug, Clone)]
pub struct CorsPolicy {
	allow_credentials: bool,
	allow_headers: WildcardOrList<HeaderName>,
	allow_methods: WildcardOrList<Method>,
	allow_origins: WildcardOrList<String>,
	expose_headers: WildcardOrList<HeaderName>,
	max_age: Option<HeaderValue>,
}

impl CorsPolicy {
	pub fn new(opts: CorsOptions) -> anyhow::Result<CorsPolicy> {
		Ok(CorsPolicy {
			allow_credentials: opts.allow_credentials,
			allow_headers: WildcardOrList::try_from(opts.allow_headers)?,
			allow_methods: WildcardOrList::try_from(opts.allow_methods)?,
			allow_origins: WildcardOrList::try_from(opts.allow_origins)
				.map_err(|never| -> anyhow::Error { match never {} })?,
			expose_headers: WildcardOrList::try_from(opts.expose_headers)?,
			max_age: opts
				.max_age
				.map(|v| HeaderValue::from_str(&v.as_secs().to_string()))
				.transpose()?,
		})
	}

	fn origin_allowed(&self, origin: &HeaderValue) -> bool {
		match &self.allow_origins {
			WildcardOrList::None => false,
			WildcardOrList::Wildcard => true,
			WildcardOrList::List(origins) => {
				let os = origin.as_bytes();
				origins.iter().any(|want| want.as_bytes() == os)
			},
		}
	}

	/// Answers a preflight directly, ahead of rule dispatch. A request is a
	/// preflight when it is an OPTIONS with both an Origin and a requested
	/// method.
	pub fn preflight(&self, method: &Method, headers: &HeaderMap) -> Option<Response> {
		if method != Method::OPTIONS {
			return None;
		}
		let origin = headers.get(header::ORIGIN)?;
		headers.get(header::ACCESS_CONTROL_REQUEST_METHOD)?;
		if !self.origin_allowed(origin) {
			return None;
		}
		let mut rb = ::http::Response::builder()
			.status(StatusCode::NO_CONTENT)
			.header(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
		if let Some(h) = self.allow_methods.to_header_value() {
			rb = rb.header(header::ACCESS_CONTROL_ALLOW_METHODS, h);
		}
		if let Some(h) = self.allow_headers.to_header_value() {
			rb = rb.header(header::ACCESS_CONTROL_ALLOW_HEADERS, h);
		}
		if self.allow_credentials {
			rb = rb.header(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HEADER_VALUE_TRUE);
		}
		if let Some(h) = &self.max_age {
			rb = rb.header(header::ACCESS_CONTROL_MAX_AGE, h);
		}
		Some(
			rb.body(crate::http::empty_body())
				.expect("preflight response must build"),
		)
	}

	/// Adds the response-side headers to a non-preflight exchange.
	pub fn apply(&self, request_headers: &HeaderMap, response: &mut Response) {
		let Some(origin) = request_headers.get(header::ORIGIN) else {
			return;
		};
		if !self.origin_allowed(origin) {
			return;
		}
		let headers = response.headers_mut();
		headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
		if self.allow_credentials {
			headers.insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HEADER_VALUE_TRUE);
		}
		if let Some(h) = self.expose_headers.to_header_value() {
			headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, h);
		}
	}
}

const HEADER_VALUE_TRUE: HeaderValue = HeaderValue::from_static("true");

#[cfg(test)]
mod tests {
	use super::*;

	fn permissive() -> CorsPolicy {
		CorsPolicy::new(CorsOptions::default()).unwrap()
	}

	#[test]
	fn preflight_is_answered() {
		let mut headers = HeaderMap::new();
		headers.insert(header::ORIGIN, HeaderValue::from_static("http://a.test"));
		headers.insert(
			header::ACCESS_CONTROL_REQUEST_METHOD,
			HeaderValue::from_static("POST"),
		);
		let resp = permissive().preflight(&Method::OPTIONS, &headers).unwrap();
		assert_eq!(resp.status(), StatusCode::NO_CONTENT);
		assert_eq!(
			resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
			"http://a.test"
		);
	}

	#[test]
	fn plain_options_is_not_a_preflight() {
		let headers = HeaderMap::new();
		assert!(permissive().preflight(&Method::OPTIONS, &headers).is_none());
	}

	#[test]
	fn response_headers_are_injected_for_matching_origin() {
		let mut req_headers = HeaderMap::new();
		req_headers.insert(header::ORIGIN, HeaderValue::from_static("http://a.test"));
		let mut resp = crate::http::plain_response(StatusCode::OK, "ok");
		permissive().apply(&req_headers, &mut resp);
		assert!(resp.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
	}
}

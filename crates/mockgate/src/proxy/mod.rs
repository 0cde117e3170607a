pub(crate) mod exec;
pub(crate) mod listener;
pub(crate) mod serve;
pub(crate) mod upstream;
pub(crate) mod websocket;

use crate::http::{Response, StatusCode, plain_response};

/// Per-request failures. Every variant is local to its exchange; the
/// listener survives all of them.
#[derive(thiserror::Error, Debug)]
pub(crate) enum ProxyError {
	#[error("user callback failed: {0}")]
	HandlerFailed(String),
	#[error("user callback did not complete in time")]
	HandlerTimeout,
	#[error("rewrite callback failed: {0}")]
	RewriteFailed(String),
	#[error("rewrite callback did not complete in time")]
	RewriteTimeout,
	#[error("request to upstream failed: {0}")]
	UpstreamFailed(String),
	#[error("request to upstream timed out")]
	UpstreamTimeout,
	#[error("protocol upgrade failed: {0}")]
	UpgradeFailed(String),
	#[error("could not read response file: {0}")]
	FileRead(String),
	#[error("request processing failed: {0}")]
	Processing(String),
}

impl ProxyError {
	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::HandlerFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::HandlerTimeout => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::FileRead(_) => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,

			ProxyError::RewriteFailed(_) => StatusCode::BAD_GATEWAY,
			ProxyError::RewriteTimeout => StatusCode::BAD_GATEWAY,
			ProxyError::UpstreamFailed(_) => StatusCode::BAD_GATEWAY,
			ProxyError::UpgradeFailed(_) => StatusCode::BAD_GATEWAY,

			ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
		}
	}

	pub fn into_response(self) -> Response {
		plain_response(self.status(), self.to_string())
	}
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::http::cors::{CorsOptions, CorsPolicy};
use crate::tls::MintingAuthority;

/// Whether h2 is offered in the TLS ALPN list. `Fallback` (the default)
/// offers h2 only to clients that did not advertise http/1.1 themselves;
/// without HTTPS configured it behaves as `Disabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Http2Mode {
	Enabled,
	Disabled,
	#[default]
	Fallback,
}

/// CORS auto-handling. `Enabled` expands to the permissive
/// [`CorsOptions::default`].
#[derive(Debug, Clone, Default)]
pub enum CorsSetting {
	#[default]
	Disabled,
	Enabled,
	Custom(CorsOptions),
}

/// TLS identity of the man-in-the-middle CA. Exactly one of the inline PEM
/// pair or the file-path pair must be set.
#[derive(Debug, Clone, Default)]
pub struct HttpsOptions {
	pub key: Option<String>,
	pub cert: Option<String>,
	pub key_path: Option<PathBuf>,
	pub cert_path: Option<PathBuf>,
}

impl HttpsOptions {
	pub fn from_pem(key: impl Into<String>, cert: impl Into<String>) -> Self {
		HttpsOptions {
			key: Some(key.into()),
			cert: Some(cert.into()),
			..Default::default()
		}
	}

	pub fn from_paths(key_path: impl Into<PathBuf>, cert_path: impl Into<PathBuf>) -> Self {
		HttpsOptions {
			key_path: Some(key_path.into()),
			cert_path: Some(cert_path.into()),
			..Default::default()
		}
	}

	fn load(&self) -> Result<(String, String), ConfigError> {
		match (&self.key, &self.cert, &self.key_path, &self.cert_path) {
			(Some(key), Some(cert), None, None) => Ok((key.clone(), cert.clone())),
			(None, None, Some(key_path), Some(cert_path)) => {
				let key = std::fs::read_to_string(key_path)
					.map_err(|e| ConfigError::TlsIdentityRead(key_path.clone(), e))?;
				let cert = std::fs::read_to_string(cert_path)
					.map_err(|e| ConfigError::TlsIdentityRead(cert_path.clone(), e))?;
				Ok((key, cert))
			},
			_ => Err(ConfigError::TlsIdentity),
		}
	}
}

/// Server options. The defaults match what a test suite usually wants: record
/// traffic, suggest rule changes on misses, no TLS, no CORS handling.
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub cors: CorsSetting,
	pub debug: bool,
	pub https: Option<HttpsOptions>,
	pub http2: Http2Mode,
	pub suggest_changes: bool,
	pub record_traffic: bool,
	/// Byte cap for in-memory body capture. Bodies above the cap are treated
	/// as empty by matchers but still stream through passthrough rules.
	pub max_body_size: usize,
	/// Bound on user callbacks (`then_callback`, passthrough rewrites).
	pub callback_timeout: Duration,
	/// How long `stop()` waits for in-flight exchanges before hard-closing.
	pub shutdown_grace: Duration,
	/// Deprecated: per-rule `ignore_host_certificate_errors` supersedes this
	/// server-wide WebSocket trust bypass. Still honored as the default for
	/// WS passthrough rules that do not set their own list.
	pub ignore_websocket_host_certificate_errors: Vec<String>,
}

impl Default for ServerConfig {
	fn default() -> Self {
		ServerConfig {
			cors: CorsSetting::Disabled,
			debug: false,
			https: None,
			http2: Http2Mode::default(),
			suggest_changes: true,
			record_traffic: true,
			max_body_size: usize::MAX,
			callback_timeout: Duration::from_secs(5),
			shutdown_grace: Duration::from_millis(500),
			ignore_websocket_host_certificate_errors: vec![],
		}
	}
}

impl ServerConfig {
	pub(crate) fn validate(self) -> Result<Options, ConfigError> {
		let cors = match self.cors {
			CorsSetting::Disabled => None,
			CorsSetting::Enabled => Some(
				CorsPolicy::new(CorsOptions::default()).map_err(|e| ConfigError::Cors(e.to_string()))?,
			),
			CorsSetting::Custom(opts) => {
				Some(CorsPolicy::new(opts).map_err(|e| ConfigError::Cors(e.to_string()))?)
			},
		};
		let tls = match &self.https {
			Some(https) => {
				let (key, cert) = https.load()?;
				Some(Arc::new(MintingAuthority::from_pem(&key, &cert)?))
			},
			None => None,
		};
		// Fallback needs the client's ALPN list, which only exists with TLS.
		let http2 = if tls.is_none() && self.http2 == Http2Mode::Fallback {
			Http2Mode::Disabled
		} else {
			self.http2
		};
		Ok(Options {
			cors,
			debug: self.debug,
			tls,
			http2,
			suggest_changes: self.suggest_changes,
			record_traffic: self.record_traffic,
			max_body_size: self.max_body_size,
			callback_timeout: self.callback_timeout,
			shutdown_grace: self.shutdown_grace,
			ws_ignore_cert_errors: self.ignore_websocket_host_certificate_errors,
		})
	}
}

/// Validated options, as the runtime consumes them.
#[derive(Debug)]
pub(crate) struct Options {
	pub cors: Option<CorsPolicy>,
	pub debug: bool,
	pub tls: Option<Arc<MintingAuthority>>,
	pub http2: Http2Mode,
	pub suggest_changes: bool,
	pub record_traffic: bool,
	pub max_body_size: usize,
	pub callback_timeout: Duration,
	pub shutdown_grace: Duration,
	pub ws_ignore_cert_errors: Vec<String>,
}

/// Errors surfaced synchronously from the offending API call.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
	#[error("https requires exactly one of an inline key/cert pair or a key_path/cert_path pair")]
	TlsIdentity,
	#[error("failed to read TLS identity from {0}: {1}")]
	TlsIdentityRead(PathBuf, std::io::Error),
	#[error("invalid CA material: {0}")]
	Tls(#[from] crate::tls::Error),
	#[error("invalid CORS configuration: {0}")]
	Cors(String),
	#[error("options() rules cannot be registered while CORS auto-handling is enabled")]
	OptionsWithCors,
	#[error("a fallback rule is already registered")]
	FallbackExists,
	#[error("a fallback rule must match unconditionally")]
	FallbackMatcher,
	#[error("server is already running")]
	AlreadyRunning,
	#[error("server is not running")]
	NotRunning,
	#[error("invalid rule: {0}")]
	InvalidRule(String),
}

/// Errors surfaced from `start()`.
#[derive(thiserror::Error, Debug)]
pub enum ServerError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("no free port in {start}..={end}")]
	PortRangeExhausted { start: u16, end: u16 },
	#[error("failed to bind: {0}")]
	Bind(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn https_rejects_mixed_identity() {
		let https = HttpsOptions {
			key: Some("k".into()),
			cert: None,
			key_path: Some("p".into()),
			cert_path: None,
		};
		assert!(matches!(https.load(), Err(ConfigError::TlsIdentity)));
	}

	#[test]
	fn fallback_without_https_behaves_as_disabled() {
		let opts = ServerConfig {
			http2: Http2Mode::Fallback,
			..Default::default()
		}
		.validate()
		.unwrap();
		assert_eq!(opts.http2, Http2Mode::Disabled);
	}
}

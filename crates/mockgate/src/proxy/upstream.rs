use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tower::Service;
use tracing::{debug, error, warn};

use crate::client::dns::Resolver;
use crate::http::exchange::RequestHead;
use crate::http::{
	Body, BoxError, HeaderValue, RequestUpgrade, Response, Scheme, StatusCode, Uri, header,
	strip_hop_headers, upgrade_type,
};
use crate::proxy::ProxyError;
use crate::rules::handler::{PassthroughRequest, PassthroughResponse, PassthroughSpec};
use crate::tls;
use crate::tls::verify::{AcceptAnyServerCert, destination_matches};
use crate::transport::stream::Socket;

/// How long a pooled upstream connection may sit idle before being dropped.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

type PooledClient = legacy::Client<Connector, Body>;

/// Outbound HTTP(S) client for passthrough rules. Connections are reused per
/// (scheme, host, port); TLS verifies against the system roots unless the
/// destination matched the rule's trust-bypass list, which selects the
/// insecure client for that exchange only.
pub(crate) struct PassthroughClient {
	resolver: Arc<Resolver>,
	trusted: PooledClient,
	insecure: PooledClient,
	trusted_ws: Arc<ClientConfig>,
	insecure_ws: Arc<ClientConfig>,
}

impl PassthroughClient {
	pub fn new() -> Self {
		let resolver = Arc::new(Resolver::system());
		let trusted_tls = Arc::new(with_alpn(trusted_config(), true));
		let insecure_tls = Arc::new(with_alpn(insecure_config(), true));
		// WebSocket handshakes are HTTP/1.1 only, so their configs skip ALPN.
		let trusted_ws = Arc::new(with_alpn(trusted_config(), false));
		let insecure_ws = Arc::new(with_alpn(insecure_config(), false));
		PassthroughClient {
			trusted: build_client(resolver.clone(), trusted_tls),
			insecure: build_client(resolver.clone(), insecure_tls),
			trusted_ws,
			insecure_ws,
			resolver,
		}
	}

	pub async fn dial(&self, host: &str, port: u16) -> anyhow::Result<Socket> {
		let ip = self.resolver.resolve(host).await?;
		Socket::dial(SocketAddr::from((ip, port))).await
	}

	/// TLS connector handed to the WebSocket bridge for wss upstreams.
	pub fn ws_tls_config(&self, insecure: bool) -> Arc<ClientConfig> {
		if insecure {
			self.insecure_ws.clone()
		} else {
			self.trusted_ws.clone()
		}
	}

	/// Runs a full passthrough exchange: destination overrides, optional
	/// rewrite callbacks, streamed bodies in both directions, and upgrade
	/// piping when the origin switches protocols.
	#[allow(clippy::too_many_arguments)]
	pub async fn passthrough(
		&self,
		spec: &PassthroughSpec,
		head: &RequestHead,
		body: Body,
		upgrade: Option<RequestUpgrade>,
		callback_timeout: Duration,
	) -> Result<Response, ProxyError> {
		let (scheme, host, port) = destination(spec, head);
		let authority = authority_for(&scheme, &host, port);

		let mut headers = head.headers.clone();
		let restored_upgrade = upgrade_type(&headers);
		strip_hop_headers(&mut headers);
		if let Some(u) = &restored_upgrade {
			headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
			headers.insert(header::UPGRADE, u.clone());
		}
		// The Host header follows the destination override; an untouched
		// target keeps the client's original value.
		if spec.target.is_some() {
			headers.insert(
				header::HOST,
				HeaderValue::from_str(&authority)
					.map_err(|e| ProxyError::Processing(e.to_string()))?,
			);
		}

		let path_and_query = match &head.query {
			Some(q) => format!("{}?{}", head.path, q),
			None => head.path.clone(),
		};
		let mut uri = Uri::builder()
			.scheme(scheme.clone())
			.authority(authority)
			.path_and_query(path_and_query)
			.build()
			.map_err(|e| ProxyError::Processing(e.to_string()))?;

		let mut method = head.method.clone();
		let mut out_body = body;

		if let Some(rewrite) = &spec.before_request {
			let bytes = out_body
				.collect()
				.await
				.map_err(|e| ProxyError::Processing(format!("failed to read request body: {e}")))?
				.to_bytes();
			let seen = PassthroughRequest {
				method: method.clone(),
				url: uri.to_string(),
				headers: headers.clone(),
				body: Some(bytes.clone()),
			};
			let rewritten = tokio::time::timeout(callback_timeout, rewrite(seen))
				.await
				.map_err(|_| ProxyError::RewriteTimeout)?
				.map_err(|e| ProxyError::RewriteFailed(e.to_string()))?;
			method = rewritten.method;
			uri = rewritten
				.url
				.parse::<Uri>()
				.map_err(|e| ProxyError::RewriteFailed(format!("invalid rewritten URL: {e}")))?;
			headers = rewritten.headers;
			out_body = match rewritten.body {
				Some(b) => {
					headers.remove(header::CONTENT_LENGTH);
					headers.insert(header::CONTENT_LENGTH, HeaderValue::from(b.len()));
					crate::http::full_body(b)
				},
				None => crate::http::full_body(bytes),
			};
		}

		let mut out_req = ::http::Request::builder()
			.method(method)
			.uri(uri)
			.body(out_body)
			.map_err(|e| ProxyError::Processing(e.to_string()))?;
		*out_req.headers_mut() = headers;

		let insecure = destination_matches(&spec.ignore_host_certificate_errors, &host, port);
		if insecure {
			debug!(host, port, "certificate verification disabled for this exchange");
		}
		let client = if insecure { &self.insecure } else { &self.trusted };

		debug!(method = %out_req.method(), uri = %out_req.uri(), "forwarding to upstream");
		let resp = client.request(out_req).await.map_err(classify)?;
		let mut resp: Response = resp.map(|b| Body::new(b.map_err(BoxError::from)));

		if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
			return handle_upgrade(upgrade, resp).await;
		}
		strip_hop_headers(resp.headers_mut());

		if let Some(rewrite) = &spec.before_response {
			let (mut parts, body) = resp.into_parts();
			let bytes = body
				.collect()
				.await
				.map_err(|e| ProxyError::UpstreamFailed(format!("failed to read response body: {e}")))?
				.to_bytes();
			let seen = PassthroughResponse {
				status: parts.status,
				headers: parts.headers.clone(),
				body: bytes,
			};
			let rewritten = tokio::time::timeout(callback_timeout, rewrite(seen))
				.await
				.map_err(|_| ProxyError::RewriteTimeout)?
				.map_err(|e| ProxyError::RewriteFailed(e.to_string()))?;
			parts.status = rewritten.status;
			parts.headers = rewritten.headers;
			parts.headers.remove(header::CONTENT_LENGTH);
			parts
				.headers
				.insert(header::CONTENT_LENGTH, HeaderValue::from(rewritten.body.len()));
			resp = Response::from_parts(parts, crate::http::full_body(rewritten.body));
		}

		Ok(resp)
	}
}

pub(crate) fn destination(spec: &PassthroughSpec, head: &RequestHead) -> (Scheme, String, u16) {
	match &spec.target {
		None => (head.scheme.clone(), head.host.clone(), head.port),
		Some(t) => {
			let scheme = t.scheme.clone().unwrap_or_else(|| head.scheme.clone());
			let host = t.host.clone().unwrap_or_else(|| head.host.clone());
			let port = t
				.port
				.unwrap_or_else(|| default_port(&scheme));
			(scheme, host, port)
		},
	}
}

fn default_port(scheme: &Scheme) -> u16 {
	if scheme == &Scheme::HTTPS { 443 } else { 80 }
}

pub(crate) fn authority_for(scheme: &Scheme, host: &str, port: u16) -> String {
	if port == default_port(scheme) {
		host.to_string()
	} else {
		format!("{host}:{port}")
	}
}

/// 504 for timeouts anywhere in the chain, 502 for everything else.
fn classify(e: legacy::Error) -> ProxyError {
	let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&e);
	while let Some(err) = source {
		if let Some(io) = err.downcast_ref::<std::io::Error>()
			&& io.kind() == std::io::ErrorKind::TimedOut
		{
			return ProxyError::UpstreamTimeout;
		}
		source = err.source();
	}
	ProxyError::UpstreamFailed(e.to_string())
}

/// Splices the client and origin byte streams once both sides agreed on a
/// protocol switch.
async fn handle_upgrade(
	req_upgrade: Option<RequestUpgrade>,
	mut resp: Response,
) -> Result<Response, ProxyError> {
	let Some(RequestUpgrade {
		upgrade_type: requested,
		upgrade,
	}) = req_upgrade
	else {
		return Err(ProxyError::UpgradeFailed(
			"origin switched protocols but the client did not ask to".to_string(),
		));
	};
	let offered = upgrade_type(resp.headers());
	if offered.as_ref() != Some(&requested) {
		return Err(ProxyError::UpgradeFailed(format!(
			"client requested {requested:?} but origin offered {offered:?}"
		)));
	}
	let response_upgraded = resp
		.extensions_mut()
		.remove::<OnUpgrade>()
		.ok_or_else(|| ProxyError::UpgradeFailed("origin response cannot be upgraded".to_string()))?;
	tokio::spawn(async move {
		let origin = match response_upgraded.await {
			Ok(u) => u,
			Err(e) => {
				error!("origin upgrade failed: {e}");
				return;
			},
		};
		let client = match upgrade.await {
			Ok(u) => u,
			Err(e) => {
				error!("client upgrade failed: {e}");
				return;
			},
		};
		let _ = tokio::io::copy_bidirectional(
			&mut TokioIo::new(client),
			&mut TokioIo::new(origin),
		)
		.await;
	});
	Ok(resp)
}

fn build_client(resolver: Arc<Resolver>, tls: Arc<ClientConfig>) -> PooledClient {
	legacy::Client::builder(TokioExecutor::new())
		.pool_idle_timeout(POOL_IDLE_TIMEOUT)
		.pool_timer(TokioTimer::new())
		.timer(TokioTimer::new())
		.build(Connector { resolver, tls })
}

fn trusted_config() -> ClientConfig {
	let mut roots = RootCertStore::empty();
	let result = rustls_native_certs::load_native_certs();
	for e in &result.errors {
		warn!("failed to load a native root certificate: {e}");
	}
	let (_, invalid) = roots.add_parsable_certificates(result.certs);
	if invalid > 0 {
		warn!("ignored {invalid} unparsable native root certificates");
	}
	ClientConfig::builder_with_provider(tls::provider())
		.with_protocol_versions(tls::ALL_TLS_VERSIONS)
		.expect("client config must accept the standard TLS versions")
		.with_root_certificates(roots)
		.with_no_client_auth()
}

fn insecure_config() -> ClientConfig {
	ClientConfig::builder_with_provider(tls::provider())
		.with_protocol_versions(tls::ALL_TLS_VERSIONS)
		.expect("client config must accept the standard TLS versions")
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new(tls::provider())))
		.with_no_client_auth()
}

fn with_alpn(mut cfg: ClientConfig, offer_h2: bool) -> ClientConfig {
	cfg.alpn_protocols = if offer_h2 {
		vec![b"h2".to_vec(), b"http/1.1".to_vec()]
	} else {
		vec![]
	};
	cfg
}

/// Dials the destination, optionally wrapping it in client TLS. The pooled
/// client keys connections by the request authority, which gives the
/// per-(scheme, host, port) reuse policy.
#[derive(Clone)]
struct Connector {
	resolver: Arc<Resolver>,
	tls: Arc<ClientConfig>,
}

impl Service<Uri> for Connector {
	type Response = TokioIo<Socket>;
	type Error = BoxError;
	type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

	fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, uri: Uri) -> Self::Future {
		let resolver = self.resolver.clone();
		let tls = self.tls.clone();
		Box::pin(async move {
			let host = uri.host().ok_or("upstream URI has no host")?.to_string();
			let port = crate::http::effective_port(&uri);
			let ip = resolver.resolve(&host).await?;
			let sock = Socket::dial(SocketAddr::from((ip, port))).await?;
			if uri.scheme() == Some(&Scheme::HTTPS) {
				let server_name = ServerName::try_from(host)?;
				let stream = TlsConnector::from(tls)
					.connect(server_name, Box::new(sock))
					.await?;
				Ok(TokioIo::new(Socket::from_tls(stream.into())))
			} else {
				Ok(TokioIo::new(sock))
			}
		})
	}
}

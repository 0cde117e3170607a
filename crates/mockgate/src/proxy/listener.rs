use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

use futures_util::pin_mut;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, warn};

use crate::ServerInputs;
use crate::config::ServerError;
use crate::events::{ClientFailure, Event, TlsClientFailure};
use crate::http::{Authority, BoxError, Method, Response, StatusCode, plain_response};
use crate::proxy::serve::{self, ConnectionContext, TerminatedByRule};
use crate::tls;
use crate::transport::stream::Socket;

/// How `start()` picks the listening port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSpec {
	/// Bind port 0 and let the OS choose.
	Ephemeral,
	Exact(u16),
	/// Try each port in order; the first successful bind wins.
	Range { start: u16, end: u16 },
}

impl Default for PortSpec {
	fn default() -> Self {
		PortSpec::Ephemeral
	}
}

impl From<u16> for PortSpec {
	fn from(port: u16) -> Self {
		if port == 0 {
			PortSpec::Ephemeral
		} else {
			PortSpec::Exact(port)
		}
	}
}

impl From<std::ops::RangeInclusive<u16>> for PortSpec {
	fn from(range: std::ops::RangeInclusive<u16>) -> Self {
		PortSpec::Range {
			start: *range.start(),
			end: *range.end(),
		}
	}
}

pub(crate) async fn bind(spec: &PortSpec) -> Result<TcpListener, ServerError> {
	let any = Ipv4Addr::UNSPECIFIED;
	match spec {
		PortSpec::Ephemeral => Ok(TcpListener::bind(SocketAddr::from((any, 0))).await?),
		PortSpec::Exact(port) => Ok(TcpListener::bind(SocketAddr::from((any, *port))).await?),
		PortSpec::Range { start, end } => {
			for port in *start..=*end {
				match TcpListener::bind(SocketAddr::from((any, port))).await {
					Ok(l) => return Ok(l),
					Err(e) => debug!(port, "bind attempt failed: {e}"),
				}
			}
			Err(ServerError::PortRangeExhausted {
				start: *start,
				end: *end,
			})
		},
	}
}

/// Accept loop. Runs until aborted by `stop()`; each connection gets its own
/// task holding a drain watch, raced against the force-shutdown channel once
/// the grace window expires.
pub(crate) async fn run(
	inputs: Arc<ServerInputs>,
	listener: TcpListener,
	drain: drain::Watch,
	force: watch::Receiver<()>,
) {
	loop {
		let (stream, _peer) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!("accept failed: {e}");
				continue;
			},
		};
		let sock = match Socket::from_tcp(stream) {
			Ok(s) => s,
			Err(e) => {
				warn!("failed to adopt connection: {e}");
				continue;
			},
		};
		let inputs = inputs.clone();
		let drain = drain.clone();
		let mut force = force.clone();
		tokio::spawn(async move {
			tokio::select! {
				_ = handle_connection(inputs, sock, None, drain) => {}
				_ = force.changed() => {
					debug!("connection forcefully terminated");
				}
			}
		});
	}
}

/// One accepted (or tunneled) byte stream: peek the first byte to decide
/// between TLS termination and plain HTTP, then serve.
///
/// Boxed explicitly (rather than a plain `async fn`) because this function
/// is reachable from inside its own body via the nested-MITM CONNECT path in
/// `handle_connect`, and leaving the recursive call site to rely on the
/// anonymous opaque future type here trips a higher-ranked `Send` inference
/// failure over `&Authority` during auto-trait checking.
pub(crate) fn handle_connection(
	inputs: Arc<ServerInputs>,
	mut sock: Socket,
	tunnel: Option<Authority>,
	drain: drain::Watch,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
	Box::pin(async move {
		let peer = sock.tcp().peer_addr;
		let tls_configured = inputs.opts.tls.is_some();
		match sock.peek_byte().await {
			Err(e) => {
				inputs.events.publish(Event::ClientError(Arc::new(ClientFailure {
					peer: Some(peer),
					reason: format!("connection failed before a request arrived: {e}"),
				})));
			},
			Ok(None) => {
				// An https-capable endpoint treats a silent disconnect as a
				// failed handshake, SNI unknown.
				if tls_configured {
					inputs.events.publish(Event::TlsClientError(Arc::new(TlsClientFailure {
						peer: Some(peer),
						server_name: None,
						reason: "connection closed before the TLS handshake completed".to_string(),
					})));
				}
			},
			// 0x16: TLS handshake record.
			Ok(Some(0x16)) if tls_configured => {
				match terminate_tls(&inputs, sock, tunnel.clone()).await {
					Ok(tls_sock) => serve_http(inputs, tls_sock, tunnel, drain).await,
					Err((server_name, reason)) => {
						debug!(?server_name, "TLS termination failed: {reason}");
						inputs.events.publish(Event::TlsClientError(Arc::new(TlsClientFailure {
							peer: Some(peer),
							server_name,
							reason,
						})));
					},
				}
			},
			Ok(Some(_)) => serve_http(inputs, sock, tunnel, drain).await,
		}
	})
}

/// SNI-driven TLS termination. The leaf is minted (or fetched) per the
/// ClientHello's server name, falling back to the CONNECT destination for
/// SNI-less tunnels; the ALPN offer follows the configured h2 policy.
async fn terminate_tls(
	inputs: &Arc<ServerInputs>,
	sock: Socket,
	tunnel: Option<Authority>,
) -> Result<Socket, (Option<String>, String)> {
	let authority = inputs
		.opts
		.tls
		.clone()
		.expect("TLS termination requires a configured CA");
	let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), Box::new(sock));
	let start = acceptor.await.map_err(|e| (None, e.to_string()))?;
	let (server_name, client_alpn) = {
		let ch = start.client_hello();
		(
			ch.server_name().map(str::to_string),
			ch.alpn()
				.map(|protos| protos.map(|p| p.to_vec()).collect::<Vec<_>>()),
		)
	};
	let alpn_refs: Option<Vec<&[u8]>> = client_alpn
		.as_ref()
		.map(|list| list.iter().map(|p| p.as_slice()).collect());
	let alpn = tls::alpn_protocols(inputs.opts.http2, alpn_refs.as_deref());
	let default_name = tunnel.map(|a| a.host().to_string());
	let cfg = tls::server_config(authority, default_name, alpn)
		.map_err(|e| (server_name.clone(), e.to_string()))?;
	let stream = start
		.into_stream(cfg)
		.await
		.map_err(|e| (server_name.clone(), e.to_string()))?;
	Ok(Socket::from_tls(stream.into()))
}

/// Serves HTTP/1.1 and HTTP/2 on the stream (the auto builder detects the
/// prior-knowledge h2 preface on plaintext too), honoring graceful drain.
async fn serve_http(
	inputs: Arc<ServerInputs>,
	sock: Socket,
	tunnel: Option<Authority>,
	drain: drain::Watch,
) {
	let ctx = Arc::new(ConnectionContext {
		inputs: inputs.clone(),
		tcp: sock.tcp().clone(),
		tls: sock.tls_info().cloned(),
		ctrl: sock.ctrl(),
		tunnel,
		drain: drain.clone(),
	});
	let peer = ctx.tcp.peer_addr;
	let ctx_start = ctx.tcp.start;
	debug!(%peer, tls = ctx.tls.is_some(), "serving connection");

	let mut builder = auto::Builder::new(TokioExecutor::new());
	builder.http2().timer(TokioTimer::new());
	let service = hyper::service::service_fn(move |req: ::http::Request<Incoming>| {
		let ctx = ctx.clone();
		async move {
			let result = if req.method() == Method::CONNECT {
				handle_connect(&ctx, req)
			} else {
				serve::handle(&ctx, req).await
			};
			result.map_err(ServeError)
		}
	});
	let conn = builder.serve_connection_with_upgrades(TokioIo::new(sock), service);
	pin_mut!(conn);
	let res = tokio::select! {
		res = conn.as_mut() => res,
		shutdown = drain.clone().signaled() => {
			debug!(%peer, "draining connection");
			conn.as_mut().graceful_shutdown();
			let res = conn.as_mut().await;
			drop(shutdown);
			res
		}
	};
	if let Err(e) = res {
		if !is_rule_termination(e.as_ref()) {
			debug!(%peer, "connection ended with error: {e}");
			inputs.events.publish(Event::ClientError(Arc::new(ClientFailure {
				peer: Some(peer),
				reason: e.to_string(),
			})));
		}
	}
	debug!(%peer, dur = ?ctx_start.elapsed(), "connection closed");
}

/// Wraps a [`BoxError`] in a concrete type before handing it to hyper.
///
/// Using `BoxError` itself as the service's associated error type trips a
/// known rustc limitation (higher-ranked `From`/`Send` impls are not
/// considered general enough when the error type is already a boxed trait
/// object nested inside an opaque async fn). A concrete newtype sidesteps
/// it while preserving the original error as the `source()` of the chain,
/// so `is_rule_termination` still finds a wrapped `TerminatedByRule`.
#[derive(Debug)]
struct ServeError(BoxError);

impl std::fmt::Display for ServeError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		std::fmt::Display::fmt(&self.0, f)
	}
}

impl std::error::Error for ServeError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		Some(self.0.as_ref())
	}
}

fn is_rule_termination(e: &(dyn std::error::Error + 'static)) -> bool {
	let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(e);
	while let Some(err) = cur {
		if err.is::<TerminatedByRule>() {
			return true;
		}
		cur = err.source();
	}
	false
}

/// CONNECT tunneling. With HTTPS configured the tunnel loops back through
/// the protocol peek (nested MITM for explicit-proxy clients); without it
/// the bytes are spliced straight to the origin.
fn handle_connect(
	ctx: &Arc<ConnectionContext>,
	mut req: ::http::Request<Incoming>,
) -> Result<Response, BoxError> {
	let Some(authority) = req.uri().authority().cloned() else {
		return Ok(plain_response(
			StatusCode::BAD_REQUEST,
			"CONNECT requires an authority of the form host:port",
		));
	};
	debug!(%authority, "CONNECT tunnel requested");
	let on_upgrade = hyper::upgrade::on(&mut req);
	let ctx = ctx.clone();
	tokio::spawn(async move {
		let upgraded = match on_upgrade.await {
			Ok(u) => u,
			Err(e) => {
				debug!("CONNECT upgrade failed: {e}");
				return;
			},
		};
		let sock = Socket::from_tunnel(upgraded, ctx.tcp.clone(), ctx.ctrl.clone());
		if ctx.inputs.opts.tls.is_some() {
			let nested = handle_connection(ctx.inputs.clone(), sock, Some(authority), ctx.drain.clone());
			nested.await;
		} else {
			raw_tunnel(&ctx, sock, &authority).await;
		}
	});
	Ok(::http::Response::builder()
		.status(StatusCode::OK)
		.body(crate::http::empty_body())
		.expect("CONNECT response must build"))
}

/// Opaque byte splice to the origin, used when no CA is configured.
async fn raw_tunnel(ctx: &Arc<ConnectionContext>, mut sock: Socket, authority: &Authority) {
	let host = authority.host();
	let port = authority.port_u16().unwrap_or(443);
	match ctx.inputs.upstream.dial(host, port).await {
		Ok(mut origin) => {
			let _ = tokio::io::copy_bidirectional(&mut sock, &mut origin).await;
		},
		Err(e) => {
			debug!(host, port, "tunnel dial failed: {e}");
		},
	}
}

use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use headers::HeaderMapExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::{Connector, WebSocketStream, client_async_tls_with_config};
use tracing::{debug, warn};

use crate::ServerInputs;
use crate::http::exchange::{CapturedBody, ParsedRequest};
use crate::http::{
	HeaderMap, HeaderName, HeaderValue, Response, Scheme, StatusCode, empty_body, header,
};
use crate::proxy::exec::miss_response;
use crate::proxy::ProxyError;
use crate::proxy::upstream::{authority_for, destination};
use crate::rules::dispatch::{Dispatch, select_ws};
use crate::rules::handler::PassthroughSpec;
use crate::rules::{RuleState, WsHandler};
use crate::tls::verify::destination_matches;

pub(crate) struct WsOutcome {
	pub response: Response,
	pub captured: CapturedBody,
	pub matched: Option<Arc<RuleState<WsHandler>>>,
}

/// Handles an `Upgrade: websocket` request: dispatches the WebSocket rule
/// list, then either completes the handshake (echo, passthrough) or refuses
/// it with a plain HTTP response.
pub(crate) async fn handle(
	inputs: &Arc<ServerInputs>,
	parsed: &Arc<ParsedRequest>,
	req: &mut crate::http::Request,
) -> WsOutcome {
	let snapshot = inputs.rules.ws_snapshot();
	let rule = match select_ws(&snapshot, parsed, inputs.opts.suggest_changes) {
		Dispatch::Matched(rule) => rule,
		Dispatch::Miss(explanation) => {
			let (response, captured) = miss_response(explanation);
			return WsOutcome {
				response,
				captured,
				matched: None,
			};
		},
	};

	let outcome = match &rule.spec.handler {
		WsHandler::Reject { status, body } => {
			let captured = CapturedBody::Complete(body.clone());
			let response = crate::http::plain_response(*status, body.clone());
			WsOutcome {
				response,
				captured,
				matched: Some(rule.clone()),
			}
		},
		WsHandler::Echo => match accept_response(req.headers(), None) {
			None => bad_handshake(rule.clone()),
			Some(response) => {
				let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
					return bad_handshake(rule.clone());
				};
				tokio::spawn(async move {
					match on_upgrade.await {
						Ok(upgraded) => {
							let ws = WebSocketStream::from_raw_socket(
								TokioIo::new(upgraded),
								Role::Server,
								None,
							)
							.await;
							echo(ws).await;
						},
						Err(e) => warn!("websocket upgrade failed: {e}"),
					}
				});
				WsOutcome {
					response,
					captured: CapturedBody::Empty,
					matched: Some(rule.clone()),
				}
			},
		},
		WsHandler::Passthrough(spec) => match connect_upstream(inputs, parsed, spec).await {
			Err(e) => WsOutcome {
				response: e.into_response(),
				captured: CapturedBody::Discarded,
				matched: Some(rule.clone()),
			},
			Ok((upstream_ws, subprotocol)) => {
				match accept_response(req.headers(), subprotocol) {
					None => bad_handshake(rule.clone()),
					Some(response) => {
						let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
							return bad_handshake(rule.clone());
						};
						tokio::spawn(async move {
							match on_upgrade.await {
								Ok(upgraded) => {
									let client_ws = WebSocketStream::from_raw_socket(
										TokioIo::new(upgraded),
										Role::Server,
										None,
									)
									.await;
									pipe(client_ws, upstream_ws).await;
								},
								Err(e) => warn!("websocket upgrade failed: {e}"),
							}
						});
						WsOutcome {
							response,
							captured: CapturedBody::Empty,
							matched: Some(rule.clone()),
						}
					},
				}
			},
		},
	};
	outcome
}

fn bad_handshake(rule: Arc<RuleState<WsHandler>>) -> WsOutcome {
	let response =
		crate::http::plain_response(StatusCode::BAD_REQUEST, "invalid websocket handshake");
	WsOutcome {
		response,
		captured: CapturedBody::Discarded,
		matched: Some(rule),
	}
}

/// The 101 completing the client handshake, echoing the upstream-selected
/// subprotocol for passthrough bridges.
fn accept_response(headers: &HeaderMap, subprotocol: Option<HeaderValue>) -> Option<Response> {
	let key = headers.typed_get::<headers::SecWebsocketKey>()?;
	let accept = headers::SecWebsocketAccept::from(key);
	let mut response = ::http::Response::builder()
		.status(StatusCode::SWITCHING_PROTOCOLS)
		.body(empty_body())
		.expect("upgrade response must build");
	response
		.headers_mut()
		.typed_insert(headers::Connection::upgrade());
	response
		.headers_mut()
		.typed_insert(headers::Upgrade::websocket());
	response.headers_mut().typed_insert(accept);
	if let Some(p) = subprotocol {
		response
			.headers_mut()
			.insert(header::SEC_WEBSOCKET_PROTOCOL, p);
	}
	Some(response)
}

type UpstreamWs = WebSocketStream<tokio_tungstenite::MaybeTlsStream<crate::transport::stream::Socket>>;

/// Opens the upstream WebSocket for a passthrough rule, forwarding the
/// client's non-handshake headers and applying the trust-bypass policy.
async fn connect_upstream(
	inputs: &Arc<ServerInputs>,
	parsed: &Arc<ParsedRequest>,
	spec: &PassthroughSpec,
) -> Result<(UpstreamWs, Option<HeaderValue>), ProxyError> {
	let (scheme, host, port) = destination(spec, &parsed.head);
	let ws_scheme = if scheme == Scheme::HTTPS { "wss" } else { "ws" };
	let authority = authority_for(&scheme, &host, port);
	let mut url = format!("{ws_scheme}://{authority}{}", parsed.head.path);
	if let Some(q) = &parsed.head.query {
		url.push('?');
		url.push_str(q);
	}

	let mut request = ::http::Request::builder()
		.uri(url.as_str())
		.body(())
		.map_err(|e| ProxyError::Processing(e.to_string()))?;
	for (name, value) in parsed.head.headers.iter() {
		// The handshake machinery generates its own connection management
		// and key headers.
		if is_handshake_header(name) {
			continue;
		}
		request.headers_mut().append(name.clone(), value.clone());
	}

	let ignore = if spec.ignore_host_certificate_errors.is_empty() {
		&inputs.opts.ws_ignore_cert_errors
	} else {
		&spec.ignore_host_certificate_errors
	};
	let insecure = destination_matches(ignore, &host, port);
	let tls = inputs.upstream.ws_tls_config(insecure);

	let sock = inputs
		.upstream
		.dial(&host, port)
		.await
		.map_err(|e| ProxyError::UpstreamFailed(e.to_string()))?;
	let (ws, resp) = client_async_tls_with_config(request, sock, None, Some(Connector::Rustls(tls)))
		.await
		.map_err(|e| ProxyError::UpstreamFailed(format!("websocket connect to {url} failed: {e}")))?;
	debug!(%url, "websocket passthrough connected");
	let subprotocol = resp.headers().get(header::SEC_WEBSOCKET_PROTOCOL).cloned();
	Ok((ws, subprotocol))
}

fn is_handshake_header(name: &HeaderName) -> bool {
	name == header::HOST
		|| name == header::CONNECTION
		|| name == header::UPGRADE
		|| name == header::SEC_WEBSOCKET_KEY
		|| name == header::SEC_WEBSOCKET_VERSION
		|| name == header::SEC_WEBSOCKET_ACCEPT
		|| name == header::SEC_WEBSOCKET_EXTENSIONS
}

/// Reflects every data frame back to the client.
async fn echo<S>(ws: WebSocketStream<S>)
where
	S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
	let (mut tx, mut rx) = ws.split();
	while let Some(msg) = rx.next().await {
		match msg {
			Ok(Message::Close(frame)) => {
				let _ = tx.send(Message::Close(frame)).await;
				break;
			},
			Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
				if tx.send(msg).await.is_err() {
					break;
				}
			},
			// Pings are answered by the protocol layer.
			Ok(_) => {},
			Err(e) => {
				debug!("websocket echo ended: {e}");
				break;
			},
		}
	}
	let _ = tx.flush().await;
}

/// Shuttles frames between client and upstream, preserving message kinds and
/// close codes, mirroring each half-close after the draining send completes.
async fn pipe<C>(client: WebSocketStream<C>, upstream: UpstreamWs)
where
	C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
	let (client_tx, client_rx) = client.split();
	let (upstream_tx, upstream_rx) = upstream.split();
	tokio::join!(
		forward(client_rx, upstream_tx),
		forward(upstream_rx, client_tx)
	);
}

async fn forward<R, W>(mut rx: R, mut tx: W)
where
	R: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
	W: Sink<Message> + Unpin,
{
	while let Some(msg) = rx.next().await {
		match msg {
			Ok(Message::Close(frame)) => {
				let _ = tx.send(Message::Close(frame)).await;
				break;
			},
			// Each side runs its own liveness probes; don't cross them over.
			Ok(Message::Ping(_) | Message::Pong(_)) => {},
			Ok(msg) => {
				if tx.send(msg).await.is_err() {
					break;
				}
			},
			Err(e) => {
				debug!("websocket bridge ended: {e}");
				let _ = tx.send(Message::Close(None)).await;
				break;
			},
		}
	}
	let _ = tx.flush().await;
	let _ = tx.close().await;
}

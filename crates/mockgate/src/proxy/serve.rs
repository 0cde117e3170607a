use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use tracing::debug;

use crate::ServerInputs;
use crate::events::{AbortedRequest, ClientFailure, Event};
use crate::http::body;
use crate::http::exchange::{CapturedBody, MockedResponse, ParsedRequest, RequestHead};
use crate::http::{
	Authority, Body, BoxError, Response, Scheme, StatusCode, effective_port,
	hop_by_hop_headers, is_websocket_upgrade, normalize_uri, plain_response,
};
use crate::proxy::exec::{self, Outcome};
use crate::proxy::websocket;
use crate::rules::dispatch::{Dispatch, select_http};
use crate::transport::stream::{ConnectionControl, TcpConnectionInfo, TlsConnectionInfo};

/// Connection-level attributes shared by every request on the connection.
pub(crate) struct ConnectionContext {
	pub inputs: Arc<ServerInputs>,
	pub tcp: TcpConnectionInfo,
	pub tls: Option<TlsConnectionInfo>,
	pub ctrl: ConnectionControl,
	/// CONNECT destination when this connection runs inside a tunnel.
	pub tunnel: Option<Authority>,
	pub drain: drain::Watch,
}

/// Marker error returned to hyper when a rule asked for the socket to be
/// closed or reset instead of answered.
#[derive(Debug, thiserror::Error)]
#[error("connection terminated by a mock rule")]
pub(crate) struct TerminatedByRule;

/// The full request lifecycle: parse, emit `request-initiated`, read the
/// body, emit `request`, dispatch a rule, execute its handler, emit the
/// terminal event. Runs once per request on the connection's task.
pub(crate) async fn handle(
	ctx: &ConnectionContext,
	req: ::http::Request<Incoming>,
) -> Result<Response, BoxError> {
	let inputs = &ctx.inputs;
	let mut req = req.map(|b| Body::new(b.map_err(BoxError::from)));

	let secure = ctx.tls.is_some();
	let normalized = normalize_uri(&mut req, secure, ctx.tunnel.as_ref());

	// The head is built even when normalization failed (with whatever the
	// raw request carried), so `request-initiated` precedes every other
	// event for any request hyper managed to parse.
	let id = inputs.next_request_id.fetch_add(1, Ordering::SeqCst);
	let head = Arc::new(RequestHead {
		id,
		received: SystemTime::now(),
		peer: ctx.tcp.peer_addr,
		version: req.version(),
		scheme: req.uri().scheme().cloned().unwrap_or(Scheme::HTTP),
		host: req.uri().host().unwrap_or_default().to_string(),
		port: effective_port(req.uri()),
		method: req.method().clone(),
		path: req.uri().path().to_string(),
		query: req.uri().query().map(str::to_string),
		headers: req.headers().clone(),
	});
	debug!(id, method = %head.method, path = %head.path, host = %head.host, "request received");
	inputs.events.publish(Event::RequestInitiated(head.clone()));
	let exchange = Exchange::new(inputs.clone(), head.clone());

	if let Err(e) = normalized {
		let reason = format!("unroutable request: {e}");
		inputs.events.publish(Event::ClientError(Arc::new(ClientFailure {
			peer: Some(ctx.tcp.peer_addr),
			reason: reason.clone(),
		})));
		let response = plain_response(StatusCode::BAD_REQUEST, reason.clone());
		return Ok(exchange.respond(response, CapturedBody::Complete(reason.into())));
	}

	// WebSocket upgrades carry no body; dispatch them straight to the bridge.
	if is_websocket_upgrade(req.headers()) {
		let parsed = Arc::new(ParsedRequest {
			head: head.clone(),
			body: CapturedBody::Empty,
			trailers: None,
		});
		inputs.events.publish(Event::Request(parsed.clone()));
		let ws = websocket::handle(inputs, &parsed, &mut req).await;
		if let Some(rule) = &ws.matched
			&& inputs.opts.record_traffic
		{
			rule.record(parsed.clone(), Some(ws.response.status()));
		}
		return Ok(exchange.respond(ws.response, ws.captured));
	}

	// Strip hop-by-hop headers (the recorded head keeps the originals),
	// holding on to the upgrade handle so passthrough rules can splice
	// non-WebSocket protocol switches.
	let upgrade = hop_by_hop_headers(&mut req);
	let (_, raw_body) = req.into_parts();
	let capture = match body::capture(raw_body, inputs.opts.max_body_size).await {
		Ok(c) => c,
		Err(e) => {
			exchange.client_error(format!("failed to read request body: {e}"));
			return Err(e);
		},
	};
	let parsed = Arc::new(ParsedRequest {
		head: head.clone(),
		body: capture.captured,
		trailers: capture.trailers,
	});
	inputs.events.publish(Event::Request(parsed.clone()));

	if let Some(cors) = &inputs.opts.cors
		&& let Some(response) = cors.preflight(&head.method, &head.headers)
	{
		debug!(id, "answered CORS preflight");
		return Ok(exchange.respond(response, CapturedBody::Empty));
	}

	let snapshot = inputs.rules.http_snapshot();
	let (response, captured, matched) =
		match select_http(&snapshot, &parsed, inputs.opts.suggest_changes) {
			Dispatch::Matched(rule) => {
				debug!(id, rule = %rule.spec.id, "rule matched");
				let outcome =
					exec::execute(inputs, &rule.spec.handler, &parsed, capture.replay, upgrade).await;
				match outcome {
					Outcome::Respond { response, captured } => (response, captured, Some(rule)),
					Outcome::Terminate { reset } => {
						if inputs.opts.record_traffic {
							rule.record(parsed.clone(), None);
						}
						if reset {
							ctx.ctrl.reset_on_close();
						}
						exchange.abort(if reset {
							"connection reset by a mock rule"
						} else {
							"connection closed by a mock rule"
						});
						return Err(Box::new(TerminatedByRule));
					},
					Outcome::Hold => {
						if inputs.opts.record_traffic {
							rule.record(parsed.clone(), None);
						}
						// Held until the peer gives up or the server stops;
						// the exchange guard emits the abort either way.
						futures_util::future::pending::<()>().await;
						unreachable!("pending future resolved")
					},
				}
			},
			Dispatch::Miss(explanation) => {
				debug!(id, "no rule matched");
				let (response, captured) = exec::miss_response(explanation);
				(response, captured, None)
			},
		};

	let mut response = response;
	if let Some(cors) = &inputs.opts.cors {
		cors.apply(&head.headers, &mut response);
	}
	if let Some(rule) = &matched
		&& inputs.opts.record_traffic
	{
		rule.record(parsed.clone(), Some(response.status()));
	}
	Ok(exchange.respond(response, captured))
}

/// Enforces the one-terminal-event-per-request guarantee: exactly one of
/// `response`, `abort` or `client-error` fires, including when the task is
/// cancelled mid-flight.
struct Exchange {
	inputs: Arc<ServerInputs>,
	head: Arc<RequestHead>,
	done: bool,
}

impl Exchange {
	fn new(inputs: Arc<ServerInputs>, head: Arc<RequestHead>) -> Self {
		Exchange {
			inputs,
			head,
			done: false,
		}
	}

	/// Publishes the `response` event and hands the response back for the
	/// socket write; emission happens before the flush completes.
	fn respond(mut self, response: Response, captured: CapturedBody) -> Response {
		self.done = true;
		self.inputs.events.publish(Event::Response(Arc::new(MockedResponse {
			request_id: self.head.id,
			status: response.status(),
			headers: response.headers().clone(),
			body: captured,
		})));
		response
	}

	fn abort(mut self, reason: &str) {
		self.done = true;
		self.inputs.events.publish(Event::Abort(Arc::new(AbortedRequest {
			request: Some(self.head.clone()),
			reason: reason.to_string(),
		})));
	}

	fn client_error(mut self, reason: String) {
		self.done = true;
		self.inputs.events.publish(Event::ClientError(Arc::new(ClientFailure {
			peer: Some(self.head.peer),
			reason,
		})));
	}
}

impl Drop for Exchange {
	fn drop(&mut self) {
		if !self.done {
			self.inputs.events.publish(Event::Abort(Arc::new(AbortedRequest {
				request: Some(self.head.clone()),
				reason: "the exchange was interrupted before a response was produced".to_string(),
			})));
		}
	}
}

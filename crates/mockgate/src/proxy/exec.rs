use std::sync::Arc;

use futures_util::StreamExt;
use http_body_util::StreamBody;
use hyper::body::Frame;
use tracing::debug;

use crate::ServerInputs;
use crate::http::exchange::{CapturedBody, ParsedRequest};
use crate::http::{
	Body, HeaderValue, RequestUpgrade, Response, StatusCode, full_body, header,
};
use crate::proxy::ProxyError;
use crate::rules::Handler;
use crate::rules::handler::ResponseDefinition;

/// What executing a handler did with the exchange.
pub(crate) enum Outcome {
	Respond {
		response: Response,
		/// Body bytes when the handler materialized them, for the response
		/// event; streamed and proxied bodies are not captured.
		captured: CapturedBody,
	},
	/// Terminate the socket instead of responding. `reset` sends an RST.
	Terminate { reset: bool },
	/// Hold the connection open forever; the peer's own timeout governs.
	Hold,
}

impl Outcome {
	fn from_definition(def: ResponseDefinition) -> Outcome {
		let captured = CapturedBody::Complete(def.body.clone());
		let body_len = def.body.len();
		let mut response = ::http::Response::builder()
			.status(def.status)
			.body(full_body(def.body))
			.expect("definition response must build");
		*response.headers_mut() = def.headers;
		if !response.headers().contains_key(header::CONTENT_LENGTH) {
			response
				.headers_mut()
				.insert(header::CONTENT_LENGTH, HeaderValue::from(body_len));
		}
		Outcome::Respond { response, captured }
	}

	fn error(err: ProxyError) -> Outcome {
		let response = err.into_response();
		Outcome::Respond {
			response,
			captured: CapturedBody::Discarded,
		}
	}
}

/// Runs the matched rule's handler against the request.
pub(crate) async fn execute(
	inputs: &Arc<ServerInputs>,
	handler: &Handler,
	parsed: &Arc<ParsedRequest>,
	forward_body: Body,
	upgrade: Option<RequestUpgrade>,
) -> Outcome {
	match handler {
		Handler::Reply(def) => Outcome::from_definition(def.clone()),
		Handler::Stream {
			status,
			headers,
			stream,
		} => {
			let frames = stream().map(|chunk| chunk.map(Frame::data));
			let mut response = ::http::Response::builder()
				.status(*status)
				.body(Body::new(StreamBody::new(frames)))
				.expect("stream response must build");
			*response.headers_mut() = headers.clone();
			Outcome::Respond {
				response,
				captured: CapturedBody::Discarded,
			}
		},
		Handler::Callback(callback) => {
			// User code runs on its own task so a panic stays contained.
			let fut = callback(parsed.clone());
			let handle = tokio::spawn(fut);
			match tokio::time::timeout(inputs.opts.callback_timeout, handle).await {
				Err(_) => Outcome::error(ProxyError::HandlerTimeout),
				Ok(Err(join)) => Outcome::error(ProxyError::HandlerFailed(format!(
					"callback panicked: {join}"
				))),
				Ok(Ok(Err(e))) => Outcome::error(ProxyError::HandlerFailed(e.to_string())),
				Ok(Ok(Ok(def))) => Outcome::from_definition(def),
			}
		},
		Handler::File {
			status,
			headers,
			path,
		} => match tokio::fs::read(path).await {
			Err(e) => Outcome::error(ProxyError::FileRead(format!("{}: {e}", path.display()))),
			Ok(contents) => {
				let mut def = ResponseDefinition::new(*status, contents);
				def.headers = headers.clone();
				Outcome::from_definition(def)
			},
		},
		Handler::Timeout => {
			debug!("holding connection open without a response");
			Outcome::Hold
		},
		Handler::CloseConnection => Outcome::Terminate { reset: false },
		Handler::ResetConnection => Outcome::Terminate { reset: true },
		Handler::Passthrough(spec) => {
			let result = inputs
				.upstream
				.passthrough(
					spec,
					&parsed.head,
					forward_body,
					upgrade,
					inputs.opts.callback_timeout,
				)
				.await;
			match result {
				Ok(response) => Outcome::Respond {
					response,
					captured: CapturedBody::Discarded,
				},
				Err(e) => {
					debug!("passthrough failed: {e}");
					Outcome::error(e)
				},
			}
		},
	}
}

/// A 503 carrying the dispatcher's explanation of why nothing matched.
pub(crate) fn miss_response(explanation: String) -> (Response, CapturedBody) {
	let captured = CapturedBody::Complete(explanation.clone().into());
	let response = crate::http::plain_response(StatusCode::SERVICE_UNAVAILABLE, explanation);
	(response, captured)
}

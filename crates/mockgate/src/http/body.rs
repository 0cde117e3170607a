use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http_body::{Frame, SizeHint};
use http_body_util::BodyExt;

use crate::http::exchange::CapturedBody;
use crate::http::{Body, BoxError, HeaderMap};

/// Result of reading a request body under the configured capture limit.
pub struct BodyCapture {
	/// What matchers and event subscribers see.
	pub captured: CapturedBody,
	/// A body equivalent to the one read, for handlers that forward it.
	pub replay: Body,
	pub trailers: Option<HeaderMap>,
}

/// Reads `body` buffering at most `limit` bytes. A body that stays under the
/// limit is fully captured; a larger one is marked discarded while the
/// buffered prefix plus the unread remainder stay forwardable.
pub async fn capture(mut body: Body, limit: usize) -> Result<BodyCapture, BoxError> {
	let mut chunks: VecDeque<Bytes> = VecDeque::new();
	let mut total = 0usize;
	let mut trailers = None;
	loop {
		match body.frame().await {
			None => {
				let captured = CapturedBody::Complete(concat(&chunks));
				let replay = ReplayBody {
					prefix: chunks,
					rest: None,
					trailers: trailers.clone(),
				};
				return Ok(BodyCapture {
					captured,
					replay: Body::new(replay),
					trailers,
				});
			},
			Some(Ok(frame)) => match frame.into_data() {
				Ok(data) => {
					total += data.len();
					chunks.push_back(data);
					if total > limit {
						let replay = ReplayBody {
							prefix: chunks,
							rest: Some(body),
							trailers: None,
						};
						return Ok(BodyCapture {
							captured: CapturedBody::Discarded,
							replay: Body::new(replay),
							trailers: None,
						});
					}
				},
				Err(frame) => {
					if let Ok(t) = frame.into_trailers() {
						trailers = Some(t);
					}
				},
			},
			Some(Err(e)) => return Err(e),
		}
	}
}

fn concat(chunks: &VecDeque<Bytes>) -> Bytes {
	if chunks.len() == 1 {
		return chunks[0].clone();
	}
	let mut buf = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
	for c in chunks {
		buf.extend_from_slice(c);
	}
	buf.freeze()
}

/// Replays buffered chunks and then, for oversized bodies, the unread
/// remainder of the original stream.
struct ReplayBody {
	prefix: VecDeque<Bytes>,
	rest: Option<Body>,
	trailers: Option<HeaderMap>,
}

impl http_body::Body for ReplayBody {
	type Data = Bytes;
	type Error = BoxError;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = self.get_mut();
		if let Some(chunk) = this.prefix.pop_front() {
			return Poll::Ready(Some(Ok(Frame::data(chunk))));
		}
		if let Some(rest) = &mut this.rest {
			match Pin::new(rest).poll_frame(cx) {
				Poll::Ready(None) => {
					this.rest = None;
				},
				other => return other,
			}
		}
		if let Some(t) = this.trailers.take() {
			return Poll::Ready(Some(Ok(Frame::trailers(t))));
		}
		Poll::Ready(None)
	}

	fn is_end_stream(&self) -> bool {
		self.prefix.is_empty() && self.rest.is_none() && self.trailers.is_none()
	}

	fn size_hint(&self) -> SizeHint {
		let buffered: usize = self.prefix.iter().map(Bytes::len).sum();
		match &self.rest {
			None => SizeHint::with_exact(buffered as u64),
			Some(rest) => {
				let mut hint = rest.size_hint();
				hint.set_lower(hint.lower() + buffered as u64);
				if let Some(upper) = hint.upper() {
					hint.set_upper(upper + buffered as u64);
				}
				hint
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::full_body;

	#[tokio::test]
	async fn small_body_is_fully_captured() {
		let cap = capture(full_body("hello"), 1024).await.unwrap();
		assert_eq!(cap.captured.for_matching(), b"hello");
		let replayed = cap.replay.collect().await.unwrap().to_bytes();
		assert_eq!(&replayed[..], b"hello");
	}

	#[tokio::test]
	async fn oversized_body_is_discarded_but_replayable() {
		let payload = vec![b'x'; 64];
		let cap = capture(full_body(payload.clone()), 16).await.unwrap();
		assert!(matches!(cap.captured, CapturedBody::Discarded));
		assert_eq!(cap.captured.for_matching(), b"");
		let replayed = cap.replay.collect().await.unwrap().to_bytes();
		assert_eq!(&replayed[..], &payload[..]);
	}
}

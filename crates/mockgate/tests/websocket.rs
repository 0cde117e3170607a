mod common;

use futures::{SinkExt, StreamExt};
use mockgate::MockServer;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

#[tokio::test]
async fn echo_rule_reflects_messages() {
	let server = MockServer::new();
	server.start(0u16).await.unwrap();
	let endpoint = server.any_websocket().then_echo().unwrap();

	let url = format!("ws://localhost:{}/socket", server.port().unwrap());
	let (mut ws, resp) = connect_async(url.clone()).await.unwrap();
	assert_eq!(resp.status(), 101);

	ws.send(Message::Text("hello".into())).await.unwrap();
	let reply = ws.next().await.unwrap().unwrap();
	assert_eq!(reply, Message::Text("hello".into()));

	ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
	let reply = ws.next().await.unwrap().unwrap();
	assert_eq!(reply, Message::Binary(vec![1, 2, 3]));

	ws.close(None).await.unwrap();
	assert_eq!(endpoint.seen_requests().len(), 1);
	server.stop().await.unwrap();
}

#[tokio::test]
async fn passthrough_pipes_frames_to_upstream() {
	// The upstream is another mock server that echoes.
	let origin = MockServer::new();
	origin.start(0u16).await.unwrap();
	origin.any_websocket().then_echo().unwrap();
	let origin_port = origin.port().unwrap();

	let server = MockServer::new();
	server.start(0u16).await.unwrap();
	server
		.any_websocket()
		.then_forward_to(&format!("localhost:{origin_port}"))
		.unwrap();

	let url = format!("ws://localhost:{}/bridge", server.port().unwrap());
	let (mut ws, _) = connect_async(url.clone()).await.unwrap();

	ws.send(Message::Text("hello".into())).await.unwrap();
	let reply = ws.next().await.unwrap().unwrap();
	assert_eq!(reply, Message::Text("hello".into()));

	// Close codes propagate across the bridge.
	ws.close(Some(CloseFrame {
		code: CloseCode::Away,
		reason: "done".into(),
	}))
	.await
	.unwrap();
	loop {
		match ws.next().await {
			Some(Ok(Message::Close(Some(frame)))) => {
				assert_eq!(frame.code, CloseCode::Away);
				break;
			},
			Some(Ok(_)) => continue,
			None | Some(Err(_)) => break,
		}
	}

	origin.stop().await.unwrap();
	server.stop().await.unwrap();
}

#[tokio::test]
async fn reject_rule_refuses_the_handshake() {
	let server = MockServer::new();
	server.start(0u16).await.unwrap();
	server.any_websocket().then_reject(403, "no sockets here").unwrap();

	let url = format!("ws://localhost:{}/socket", server.port().unwrap());
	let err = connect_async(url.clone()).await.unwrap_err();
	match err {
		tokio_tungstenite::tungstenite::Error::Http(resp) => {
			assert_eq!(resp.status(), 403);
		},
		other => panic!("expected an HTTP rejection, got {other:?}"),
	}
	server.stop().await.unwrap();
}

#[tokio::test]
async fn unmatched_websocket_is_refused_with_explanation() {
	let server = MockServer::new();
	server.start(0u16).await.unwrap();

	let url = format!("ws://localhost:{}/socket", server.port().unwrap());
	let err = connect_async(url.clone()).await.unwrap_err();
	match err {
		tokio_tungstenite::tungstenite::Error::Http(resp) => {
			assert_eq!(resp.status(), 503);
			let body = String::from_utf8_lossy(resp.body().as_deref().unwrap_or_default());
			assert!(body.contains("No rules were found matching"));
		},
		other => panic!("expected an HTTP rejection, got {other:?}"),
	}
	server.stop().await.unwrap();
}

mod common;

use mockgate::{
	MockServer, PassthroughRequest, PassthroughSpec, ResponseDefinition, ServerConfig,
};

use common::http_client;

/// An origin that echoes method, path and body length back.
async fn echo_origin() -> MockServer {
	let origin = MockServer::new();
	origin.start(0u16).await.unwrap();
	origin
		.any_request()
		.then_callback(|req| async move {
			let body_len = req.body.bytes().map(|b| b.len()).unwrap_or(0);
			let mut def = ResponseDefinition::new(
				http::StatusCode::OK,
				format!("{} {} {}", req.method(), req.path(), body_len),
			);
			def
				.headers
				.insert("x-origin", http::HeaderValue::from_static("yes"));
			Ok(def)
		})
		.unwrap();
	origin
}

#[tokio::test]
async fn forward_to_preserves_method_path_and_body() {
	let origin = echo_origin().await;
	let server = MockServer::new();
	server.start(0u16).await.unwrap();
	server
		.any_request()
		.then_forward_to(&format!("localhost:{}", origin.port().unwrap()))
		.unwrap();

	let resp = http_client()
		.post(server.url_for("/somewhere").unwrap())
		.body("0123456789")
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);
	assert_eq!(resp.headers()["x-origin"], "yes");
	assert_eq!(resp.text().await.unwrap(), "POST /somewhere 10");

	origin.stop().await.unwrap();
	server.stop().await.unwrap();
}

#[tokio::test]
async fn before_request_rewrite_changes_what_origin_sees() {
	let origin = echo_origin().await;
	let origin_port = origin.port().unwrap();

	let server = MockServer::new();
	server.start(0u16).await.unwrap();
	let spec = PassthroughSpec::default()
		.with_target(mockgate::ForwardTarget::parse(&format!("localhost:{origin_port}")).unwrap())
		.with_before_request(|mut req: PassthroughRequest| async move {
			req.body = Some("rewritten".into());
			Ok(req)
		});
	server
		.any_request()
		.then_pass_through_with(spec)
		.unwrap();

	let resp = http_client()
		.post(server.url_for("/p").unwrap())
		.body("original body")
		.send()
		.await
		.unwrap();
	// "rewritten" is 9 bytes, not 13.
	assert_eq!(resp.text().await.unwrap(), "POST /p 9");

	origin.stop().await.unwrap();
	server.stop().await.unwrap();
}

#[tokio::test]
async fn before_response_rewrite_changes_what_client_sees() {
	let origin = echo_origin().await;
	let origin_port = origin.port().unwrap();

	let server = MockServer::new();
	server.start(0u16).await.unwrap();
	let spec = PassthroughSpec::default()
		.with_target(mockgate::ForwardTarget::parse(&format!("localhost:{origin_port}")).unwrap())
		.with_before_response(|mut resp: mockgate::PassthroughResponse| async move {
			resp.status = http::StatusCode::ACCEPTED;
			resp.body = "replaced".into();
			Ok(resp)
		});
	server
		.any_request()
		.then_pass_through_with(spec)
		.unwrap();

	let resp = http_client()
		.get(server.url_for("/q").unwrap())
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 202);
	assert_eq!(resp.text().await.unwrap(), "replaced");

	origin.stop().await.unwrap();
	server.stop().await.unwrap();
}

#[tokio::test]
async fn unreachable_origin_becomes_502() {
	let server = MockServer::new();
	server.start(0u16).await.unwrap();
	// Port 1 is essentially never listening.
	server
		.any_request()
		.then_forward_to("localhost:1")
		.unwrap();

	let resp = http_client()
		.get(server.url_for("/x").unwrap())
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 502);
	server.stop().await.unwrap();
}

#[tokio::test]
async fn oversized_body_still_streams_through_while_matchers_see_empty() {
	let origin = echo_origin().await;
	let origin_port = origin.port().unwrap();

	let config = ServerConfig {
		max_body_size: 16,
		..Default::default()
	};
	let server = MockServer::with_config(config).unwrap();
	server.start(0u16).await.unwrap();
	// Would match on the body if it were captured, but the capture cap makes
	// body matchers see an empty body.
	server
		.post("/upload")
		.with_body_including("marker")
		.then_reply(418, "matched body")
		.unwrap();
	server
		.any_request()
		.then_forward_to(&format!("localhost:{origin_port}"))
		.unwrap();

	let big_body = format!("{}marker{}", "a".repeat(100), "b".repeat(100));
	let expected_len = big_body.len();
	let resp = http_client()
		.post(server.url_for("/upload").unwrap())
		.body(big_body)
		.send()
		.await
		.unwrap();
	// The passthrough rule took it, and the origin saw every byte.
	assert_eq!(resp.status(), 200);
	assert_eq!(
		resp.text().await.unwrap(),
		format!("POST /upload {expected_len}")
	);

	origin.stop().await.unwrap();
	server.stop().await.unwrap();
}

#[tokio::test]
async fn connect_tunnel_without_tls_splices_to_origin() {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	let origin = echo_origin().await;
	let origin_port = origin.port().unwrap();

	let proxy = MockServer::new();
	proxy.start(0u16).await.unwrap();
	let proxy_port = proxy.port().unwrap();

	// Speak the proxy protocol by hand: CONNECT, then a plain request
	// through the tunnel.
	let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", proxy_port))
		.await
		.unwrap();
	stream
		.write_all(
			format!("CONNECT localhost:{origin_port} HTTP/1.1\r\nHost: localhost:{origin_port}\r\n\r\n")
				.as_bytes(),
		)
		.await
		.unwrap();
	let mut buf = vec![0u8; 1024];
	let n = stream.read(&mut buf).await.unwrap();
	let connect_resp = String::from_utf8_lossy(&buf[..n]).to_string();
	assert!(connect_resp.starts_with("HTTP/1.1 200"));

	stream
		.write_all(
			format!("GET /tunneled HTTP/1.1\r\nHost: localhost:{origin_port}\r\nConnection: close\r\n\r\n")
				.as_bytes(),
		)
		.await
		.unwrap();
	let mut response = String::new();
	let mut buf = vec![0u8; 4096];
	loop {
		let n = stream.read(&mut buf).await.unwrap();
		if n == 0 {
			break;
		}
		response.push_str(&String::from_utf8_lossy(&buf[..n]));
		if response.contains("GET /tunneled 0") {
			break;
		}
	}
	assert!(response.starts_with("HTTP/1.1 200"));
	assert!(response.contains("GET /tunneled 0"));

	origin.stop().await.unwrap();
	proxy.stop().await.unwrap();
}

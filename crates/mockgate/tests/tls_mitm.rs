mod common;

use mockgate::{Event, EventKind, Http2Mode, HttpsOptions, MockServer, ServerConfig};

use common::test_ca;

fn tls_server(http2: Http2Mode) -> MockServer {
	let (key, cert) = test_ca();
	let config = ServerConfig {
		https: Some(HttpsOptions::from_pem(key, cert)),
		http2,
		..Default::default()
	};
	MockServer::with_config(config).unwrap()
}

fn ca_cert_of(server_config: &HttpsOptions) -> reqwest::Certificate {
	reqwest::Certificate::from_pem(server_config.cert.as_ref().unwrap().as_bytes()).unwrap()
}

#[tokio::test]
async fn direct_https_with_minted_certificate() {
	let (key, cert) = test_ca();
	let https = HttpsOptions::from_pem(key, cert);
	let config = ServerConfig {
		https: Some(https.clone()),
		http2: Http2Mode::Disabled,
		..Default::default()
	};
	let server = MockServer::with_config(config).unwrap();
	server.start(0u16).await.unwrap();
	server.get("/secure").then_reply(200, "over tls").unwrap();

	let client = reqwest::Client::builder()
		.no_proxy()
		.add_root_certificate(ca_cert_of(&https))
		.build()
		.unwrap();
	let resp = client
		.get(server.url_for("/secure").unwrap())
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);
	assert_eq!(resp.version(), http::Version::HTTP_11);
	assert_eq!(resp.text().await.unwrap(), "over tls");
	server.stop().await.unwrap();
}

#[tokio::test]
async fn https_request_via_connect_proxy() {
	let (key, cert) = test_ca();
	let https = HttpsOptions::from_pem(key, cert);
	let config = ServerConfig {
		https: Some(https.clone()),
		..Default::default()
	};
	let server = MockServer::with_config(config).unwrap();
	server.start(0u16).await.unwrap();
	server
		.get("https://example.test/")
		.then_reply(200, "ok")
		.unwrap();

	// The client trusts the CA and tunnels through the server as an
	// explicit proxy; the minted leaf must validate for example.test.
	let client = reqwest::Client::builder()
		.proxy(reqwest::Proxy::all(server.url().unwrap()).unwrap())
		.add_root_certificate(ca_cert_of(&https))
		.build()
		.unwrap();
	let resp = client.get("https://example.test/").send().await.unwrap();
	assert_eq!(resp.status(), 200);
	assert_eq!(resp.text().await.unwrap(), "ok");
	server.stop().await.unwrap();
}

#[tokio::test]
async fn plain_http_via_proxy_uses_absolute_uris() {
	let server = MockServer::new();
	server.start(0u16).await.unwrap();
	server
		.get("http://example.test/page")
		.then_reply(200, "proxied")
		.unwrap();

	let client = reqwest::Client::builder()
		.proxy(reqwest::Proxy::all(server.url().unwrap()).unwrap())
		.build()
		.unwrap();
	let resp = client.get("http://example.test/page").send().await.unwrap();
	assert_eq!(resp.status(), 200);
	assert_eq!(resp.text().await.unwrap(), "proxied");
	server.stop().await.unwrap();
}

#[tokio::test]
async fn h2_alpn_negotiation_when_enabled() {
	let (key, cert) = test_ca();
	let https = HttpsOptions::from_pem(key, cert);
	let config = ServerConfig {
		https: Some(https.clone()),
		http2: Http2Mode::Enabled,
		..Default::default()
	};
	let server = MockServer::with_config(config).unwrap();
	server.start(0u16).await.unwrap();
	server.get("/h2").then_reply(200, "two").unwrap();

	let client = reqwest::Client::builder()
		.no_proxy()
		.add_root_certificate(ca_cert_of(&https))
		.build()
		.unwrap();
	let resp = client
		.get(server.url_for("/h2").unwrap())
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);
	assert_eq!(resp.version(), http::Version::HTTP_2);
	server.stop().await.unwrap();
}

#[tokio::test]
async fn fallback_mode_prefers_http1_for_ordinary_clients() {
	let (key, cert) = test_ca();
	let https = HttpsOptions::from_pem(key, cert);
	let config = ServerConfig {
		https: Some(https.clone()),
		http2: Http2Mode::Fallback,
		..Default::default()
	};
	let server = MockServer::with_config(config).unwrap();
	server.start(0u16).await.unwrap();
	server.get("/v").then_reply(200, "v").unwrap();

	// reqwest advertises both h2 and http/1.1, so fallback mode offers
	// http/1.1 only.
	let client = reqwest::Client::builder()
		.no_proxy()
		.add_root_certificate(ca_cert_of(&https))
		.build()
		.unwrap();
	let resp = client
		.get(server.url_for("/v").unwrap())
		.send()
		.await
		.unwrap();
	assert_eq!(resp.version(), http::Version::HTTP_11);
	server.stop().await.unwrap();
}

#[tokio::test]
async fn tls_client_error_fires_for_silent_disconnects() {
	let server = tls_server(Http2Mode::Fallback);
	server.start(0u16).await.unwrap();
	let mut errors = server.subscribe(EventKind::TlsClientError);

	// Connect and hang up without a ClientHello.
	let conn = tokio::net::TcpStream::connect(("127.0.0.1", server.port().unwrap()))
		.await
		.unwrap();
	drop(conn);

	let Some(Event::TlsClientError(failure)) = errors.recv().await else {
		panic!("expected a tls-client-error event");
	};
	assert!(failure.server_name.is_none());
	server.stop().await.unwrap();
}

#[tokio::test]
async fn untrusting_client_fails_and_fires_tls_client_error() {
	let server = tls_server(Http2Mode::Fallback);
	server.start(0u16).await.unwrap();
	server.get("/x").then_reply(200, "x").unwrap();
	let mut errors = server.subscribe(EventKind::TlsClientError);

	// No CA configured client-side: the handshake must fail.
	let client = reqwest::Client::builder().no_proxy().build().unwrap();
	let result = client.get(server.url_for("/x").unwrap()).send().await;
	assert!(result.is_err());

	let Some(Event::TlsClientError(_)) = errors.recv().await else {
		panic!("expected a tls-client-error event");
	};
	server.stop().await.unwrap();
}

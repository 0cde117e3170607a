//! A programmable HTTP/HTTPS/WebSocket mock server and man-in-the-middle
//! proxy for test suites.
//!
//! Rules are registered against a [`MockServer`] before (or while) it runs;
//! each incoming request is matched against the rules in declaration order
//! and the first matching rule with remaining capacity produces the
//! response. Lifecycle events for every exchange fan out to subscribers.
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use mockgate::MockServer;
//!
//! let server = MockServer::new();
//! server.start(0u16).await?;
//! let endpoint = server.get("/hello").then_reply(200, "world")?;
//!
//! // Point the code under test at server.url()?; once it has run,
//! // the endpoint reports the traffic it handled:
//! assert_eq!(endpoint.seen_requests().len(), 1);
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod events;
pub mod http;
pub mod rules;

mod client;
mod proxy;
mod server;
mod telemetry;
mod tls;
mod transport;

use std::sync::atomic::AtomicU64;

use crate::config::Options;
use crate::events::EventBus;
use crate::proxy::upstream::PassthroughClient;
use crate::rules::store::RuleStore;

pub use config::{
	ConfigError, CorsSetting, Http2Mode, HttpsOptions, ServerConfig, ServerError,
};
pub use events::{
	AbortedRequest, ClientFailure, Event, EventKind, EventSubscription, TlsClientFailure,
};
pub use http::cors::CorsOptions;
pub use http::exchange::{CapturedBody, MockedResponse, ParsedRequest, RequestHead};
pub use proxy::listener::PortSpec;
pub use rules::builder::{RuleBuilder, UrlPattern, WsRuleBuilder};
pub use rules::endpoint::MockedEndpoint;
pub use rules::handler::{
	ForwardTarget, Handler, PassthroughRequest, PassthroughResponse, PassthroughSpec,
	ResponseDefinition, WsHandler,
};
pub use rules::{Matcher, Rule, RuleId, SeenExchange, WsRule};
pub use server::MockServer;

/// Shared state of one server instance: validated options, the rule store,
/// the event bus and the outbound client. Several servers coexist in one
/// process without sharing any of it.
pub(crate) struct ServerInputs {
	pub opts: Options,
	pub rules: RuleStore,
	pub events: EventBus,
	pub upstream: PassthroughClient,
	pub next_request_id: AtomicU64,
}

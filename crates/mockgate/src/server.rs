use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::ServerInputs;
use crate::config::{ConfigError, ServerConfig, ServerError};
use crate::events::{EventBus, EventKind, EventSubscription};
use crate::http::Method;
use crate::proxy::listener::{self, PortSpec};
use crate::proxy::upstream::PassthroughClient;
use crate::rules::builder::{RegisterRules, RuleBuilder, UrlPattern, WsRuleBuilder};
use crate::rules::endpoint::MockedEndpoint;
use crate::rules::store::RuleStore;
use crate::rules::{Matcher, Rule, WsRule};
use crate::telemetry;

/// The mock server facade: lifecycle, rule registration and event
/// subscription. Cloning shares the same server instance.
#[derive(Clone)]
pub struct MockServer {
	core: Arc<ServerCore>,
}

struct ServerCore {
	inputs: Arc<ServerInputs>,
	state: Mutex<Lifecycle>,
}

enum Lifecycle {
	Stopped,
	Starting,
	Running(Running),
	Stopping,
}

struct Running {
	port: u16,
	accept_task: tokio::task::JoinHandle<()>,
	shutdown: drain::Signal,
	force: watch::Sender<()>,
}

impl Default for MockServer {
	fn default() -> Self {
		Self::new()
	}
}

impl MockServer {
	/// A server with the default options: no TLS, no CORS handling, traffic
	/// recording on.
	pub fn new() -> MockServer {
		Self::with_config(ServerConfig::default()).expect("default configuration is valid")
	}

	pub fn with_config(config: ServerConfig) -> Result<MockServer, ConfigError> {
		let opts = config.validate()?;
		let inputs = Arc::new(ServerInputs {
			opts,
			rules: RuleStore::new(),
			events: EventBus::new(),
			upstream: PassthroughClient::new(),
			next_request_id: AtomicU64::new(1),
		});
		Ok(MockServer {
			core: Arc::new(ServerCore {
				inputs,
				state: Mutex::new(Lifecycle::Stopped),
			}),
		})
	}

	/// Binds and starts serving. `0` (or `PortSpec::Ephemeral`) picks a free
	/// port, an exact port binds exactly, and a range tries each port in
	/// order. Starting an already-running server fails.
	pub async fn start(&self, port: impl Into<PortSpec>) -> Result<(), ServerError> {
		telemetry::init(self.core.inputs.opts.debug);
		{
			let mut st = self.core.state.lock();
			match *st {
				Lifecycle::Stopped => *st = Lifecycle::Starting,
				_ => return Err(ConfigError::AlreadyRunning.into()),
			}
		}
		let spec = port.into();
		let listener = match listener::bind(&spec).await {
			Ok(l) => l,
			Err(e) => {
				*self.core.state.lock() = Lifecycle::Stopped;
				return Err(e);
			},
		};
		let port = match listener.local_addr() {
			Ok(addr) => addr.port(),
			Err(e) => {
				*self.core.state.lock() = Lifecycle::Stopped;
				return Err(e.into());
			},
		};
		let (shutdown, watch) = drain::channel();
		let (force, force_rx) = watch::channel(());
		let accept_task = tokio::spawn(listener::run(
			self.core.inputs.clone(),
			listener,
			watch,
			force_rx,
		));
		*self.core.state.lock() = Lifecycle::Running(Running {
			port,
			accept_task,
			shutdown,
			force,
		});
		info!(port, "mock server listening");
		Ok(())
	}

	/// Stops accepting immediately, then drains in-flight exchanges within
	/// the configured grace window before hard-closing what remains.
	pub async fn stop(&self) -> Result<(), ServerError> {
		let running = {
			let mut st = self.core.state.lock();
			match std::mem::replace(&mut *st, Lifecycle::Stopping) {
				Lifecycle::Running(r) => r,
				other => {
					*st = other;
					return Err(ConfigError::NotRunning.into());
				},
			}
		};
		running.accept_task.abort();
		let grace = self.core.inputs.opts.shutdown_grace;
		let drained = running.shutdown.drain();
		tokio::pin!(drained);
		if tokio::time::timeout(grace, drained.as_mut()).await.is_err() {
			debug!("grace window expired; force-closing remaining connections");
			let _ = running.force.send(());
			// Give the killed tasks a moment to emit their abort events.
			let _ = tokio::time::timeout(std::time::Duration::from_millis(100), drained).await;
		}
		self.core.inputs.events.close_all();
		*self.core.state.lock() = Lifecycle::Stopped;
		info!("mock server stopped");
		Ok(())
	}

	/// Removes every rule (both protocols and the fallback) and zeroes all
	/// endpoint counters. Live connections stay open; the next request sees
	/// an empty rule set. The certificate cache is deliberately kept.
	pub fn reset(&self) {
		self.core.inputs.rules.reset();
	}

	/// Raises this crate's log filter to debug.
	pub fn enable_debug(&self) {
		telemetry::enable_debug();
	}

	pub fn port(&self) -> Result<u16, ConfigError> {
		match &*self.core.state.lock() {
			Lifecycle::Running(r) => Ok(r.port),
			_ => Err(ConfigError::NotRunning),
		}
	}

	/// Base URL of the running server, e.g. `http://localhost:49152`.
	pub fn url(&self) -> Result<String, ConfigError> {
		let port = self.port()?;
		let scheme = if self.core.inputs.opts.tls.is_some() {
			"https"
		} else {
			"http"
		};
		Ok(format!("{scheme}://localhost:{port}"))
	}

	/// `url()` plus `path`, unnormalized.
	pub fn url_for(&self, path: &str) -> Result<String, ConfigError> {
		Ok(format!("{}{}", self.url()?, path))
	}

	/// Environment variables pointing HTTP clients at this server as their
	/// proxy.
	pub fn proxy_env(&self) -> Result<HashMap<String, String>, ConfigError> {
		let url = self.url()?;
		Ok(HashMap::from([
			("HTTP_PROXY".to_string(), url.clone()),
			("HTTPS_PROXY".to_string(), url),
		]))
	}

	// Rule registration.

	/// A rule matching every request.
	pub fn any_request(&self) -> RuleBuilder<'_> {
		RuleBuilder::new(self, vec![], false)
	}

	/// The fallback rule, consulted only when no ordinary rule matches with
	/// remaining capacity. At most one may exist; its matcher must stay
	/// unconditional.
	pub fn unmatched_request(&self) -> RuleBuilder<'_> {
		RuleBuilder::new(self, vec![], true)
	}

	fn for_method(&self, method: Method, url: impl Into<UrlPattern>) -> RuleBuilder<'_> {
		let mut matchers = vec![Matcher::Method(method)];
		if let Some(m) = url.into().into_matcher() {
			matchers.push(m);
		}
		RuleBuilder::new(self, matchers, false)
	}

	pub fn get(&self, url: impl Into<UrlPattern>) -> RuleBuilder<'_> {
		self.for_method(Method::GET, url)
	}

	pub fn post(&self, url: impl Into<UrlPattern>) -> RuleBuilder<'_> {
		self.for_method(Method::POST, url)
	}

	pub fn put(&self, url: impl Into<UrlPattern>) -> RuleBuilder<'_> {
		self.for_method(Method::PUT, url)
	}

	pub fn delete(&self, url: impl Into<UrlPattern>) -> RuleBuilder<'_> {
		self.for_method(Method::DELETE, url)
	}

	pub fn patch(&self, url: impl Into<UrlPattern>) -> RuleBuilder<'_> {
		self.for_method(Method::PATCH, url)
	}

	pub fn head(&self, url: impl Into<UrlPattern>) -> RuleBuilder<'_> {
		self.for_method(Method::HEAD, url)
	}

	/// OPTIONS rules conflict with CORS auto-handling; registration fails
	/// while it is enabled.
	pub fn options(&self, url: impl Into<UrlPattern>) -> RuleBuilder<'_> {
		self.for_method(Method::OPTIONS, url)
	}

	/// A WebSocket rule matching every upgrade request.
	pub fn any_websocket(&self) -> WsRuleBuilder<'_> {
		WsRuleBuilder::new(self, vec![])
	}

	// Bulk rule management.

	pub fn add_request_rules(&self, rules: Vec<Rule>) -> Result<Vec<MockedEndpoint>, ConfigError> {
		for rule in &rules {
			self.check_options_rule(&rule.matcher)?;
		}
		Ok(
			rules
				.into_iter()
				.map(|r| MockedEndpoint::new(self.core.inputs.rules.add_http(r)))
				.collect(),
		)
	}

	/// Atomically replaces the HTTP rules. WebSocket rules and the fallback
	/// are left untouched.
	pub fn set_request_rules(&self, rules: Vec<Rule>) -> Result<Vec<MockedEndpoint>, ConfigError> {
		for rule in &rules {
			self.check_options_rule(&rule.matcher)?;
		}
		Ok(
			self
				.core
				.inputs
				.rules
				.set_http(rules)
				.into_iter()
				.map(|s| MockedEndpoint::new(s))
				.collect(),
		)
	}

	pub fn add_websocket_rules(
		&self,
		rules: Vec<WsRule>,
	) -> Result<Vec<MockedEndpoint>, ConfigError> {
		Ok(
			rules
				.into_iter()
				.map(|r| MockedEndpoint::new(self.core.inputs.rules.add_ws(r)))
				.collect(),
		)
	}

	/// Atomically replaces the WebSocket rules; HTTP rules and the fallback
	/// are left untouched.
	pub fn set_websocket_rules(
		&self,
		rules: Vec<WsRule>,
	) -> Result<Vec<MockedEndpoint>, ConfigError> {
		Ok(
			self
				.core
				.inputs
				.rules
				.set_ws(rules)
				.into_iter()
				.map(|s| MockedEndpoint::new(s))
				.collect(),
		)
	}

	#[deprecated(note = "use add_request_rules")]
	pub fn add_rule(&self, rule: Rule) -> Result<MockedEndpoint, ConfigError> {
		Ok(
			self
				.add_request_rules(vec![rule])?
				.pop()
				.expect("one rule in, one endpoint out"),
		)
	}

	#[deprecated(note = "use add_request_rules")]
	pub fn add_rules(&self, rules: Vec<Rule>) -> Result<Vec<MockedEndpoint>, ConfigError> {
		self.add_request_rules(rules)
	}

	#[deprecated(note = "use set_request_rules")]
	pub fn set_rules(&self, rules: Vec<Rule>) -> Result<Vec<MockedEndpoint>, ConfigError> {
		self.set_request_rules(rules)
	}

	// Introspection.

	pub fn mocked_endpoints(&self) -> Vec<MockedEndpoint> {
		self.core.inputs.rules.endpoints()
	}

	/// Endpoints still expecting traffic.
	pub fn pending_endpoints(&self) -> Vec<MockedEndpoint> {
		self
			.mocked_endpoints()
			.into_iter()
			.filter(|e| e.is_pending())
			.collect()
	}

	// Events.

	/// Subscribes to one lifecycle event kind. Events published after this
	/// returns are guaranteed delivered to the subscription.
	pub fn subscribe(&self, kind: EventKind) -> EventSubscription {
		self.core.inputs.events.subscribe(kind)
	}

	#[deprecated(note = "use subscribe(EventKind::TlsClientError)")]
	pub fn on_tls_client_error(&self) -> EventSubscription {
		self.subscribe(EventKind::TlsClientError)
	}

	fn check_options_rule(&self, matcher: &Matcher) -> Result<(), ConfigError> {
		if self.core.inputs.opts.cors.is_some() && mentions_options(matcher) {
			return Err(ConfigError::OptionsWithCors);
		}
		Ok(())
	}
}

impl RegisterRules for MockServer {
	fn register_http(&self, rule: Rule, fallback: bool) -> Result<MockedEndpoint, ConfigError> {
		self.check_options_rule(&rule.matcher)?;
		let state = if fallback {
			self.core.inputs.rules.set_fallback(rule)?
		} else {
			self.core.inputs.rules.add_http(rule)
		};
		Ok(MockedEndpoint::new(state))
	}

	fn register_ws(&self, rule: WsRule) -> Result<MockedEndpoint, ConfigError> {
		Ok(MockedEndpoint::new(self.core.inputs.rules.add_ws(rule)))
	}
}

fn mentions_options(matcher: &Matcher) -> bool {
	match matcher {
		Matcher::Method(m) => m == Method::OPTIONS,
		Matcher::All(children) | Matcher::Any(children) => children.iter().any(mentions_options),
		_ => false,
	}
}

impl Drop for ServerCore {
	fn drop(&mut self) {
		if let Lifecycle::Running(r) =
			std::mem::replace(self.state.get_mut(), Lifecycle::Stopped)
		{
			r.accept_task.abort();
			let _ = r.force.send(());
		}
	}
}

impl std::fmt::Debug for MockServer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MockServer")
			.field("port", &self.port().ok())
			.finish()
	}
}

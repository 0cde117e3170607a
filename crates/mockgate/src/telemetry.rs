use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

static RELOAD: OnceCell<reload::Handle<EnvFilter, Registry>> = OnceCell::new();

fn default_directive(debug: bool) -> String {
	if debug {
		"mockgate=debug".to_string()
	} else {
		"mockgate=warn".to_string()
	}
}

/// Installs the subscriber once per process. `RUST_LOG` wins over the
/// configured default. A second server initializing is a no-op.
pub(crate) fn init(debug: bool) {
	static ONCE: std::sync::Once = std::sync::Once::new();
	ONCE.call_once(|| {
		let filter = EnvFilter::try_from_default_env()
			.unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));
		let (filter, handle) = reload::Layer::new(filter);
		if tracing_subscriber::registry()
			.with(filter)
			.with(fmt::layer())
			.try_init()
			.is_ok()
		{
			let _ = RELOAD.set(handle);
		}
	});
}

/// Raises the filter to debug at runtime. Only effective when this crate
/// installed the subscriber; an embedding application's subscriber is left
/// alone.
pub(crate) fn enable_debug() {
	init(true);
	if let Some(handle) = RELOAD.get() {
		let _ = handle.modify(|f| *f = EnvFilter::new(default_directive(true)));
	}
}

use std::net::IpAddr;

use anyhow::anyhow;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use tracing::debug;

/// Name resolution for upstream dials. Hickory keeps its own TTL-driven
/// cache, which is plenty for a mock server's outbound traffic.
pub(crate) struct Resolver {
	inner: TokioAsyncResolver,
}

impl Resolver {
	pub fn system() -> Resolver {
		let (cfg, opts) = hickory_resolver::system_conf::read_system_conf()
			.unwrap_or_else(|_| (ResolverConfig::default(), ResolverOpts::default()));
		Resolver {
			inner: TokioAsyncResolver::tokio(cfg, opts),
		}
	}

	pub async fn resolve(&self, host: &str) -> anyhow::Result<IpAddr> {
		if let Ok(ip) = host.parse::<IpAddr>() {
			return Ok(ip);
		}
		// The OS resolver maps localhost; hickory may not, depending on the
		// host configuration.
		if host.eq_ignore_ascii_case("localhost") {
			return Ok(IpAddr::from([127, 0, 0, 1]));
		}
		let lookup = self.inner.lookup_ip(host).await?;
		let ip = lookup
			.iter()
			.next()
			.ok_or_else(|| anyhow!("no addresses found for {host}"))?;
		debug!(host, %ip, "resolved upstream host");
		Ok(ip)
	}
}

impl std::fmt::Debug for Resolver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Resolver").finish()
	}
}

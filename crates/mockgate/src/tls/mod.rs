pub mod verify;

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use rcgen::{CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose, SerialNumber};
use rustls::ServerConfig;
use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::debug;

use crate::config::Http2Mode;

pub static ALL_TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] =
	&[&rustls::version::TLS12, &rustls::version::TLS13];

pub fn provider() -> Arc<CryptoProvider> {
	Arc::new(rustls::crypto::ring::default_provider())
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("invalid CA key: {0}")]
	CaKey(rcgen::Error),
	#[error("invalid CA certificate: {0}")]
	CaCertificate(String),
	#[error("certificate minting failed: {0}")]
	Minting(#[from] rcgen::Error),
	#[error("rustls rejected minted key: {0}")]
	Rustls(#[from] rustls::Error),
}

/// Mints per-hostname leaf certificates signed by the caller-supplied CA.
///
/// Leaves are cached by hostname for the whole server lifetime; `reset()`
/// deliberately does not evict so certificates stay stable across tests.
pub struct MintingAuthority {
	ca_key: KeyPair,
	ca_cert: rcgen::Certificate,
	// The caller's CA cert exactly as supplied, appended to minted chains.
	ca_der: CertificateDer<'static>,
	ca_serial: Vec<u8>,
	cache: RwLock<HashMap<String, Arc<CertifiedKey>>>,
	provider: Arc<CryptoProvider>,
}

impl MintingAuthority {
	pub fn from_pem(key_pem: &str, cert_pem: &str) -> Result<Self, Error> {
		let ca_key = KeyPair::from_pem(key_pem).map_err(Error::CaKey)?;
		let params = CertificateParams::from_ca_cert_pem(cert_pem)
			.map_err(|e| Error::CaCertificate(e.to_string()))?;
		// Re-signing with the same key and subject produces an issuer whose
		// DN matches the supplied cert, so chains validate against the
		// original CA the caller distributed to clients.
		let ca_cert = params.self_signed(&ca_key).map_err(Error::CaKey)?;
		let ca_der = pem_to_der(cert_pem)?;
		let ca_serial = ca_cert_serial(&ca_der)?;
		Ok(MintingAuthority {
			ca_key,
			ca_cert,
			ca_der,
			ca_serial,
			cache: RwLock::new(HashMap::new()),
			provider: provider(),
		})
	}

	/// Returns the cached leaf for `hostname`, minting it on first use.
	pub fn certificate_for(&self, hostname: &str) -> Result<Arc<CertifiedKey>, Error> {
		if let Some(found) = self.cache.read().get(hostname) {
			return Ok(found.clone());
		}
		let mut cache = self.cache.write();
		// Racing minters are fine; first write wins.
		if let Some(found) = cache.get(hostname) {
			return Ok(found.clone());
		}
		let minted = self.mint(hostname)?;
		debug!(hostname, "minted leaf certificate");
		cache.insert(hostname.to_string(), minted.clone());
		Ok(minted)
	}

	fn mint(&self, hostname: &str) -> Result<Arc<CertifiedKey>, Error> {
		let mut names = vec![hostname.to_string()];
		if hostname.parse::<std::net::IpAddr>().is_err() && !hostname.starts_with("*.") {
			names.push(format!("*.{hostname}"));
		}
		let mut params = CertificateParams::new(names)?;
		params
			.distinguished_name
			.push(DnType::CommonName, hostname);
		params.serial_number = Some(SerialNumber::from(
			serial_for(hostname, &self.ca_serial).to_be_bytes().to_vec(),
		));
		let now = time::OffsetDateTime::now_utc();
		params.not_before = now - time::Duration::hours(1);
		params.not_after = now + time::Duration::days(365);
		params.use_authority_key_identifier_extension = true;
		params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
		params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

		let leaf_key = KeyPair::generate()?;
		let leaf = params.signed_by(&leaf_key, &self.ca_cert, &self.ca_key)?;

		let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
		let signing_key = self
			.provider
			.key_provider
			.load_private_key(key_der)
			.map_err(Error::Rustls)?;
		let chain = vec![leaf.der().clone(), self.ca_der.clone()];
		Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
	}
}

impl std::fmt::Debug for MintingAuthority {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MintingAuthority")
			.field("cached", &self.cache.read().len())
			.finish()
	}
}

fn serial_for(hostname: &str, ca_serial: &[u8]) -> u64 {
	let mut hasher = std::hash::DefaultHasher::new();
	hostname.hash(&mut hasher);
	ca_serial.hash(&mut hasher);
	hasher.finish()
}

fn pem_to_der(cert_pem: &str) -> Result<CertificateDer<'static>, Error> {
	let mut reader = std::io::Cursor::new(cert_pem.as_bytes());
	rustls_pemfile::certs(&mut reader)
		.next()
		.transpose()
		.map_err(|e| Error::CaCertificate(e.to_string()))?
		.ok_or_else(|| Error::CaCertificate("no certificate found in PEM".to_string()))
}

fn ca_cert_serial(der: &CertificateDer<'static>) -> Result<Vec<u8>, Error> {
	let (_, parsed) = x509_parser::parse_x509_certificate(der.as_ref())
		.map_err(|e| Error::CaCertificate(e.to_string()))?;
	Ok(parsed.raw_serial().to_vec())
}

/// Picks the leaf by SNI; CONNECT tunnels with no SNI fall back to the
/// tunnel's destination host.
#[derive(Debug)]
pub struct SniResolver {
	pub authority: Arc<MintingAuthority>,
	pub default_name: Option<String>,
}

impl ResolvesServerCert for SniResolver {
	fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
		let name = client_hello
			.server_name()
			.map(str::to_string)
			.or_else(|| self.default_name.clone())?;
		self.authority.certificate_for(&name).ok()
	}
}

/// ALPN offer derived from the configured policy and the client's own list.
/// `Fallback` only offers h2 to clients that did not include http/1.1.
pub fn alpn_protocols(mode: Http2Mode, client_alpn: Option<&[&[u8]]>) -> Vec<Vec<u8>> {
	match mode {
		Http2Mode::Enabled => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
		Http2Mode::Disabled => vec![b"http/1.1".to_vec()],
		Http2Mode::Fallback => {
			let client_has_h1 = client_alpn
				.map(|list| list.iter().any(|p| *p == b"http/1.1"))
				.unwrap_or(true);
			if client_has_h1 {
				vec![b"http/1.1".to_vec()]
			} else {
				vec![b"h2".to_vec(), b"http/1.1".to_vec()]
			}
		},
	}
}

pub fn server_config(
	authority: Arc<MintingAuthority>,
	default_name: Option<String>,
	alpn: Vec<Vec<u8>>,
) -> Result<Arc<ServerConfig>, Error> {
	let mut cfg = ServerConfig::builder_with_provider(provider())
		.with_protocol_versions(ALL_TLS_VERSIONS)?
		.with_no_client_auth()
		.with_cert_resolver(Arc::new(SniResolver {
			authority,
			default_name,
		}));
	cfg.alpn_protocols = alpn;
	Ok(Arc::new(cfg))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_ca() -> (String, String) {
		let key = KeyPair::generate().unwrap();
		let mut params = CertificateParams::new(vec![]).unwrap();
		params
			.distinguished_name
			.push(DnType::CommonName, "mockgate test CA");
		params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
		params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
		let cert = params.self_signed(&key).unwrap();
		(key.serialize_pem(), cert.pem())
	}

	#[test]
	fn mints_and_caches_by_hostname() {
		let (key, cert) = test_ca();
		let ca = MintingAuthority::from_pem(&key, &cert).unwrap();
		let a = ca.certificate_for("example.test").unwrap();
		let b = ca.certificate_for("example.test").unwrap();
		assert!(Arc::ptr_eq(&a, &b));
		let other = ca.certificate_for("other.test").unwrap();
		assert!(!Arc::ptr_eq(&a, &other));
	}

	#[test]
	fn minted_leaf_carries_hostname_san() {
		let (key, cert) = test_ca();
		let ca = MintingAuthority::from_pem(&key, &cert).unwrap();
		let minted = ca.certificate_for("example.test").unwrap();
		let (_, leaf) = x509_parser::parse_x509_certificate(minted.cert[0].as_ref()).unwrap();
		let sans = leaf
			.subject_alternative_name()
			.unwrap()
			.map(|ext| format!("{:?}", ext.value))
			.unwrap_or_default();
		assert!(sans.contains("example.test"));
	}

	#[test]
	fn serials_are_stable_per_hostname() {
		assert_eq!(serial_for("a.test", b"1"), serial_for("a.test", b"1"));
		assert_ne!(serial_for("a.test", b"1"), serial_for("b.test", b"1"));
	}

	#[test]
	fn fallback_alpn_follows_client_list() {
		let h2_only: &[&[u8]] = &[b"h2"];
		let with_h1: &[&[u8]] = &[b"h2", b"http/1.1"];
		assert_eq!(
			alpn_protocols(Http2Mode::Fallback, Some(h2_only)),
			vec![b"h2".to_vec(), b"http/1.1".to_vec()]
		);
		assert_eq!(
			alpn_protocols(Http2Mode::Fallback, Some(with_h1)),
			vec![b"http/1.1".to_vec()]
		);
	}
}

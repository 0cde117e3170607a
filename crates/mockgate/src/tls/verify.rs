use std::sync::Arc;

use rustls::DigitallySignedStruct;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

/// Accepts any upstream certificate. Used only for exchanges whose
/// destination matched an `ignore_host_certificate_errors` entry; everything
/// else verifies against the system roots.
#[derive(Debug)]
pub struct AcceptAnyServerCert {
	provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
	pub fn new(provider: Arc<CryptoProvider>) -> Self {
		Self { provider }
	}
}

impl ServerCertVerifier for AcceptAnyServerCert {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls12_signature(
			message,
			cert,
			dss,
			&self.provider.signature_verification_algorithms,
		)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls13_signature(
			message,
			cert,
			dss,
			&self.provider.signature_verification_algorithms,
		)
	}

	fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
		self
			.provider
			.signature_verification_algorithms
			.supported_schemes()
	}
}

/// Matches a destination against `ignore_host_certificate_errors` entries:
/// exact `host`, exact `host:port`, or a `*.suffix` glob.
pub fn destination_matches(patterns: &[String], host: &str, port: u16) -> bool {
	let host_port = format!("{host}:{port}");
	patterns.iter().any(|p| {
		if let Some(suffix) = p.strip_prefix("*.") {
			host == suffix || host.ends_with(&format!(".{suffix}"))
		} else {
			p == host || p == &host_port
		}
	})
}

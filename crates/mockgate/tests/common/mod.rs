#![allow(dead_code)]

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};

/// A throwaway CA for man-in-the-middle tests. Returns (key PEM, cert PEM).
pub fn test_ca() -> (String, String) {
	let key = KeyPair::generate().expect("generate CA key");
	let mut params = CertificateParams::new(vec![]).expect("CA params");
	params
		.distinguished_name
		.push(DnType::CommonName, "mockgate test CA");
	params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
	let cert = params.self_signed(&key).expect("self-sign CA");
	(key.serialize_pem(), cert.pem())
}

/// A plain HTTP client that ignores proxy environment variables.
pub fn http_client() -> reqwest::Client {
	reqwest::Client::builder()
		.no_proxy()
		.build()
		.expect("client builds")
}

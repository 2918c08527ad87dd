//! TLS client configuration: system roots, extra CA bundles, and an
//! insecure no-verify mode for test servers.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::{ClientConfig, SignatureScheme};
use rustls_pki_types::ServerName;

use crate::error::LdapError;

/// Client config trusting the system root certificates.
pub fn client_config() -> Result<Arc<ClientConfig>, LdapError> {
    client_config_with_roots(None)
}

/// Client config trusting the system roots plus a PEM CA bundle.
pub fn client_config_with_ca(extra_ca_pem: &[u8]) -> Result<Arc<ClientConfig>, LdapError> {
    client_config_with_roots(Some(extra_ca_pem))
}

fn client_config_with_roots(extra_ca_pem: Option<&[u8]>) -> Result<Arc<ClientConfig>, LdapError> {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs()
        .map_err(|e| LdapError::TlsConfig(format!("load system CA certs: {}", e)))?
    {
        let _ = root_store.add(cert);
    }
    if let Some(pem) = extra_ca_pem {
        for cert in rustls_pemfile::certs(&mut std::io::Cursor::new(pem)) {
            let cert = cert.map_err(|e| LdapError::TlsConfig(format!("parse CA PEM: {}", e)))?;
            let _ = root_store.add(cert);
        }
    }
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Client config that accepts any server certificate. Only for test
/// servers and internal networks.
pub fn insecure_client_config() -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(InsecureServerVerifier));
    Arc::new(config)
}

/// Verifier that accepts any server certificate.
#[derive(Debug)]
struct InsecureServerVerifier;

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

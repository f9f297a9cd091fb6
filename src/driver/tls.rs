//! Client TLS configuration.
//!
//! TLS is opt-in per connection: without a CA there is no TLS. With a CA the
//! server chain is verified against exactly that CA, but the host name is
//! not checked, since metadata databases are routinely reached through
//! addresses that do not appear in their certificates.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("ssl_cert and ssl_key must be both set or unset")]
    IncompletePair,

    #[error("invalid PEM in {field}: {message}")]
    Pem { field: &'static str, message: String },

    #[error("no certificate found in {0}")]
    NoCertificate(&'static str),

    #[error("no private key found in ssl_key")]
    NoPrivateKey,

    #[error("failed to build certificate verifier: {0}")]
    Verifier(String),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// PEM-encoded TLS material for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub ssl_ca: Option<String>,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
}

/// Validated view of a [`TlsConfig`] with TLS enabled.
#[derive(Debug, Clone, Copy)]
pub struct TlsMaterial<'a> {
    pub ca: &'a str,
    /// Client certificate and key, for mutual TLS.
    pub client: Option<(&'a str, &'a str)>,
}

impl TlsConfig {
    /// Checks the material without building anything.
    ///
    /// Returns `None` when no CA is configured.
    pub fn material(&self) -> Result<Option<TlsMaterial<'_>>, TlsError> {
        let Some(ca) = non_empty(&self.ssl_ca) else {
            return Ok(None);
        };
        let client = match (non_empty(&self.ssl_cert), non_empty(&self.ssl_key)) {
            (Some(cert), Some(key)) => Some((cert, key)),
            (None, None) => None,
            _ => return Err(TlsError::IncompletePair),
        };
        Ok(Some(TlsMaterial { ca, client }))
    }

    /// Builds a rustls client config, or `None` when TLS is not configured.
    pub fn client_config(&self) -> Result<Option<ClientConfig>, TlsError> {
        let Some(material) = self.material()? else {
            return Ok(None);
        };

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = ChainOnlyVerifier::new(material.ca, provider.clone())?;
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier));

        let config = match material.client {
            Some((cert, key)) => {
                builder.with_client_auth_cert(parse_certs(cert, "ssl_cert")?, parse_key(key)?)?
            }
            None => builder.with_no_client_auth(),
        };
        Ok(Some(config))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

fn parse_certs(pem: &str, field: &'static str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = pem.as_bytes();
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Pem {
            field,
            message: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(field));
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = pem.as_bytes();
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::Pem {
            field: "ssl_key",
            message: e.to_string(),
        })?
        .ok_or(TlsError::NoPrivateKey)
}

/// Verifies the server chain and handshake signatures against a fixed root
/// store, accepting certificates whose names do not match the host.
#[derive(Debug)]
pub struct ChainOnlyVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ChainOnlyVerifier {
    pub fn new(ca_pem: &str, provider: Arc<CryptoProvider>) -> Result<Self, TlsError> {
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(ca_pem, "ssl_ca")? {
            roots.add(cert)?;
        }
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| TlsError::Verifier(e.to_string()))?;
        Ok(Self { inner })
    }
}

impl ServerCertVerifier for ChainOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CA: &str = include_str!("testdata/ca.pem");
    const SERVER_CERT: &str = include_str!("testdata/server.pem");
    const SERVER_KEY: &str = include_str!("testdata/server.key");
    const UNTRUSTED: &str = include_str!("testdata/other.pem");

    fn tls(ca: Option<&str>, cert: Option<&str>, key: Option<&str>) -> TlsConfig {
        TlsConfig {
            ssl_ca: ca.map(str::to_string),
            ssl_cert: cert.map(str::to_string),
            ssl_key: key.map(str::to_string),
        }
    }

    fn verifier() -> ChainOnlyVerifier {
        ChainOnlyVerifier::new(CA, Arc::new(rustls::crypto::ring::default_provider())).unwrap()
    }

    #[test]
    fn test_no_ca_means_no_tls() {
        assert!(tls(None, None, None).client_config().unwrap().is_none());
        assert!(tls(Some("  "), None, None).client_config().unwrap().is_none());
        // A lone client pair without a CA still means plaintext.
        assert!(tls(None, Some(SERVER_CERT), None).material().unwrap().is_none());
    }

    #[test]
    fn test_cert_and_key_must_be_paired() {
        let err = tls(Some(CA), Some(SERVER_CERT), None).client_config().unwrap_err();
        assert!(matches!(err, TlsError::IncompletePair));
        let err = tls(Some(CA), None, Some(SERVER_KEY)).client_config().unwrap_err();
        assert!(err.to_string().contains("must be both set or unset"));
    }

    #[test]
    fn test_builds_config_with_ca() {
        assert!(tls(Some(CA), None, None).client_config().unwrap().is_some());
    }

    #[test]
    fn test_builds_config_with_client_auth() {
        let config = tls(Some(CA), Some(SERVER_CERT), Some(SERVER_KEY))
            .client_config()
            .unwrap();
        assert!(config.is_some());
    }

    #[test]
    fn test_garbage_ca_rejected() {
        let err = tls(Some("not a certificate"), None, None)
            .client_config()
            .unwrap_err();
        assert!(matches!(err, TlsError::NoCertificate("ssl_ca")));
    }

    #[test]
    fn test_chain_verified_without_hostname() {
        let verifier = verifier();
        let leaf = parse_certs(SERVER_CERT, "ssl_cert").unwrap().remove(0);

        for host in ["db.internal", "10.0.0.12.nip.io", "elsewhere.example"] {
            let name = ServerName::try_from(host).unwrap();
            verifier
                .verify_server_cert(&leaf, &[], &name, &[], UnixTime::now())
                .unwrap_or_else(|e| panic!("{host}: {e}"));
        }
    }

    #[test]
    fn test_untrusted_chain_rejected() {
        let verifier = verifier();
        let leaf = parse_certs(UNTRUSTED, "ssl_cert").unwrap().remove(0);
        let name = ServerName::try_from("untrusted").unwrap();
        assert!(verifier
            .verify_server_cert(&leaf, &[], &name, &[], UnixTime::now())
            .is_err());
    }
}

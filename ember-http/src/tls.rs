//! TLS context construction and mutual-TLS session extraction.
//!
//! Certificates come from a PEM file pair, a combined PEM, an injected
//! `ServerConfig`, or a self-signed certificate generated at startup for
//! devices not yet provisioned with one. Only TLS 1.2 and 1.3 are
//! offered.
//!
//! Mutual TLS is deliberately tolerant at handshake time: any presented
//! client certificate is accepted so the full authentication flow stays
//! available, and the certificate is inspected afterwards. A session is
//! attached to the connection's requests only when the end-entity
//! certificate carries KeyUsage digitalSignature and keyAgreement plus
//! ExtendedKeyUsage clientAuth; the subject common name becomes the user
//! name.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::ServerConfig;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::error::Error;

/// Where the server certificate comes from.
#[derive(Clone)]
pub enum TlsSource {
    /// Separate certificate and private-key PEM files.
    Files { cert: PathBuf, key: PathBuf },
    /// One PEM carrying both certificate chain and private key.
    CombinedPem(PathBuf),
    /// A prebuilt rustls configuration, used as-is.
    Config(Arc<ServerConfig>),
    /// A fresh self-signed certificate, generated at startup.
    SelfSigned,
}

impl std::fmt::Debug for TlsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Files { cert, key } => f
                .debug_struct("Files")
                .field("cert", cert)
                .field("key", key)
                .finish(),
            Self::CombinedPem(path) => f.debug_tuple("CombinedPem").field(path).finish(),
            Self::Config(_) => f.write_str("Config(..)"),
            Self::SelfSigned => f.write_str("SelfSigned"),
        }
    }
}

/// Builds the acceptor for the configured source; called at startup and
/// again on SIGHUP.
pub(crate) fn build_acceptor(source: &TlsSource) -> Result<TlsAcceptor, Error> {
    let config = match source {
        TlsSource::Config(config) => config.clone(),
        TlsSource::Files { cert, key } => {
            let certs = load_certs(cert)?;
            let key = load_key(key)?;
            Arc::new(server_config(certs, key)?)
        }
        TlsSource::CombinedPem(path) => {
            let certs = load_certs(path)?;
            let key = load_key(path)?;
            Arc::new(server_config(certs, key)?)
        }
        TlsSource::SelfSigned => {
            info!("no certificate configured, generating a self-signed one");
            let rcgen::CertifiedKey { cert, signing_key } =
                rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])
                    .map_err(Error::new_tls_config)?;
            let key = PrivateKeyDer::Pkcs8(signing_key.serialize_der().into());
            Arc::new(server_config(vec![cert.der().clone()], key)?)
        }
    };
    Ok(TlsAcceptor::from(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    CertificateDer::pem_file_iter(path)
        .map_err(Error::new_tls_config)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(Error::new_tls_config)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    PrivateKeyDer::from_pem_file(path).map_err(Error::new_tls_config)
}

fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, Error> {
    let builder = ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ]);

    #[cfg(feature = "mtls")]
    let builder = builder.with_client_cert_verifier(Arc::new(verify::TolerantClientVerifier::new()));
    #[cfg(not(feature = "mtls"))]
    let builder = builder.with_no_client_auth();

    builder
        .with_single_cert(certs, key)
        .map_err(Error::new_tls_config)
}

/// Extracts the authenticated session from a finished handshake, when
/// mutual TLS is enabled and the peer certificate qualifies.
#[cfg(feature = "mtls")]
pub(crate) fn session_from_stream(
    stream: &tokio_rustls::server::TlsStream<tokio::net::TcpStream>,
) -> Option<crate::request::UserSession> {
    let (_, connection) = stream.get_ref();
    let end_entity = connection.peer_certificates()?.first()?;
    session_from_cert(end_entity.as_ref())
}

#[cfg(not(feature = "mtls"))]
pub(crate) fn session_from_stream(
    _stream: &tokio_rustls::server::TlsStream<tokio::net::TcpStream>,
) -> Option<crate::request::UserSession> {
    None
}

#[cfg(feature = "mtls")]
fn session_from_cert(der: &[u8]) -> Option<crate::request::UserSession> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;

    let key_usage = cert.key_usage().ok().flatten()?;
    if !key_usage.value.digital_signature() || !key_usage.value.key_agreement() {
        tracing::debug!("client certificate KeyUsage does not allow user authentication");
        return None;
    }

    let eku = cert.extended_key_usage().ok().flatten()?;
    if !eku.value.client_auth {
        tracing::debug!("client certificate ExtendedKeyUsage lacks clientAuth");
        return None;
    }

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())?;
    if common_name.is_empty() {
        return None;
    }
    info!(user = common_name, "mutual-TLS session established");
    Some(crate::request::UserSession {
        username: common_name.to_owned(),
    })
}

#[cfg(feature = "mtls")]
mod verify {
    use std::sync::Arc;

    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, UnixTime};
    use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
    use rustls::DistinguishedName;

    /// Accepts any client certificate chain during the handshake; the
    /// authorization decision is made later from the certificate's
    /// contents, so clients without a qualifying certificate can still
    /// use the other authentication flows.
    #[derive(Debug)]
    pub(super) struct TolerantClientVerifier {
        provider: Arc<CryptoProvider>,
        subjects: Vec<DistinguishedName>,
    }

    impl TolerantClientVerifier {
        pub(super) fn new() -> Self {
            Self {
                provider: Arc::new(rustls::crypto::ring::default_provider()),
                subjects: Vec::new(),
            }
        }
    }

    impl ClientCertVerifier for TolerantClientVerifier {
        fn root_hint_subjects(&self) -> &[DistinguishedName] {
            &self.subjects
        }

        fn offer_client_auth(&self) -> bool {
            true
        }

        fn client_auth_mandatory(&self) -> bool {
            false
        }

        fn verify_client_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _now: UnixTime,
        ) -> Result<ClientCertVerified, rustls::Error> {
            Ok(ClientCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(
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
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_acceptor_builds() {
        assert!(build_acceptor(&TlsSource::SelfSigned).is_ok());
    }

    #[test]
    fn missing_files_surface_config_errors() {
        let err = build_acceptor(&TlsSource::Files {
            cert: "/nonexistent/cert.pem".into(),
            key: "/nonexistent/key.pem".into(),
        })
        .unwrap_err();
        assert!(err.to_string().contains("TLS"));
    }

    #[cfg(feature = "mtls")]
    #[test]
    fn qualifying_certificate_yields_a_session() {
        let mut params = rcgen::CertificateParams::new(Vec::new()).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "alice");
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::DigitalSignature,
            rcgen::KeyUsagePurpose::KeyAgreement,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        let session = session_from_cert(cert.der()).unwrap();
        assert_eq!(session.username, "alice");
    }

    #[cfg(feature = "mtls")]
    #[test]
    fn certificate_without_client_auth_is_rejected() {
        let mut params = rcgen::CertificateParams::new(Vec::new()).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "mallory");
        params.key_usages = vec![rcgen::KeyUsagePurpose::DigitalSignature];
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        assert!(session_from_cert(cert.der()).is_none());
    }
}

//! TLS client configuration
//!
//! Relay deployments commonly run on self-signed certificates, so the
//! default client configuration disables certificate verification. Verified
//! mode (webpki roots, optionally extended with a CA file) stays available
//! through the same options.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Once};

use rustls::pki_types::ServerName;

use crate::error::{TransportError, TransportResult};

/// Build a rustls TlsConnector for the relay connection.
///
/// With `verify` off, certificate chains and names are not checked;
/// handshake signatures still are. With it on, the webpki root store is
/// used, extended with `ca_cert_file` when given.
pub(crate) fn build_tls_connector(
    verify: bool,
    ca_cert_file: Option<&Path>,
) -> TransportResult<tokio_rustls::TlsConnector> {
    init_crypto_provider();

    let client_crypto = if verify {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = ca_cert_file {
            for cert in read_ca_bundle(path)? {
                roots.add(cert).map_err(|e| {
                    TransportError::ConfigurationError(format!(
                        "CA certificate in '{}' not usable: {}",
                        path.display(),
                        e
                    ))
                })?;
            }
        }

        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TrustAnyCert::default_provider()))
            .with_no_client_auth()
    };

    Ok(tokio_rustls::TlsConnector::from(Arc::new(client_crypto)))
}

/// Resolve the SNI name: an explicit override wins over the endpoint host.
pub(crate) fn server_name(
    host: &str,
    override_name: Option<&str>,
) -> TransportResult<ServerName<'static>> {
    let name = override_name.unwrap_or(host);
    ServerName::try_from(name.to_string())
        .map_err(|e| TransportError::TlsError(format!("Invalid server name '{}': {}", name, e)))
}

/// Install the ring crypto provider process-wide, once.
///
/// A binary that installed its own provider earlier wins; the error from
/// `install_default` only means one is already in place.
pub(crate) fn init_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("A rustls crypto provider is already installed");
        }
    });
}

fn read_ca_bundle(path: &Path) -> TransportResult<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsError(format!("Cannot open CA bundle '{}': {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            TransportError::TlsError(format!("Cannot parse CA bundle '{}': {}", path.display(), e))
        })
}

/// Verifier that accepts whatever certificate the relay presents.
///
/// Chain and hostname checks are skipped; handshake signatures are still
/// verified with the provider's algorithms.
#[derive(Debug)]
struct TrustAnyCert(rustls::crypto::CryptoProvider);

impl TrustAnyCert {
    fn default_provider() -> Self {
        Self(rustls::crypto::ring::default_provider())
    }
}

impl rustls::client::danger::ServerCertVerifier for TrustAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

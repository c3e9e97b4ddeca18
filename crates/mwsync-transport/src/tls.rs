//! TLS setup for the native backend.

use crate::TransportError;
use std::path::PathBuf;

/// How broker certificates are validated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CertificatePolicy {
    /// Plain TCP
    #[default]
    Disabled,
    /// Validate against the platform root store
    SystemRoots,
    /// Validate against a PEM bundle on disk
    CaFile(PathBuf),
    /// Accept any certificate. Needs the `insecure-trust-all` feature.
    TrustAll,
}

impl CertificatePolicy {
    /// Whether the link is encrypted at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Build the `rumqttc` transport for this policy.
    ///
    /// # Errors
    ///
    /// Returns error if the CA bundle cannot be read, or trust-all is asked
    /// for in a build without the `insecure-trust-all` feature.
    pub fn to_rumqttc(&self) -> Result<Option<rumqttc::Transport>, TransportError> {
        match self {
            Self::Disabled => Ok(None),
            Self::SystemRoots => Ok(Some(rumqttc::Transport::tls_with_default_config())),
            Self::CaFile(path) => {
                let ca = std::fs::read(path)
                    .map_err(|e| TransportError::Tls(format!("{}: {e}", path.display())))?;
                Ok(Some(rumqttc::Transport::tls(ca, None, None)))
            }
            Self::TrustAll => trust_all(),
        }
    }
}

#[cfg(feature = "insecure-trust-all")]
fn trust_all() -> Result<Option<rumqttc::Transport>, TransportError> {
    use std::sync::Arc;

    tracing::warn!("TLS certificate validation is disabled");
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(insecure::AcceptAnyCertificate::new()))
        .with_no_client_auth();
    Ok(Some(rumqttc::Transport::tls_with_config(
        rumqttc::TlsConfiguration::Rustls(Arc::new(config)),
    )))
}

#[cfg(not(feature = "insecure-trust-all"))]
fn trust_all() -> Result<Option<rumqttc::Transport>, TransportError> {
    Err(TransportError::Tls(
        "trust-all certificate policy requires the insecure-trust-all feature".to_string(),
    ))
}

#[cfg(feature = "insecure-trust-all")]
mod insecure {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Skips chain and name checks but still verifies handshake signatures.
    #[derive(Debug)]
    pub struct AcceptAnyCertificate {
        provider: CryptoProvider,
    }

    impl AcceptAnyCertificate {
        pub fn new() -> Self {
            Self {
                provider: rustls::crypto::ring::default_provider(),
            }
        }
    }

    impl ServerCertVerifier for AcceptAnyCertificate {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.provider.signature_verification_algorithms.supported_schemes()
        }
    }
}

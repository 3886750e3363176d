//! rustls adapter enforcing certificate pins during the handshake.
//!
//! The pinned fingerprint replaces the CA chain as the trust anchor:
//! [`PinnedServerVerifier`] accepts a server certificate iff the pinner
//! accepts it, and still verifies handshake signatures against the peer
//! key so a pinned certificate cannot be replayed by a peer without the
//! private key.

use super::{CertificatePinner, PinCheck};
use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;

#[derive(Debug)]
pub struct PinnedServerVerifier {
    pinner: CertificatePinner,
    provider: CryptoProvider,
}

impl PinnedServerVerifier {
    #[must_use]
    pub fn new(pinner: CertificatePinner) -> Self {
        Self {
            pinner,
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let hostname = match server_name {
            ServerName::DnsName(name) => name.as_ref().to_string(),
            ServerName::IpAddress(ip) => std::net::IpAddr::from(*ip).to_string(),
            _ => {
                return Err(rustls::Error::General(
                    "unsupported server name form".to_string(),
                ))
            }
        };

        match self.pinner.validate(end_entity.as_ref(), &hostname) {
            PinCheck::Accepted => Ok(ServerCertVerified::assertion()),
            PinCheck::Rejected { .. } => Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            )),
        }
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

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// HTTP client whose TLS layer only accepts certificates the pinner
/// accepts. Both backend clients (tabular store, keystore) are built
/// through here.
///
/// # Errors
/// Returns an error if the client cannot be constructed.
pub fn pinned_client(pinner: CertificatePinner, user_agent: &str) -> Result<reqwest::Client> {
    let tls = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier::new(pinner)))
        .with_no_client_auth();

    reqwest::Client::builder()
        .user_agent(user_agent)
        .use_preconfigured_tls(tls)
        .build()
        .context("Failed to build pinned HTTP client")
}

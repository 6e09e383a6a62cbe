//! The narrow cryptographic surface of the crate.
//!
//! TLS contexts for the secure listener and outbound secure connects, the
//! SHA-256 keyprint of a peer's leaf certificate, and keyprint validation
//! against the value a hub advertised.
//!
//! Peer certificates in this network are customarily self-signed and
//! pinned via keyprints, so when no trust roots are configured the client
//! side accepts any certificate and connections are marked untrusted; the
//! strictness of that is governed by `Config::allow_untrusted_clients`.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::text;

/// Errors raised while building TLS contexts.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Certificate material for the secure listener and outbound secure
/// connects.
pub struct TlsSettings {
    /// Our certificate chain, leaf first.
    pub cert_chain: Vec<CertificateDer<'static>>,
    /// The private key for the leaf certificate.
    pub key: PrivateKeyDer<'static>,
    /// Trust roots for verifying peers. `None` accepts any peer
    /// certificate and marks the connection untrusted.
    pub roots: Option<RootCertStore>,
}

/// Holder of the TLS contexts used by the connection manager.
pub struct CryptoContext {
    acceptor: Option<TlsAcceptor>,
    connector: TlsConnector,
    verifies_peers: bool,
}

impl CryptoContext {
    /// Builds the TLS contexts. With `None` no secure listener will run
    /// and outbound secure connects present no client certificate.
    pub fn new(tls: Option<TlsSettings>) -> Result<Self, CryptoError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifies_peers = tls.as_ref().is_some_and(|t| t.roots.is_some());

        let acceptor = match &tls {
            Some(settings) => {
                let config = ServerConfig::builder_with_provider(provider.clone())
                    .with_safe_default_protocol_versions()?
                    .with_no_client_auth()
                    .with_single_cert(settings.cert_chain.clone(), settings.key.clone_key())?;
                Some(TlsAcceptor::from(Arc::new(config)))
            }
            None => None,
        };

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;
        let builder = match tls.as_ref().and_then(|t| t.roots.clone()) {
            Some(roots) => builder.with_root_certificates(roots),
            None => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider))),
        };
        let client_config = match tls {
            Some(settings) => {
                builder.with_client_auth_cert(settings.cert_chain, settings.key)?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(Self {
            acceptor,
            connector: TlsConnector::from(Arc::new(client_config)),
            verifies_peers,
        })
    }

    /// Whether a secure listener can run.
    pub fn tls_ok(&self) -> bool {
        self.acceptor.is_some()
    }

    pub fn acceptor(&self) -> Option<TlsAcceptor> {
        self.acceptor.clone()
    }

    pub fn connector(&self) -> TlsConnector {
        self.connector.clone()
    }

    /// Whether completed handshakes verified the peer against trust
    /// roots; connections made without roots count as untrusted.
    pub fn verifies_peers(&self) -> bool {
        self.verifies_peers
    }
}

/// SHA-256 keyprint of a certificate.
pub fn keyprint(cert: &CertificateDer<'_>) -> Vec<u8> {
    Sha256::digest(cert.as_ref()).to_vec()
}

/// Validates a connection's keyprint against the one the hub advertised.
///
/// `kp` is the digest of the peer's leaf certificate (empty on plain
/// connections), `advertised` the hub-provided `SHA256/<base32>` string.
/// An empty local digest always passes; a missing advertised keyprint or
/// an unknown algorithm prefix passes when `accept_unknown` is set.
pub fn check_keyprint(kp: &[u8], advertised: Option<&str>, accept_unknown: bool) -> bool {
    if kp.is_empty() {
        return true;
    }
    let advertised = match advertised {
        Some(s) if !s.is_empty() => s,
        _ => return accept_unknown,
    };
    let encoded = match advertised.strip_prefix("SHA256/") {
        Some(rest) => rest,
        None => return accept_unknown,
    };

    let mut expected = vec![0u8; kp.len()];
    text::base32_decode_into(encoded, &mut expected);
    expected == kp
}

#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

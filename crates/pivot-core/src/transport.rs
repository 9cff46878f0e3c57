//! QUIC transport construction.
//!
//! One QUIC connection is the multiplexed transport: every session is a
//! bidirectional stream, flow-controlled independently, closable from
//! either end. The proxy runs the server endpoint and opens sessions; the
//! agent dials and accepts them.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{Endpoint, IdleTimeout, TransportConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::constants::{ALPN, IDLE_TIMEOUT, KEEP_ALIVE_INTERVAL};
use crate::error::{Error, Result};

/// A TLS identity for the server endpoint.
pub struct TlsIdentity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Load certificate chain and private key from PEM files.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = std::fs::read(cert_path)?;
        let key_pem = std::fs::read(key_path)?;

        let mut reader = std::io::BufReader::new(cert_pem.as_slice());
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Transport {
                message: format!("failed to parse certificate: {e}"),
            })?;
        if certs.is_empty() {
            return Err(Error::Transport {
                message: format!("no certificates found in {}", cert_path.display()),
            });
        }

        let mut reader = std::io::BufReader::new(key_pem.as_slice());
        let key = rustls_pemfile::private_key(&mut reader)
            .map_err(|e| Error::Transport {
                message: format!("failed to parse private key: {e}"),
            })?
            .ok_or_else(|| Error::Transport {
                message: format!("no private key found in {}", key_path.display()),
            })?;

        Ok(Self { certs, key })
    }

    /// Generate a throwaway self-signed identity.
    pub fn self_signed() -> Result<Self> {
        let certified = rcgen::generate_simple_self_signed(vec!["pivot-proxy".to_string()])
            .map_err(|e| Error::Transport {
                message: format!("failed to generate certificate: {e}"),
            })?;

        let cert_der = CertificateDer::from(certified.cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(certified.key_pair.serialize_der()).map_err(|e| {
            Error::Transport {
                message: format!("invalid generated key: {e}"),
            }
        })?;

        Ok(Self {
            certs: vec![cert_der],
            key: key_der,
        })
    }
}

/// One explicit provider for every TLS config, so the choice never
/// depends on which provider features end up compiled in.
fn tls_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build the proxy-side server endpoint.
pub fn server_endpoint(bind: SocketAddr, identity: TlsIdentity) -> Result<Endpoint> {
    let mut crypto = rustls::ServerConfig::builder_with_provider(tls_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::Transport {
            message: format!("failed to select TLS versions: {e}"),
        })?
        .with_no_client_auth()
        .with_single_cert(identity.certs, identity.key)
        .map_err(|e| Error::Transport {
            message: format!("failed to create server TLS config: {e}"),
        })?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        QuicServerConfig::try_from(crypto).map_err(|e| Error::Transport {
            message: format!("failed to create QUIC config: {e}"),
        })?,
    ));
    server_config.transport_config(Arc::new(transport_config(false)?));

    Endpoint::server(server_config, bind).map_err(|e| Error::Transport {
        message: format!("failed to bind {bind}: {e}"),
    })
}

/// Build the agent-side client endpoint.
///
/// With `ignore_cert` the server certificate is accepted unseen; otherwise
/// it must chain to a public web root.
pub fn client_endpoint(ignore_cert: bool) -> Result<Endpoint> {
    let builder = rustls::ClientConfig::builder_with_provider(tls_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::Transport {
            message: format!("failed to select TLS versions: {e}"),
        })?;

    let mut crypto = if ignore_cert {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = quinn::ClientConfig::new(Arc::new(
        QuicClientConfig::try_from(crypto).map_err(|e| Error::Transport {
            message: format!("failed to create QUIC config: {e}"),
        })?,
    ));
    client_config.transport_config(Arc::new(transport_config(true)?));

    let mut endpoint = Endpoint::client("0.0.0.0:0".parse().unwrap()).map_err(|e| {
        Error::Transport {
            message: format!("failed to create QUIC endpoint: {e}"),
        }
    })?;
    endpoint.set_default_client_config(client_config);

    Ok(endpoint)
}

/// Map a connection-level failure to the all-sessions-dead error.
pub fn transport_lost(e: impl std::fmt::Display) -> Error {
    Error::TransportLost {
        message: e.to_string(),
    }
}

fn transport_config(keep_alive: bool) -> Result<TransportConfig> {
    let mut config = TransportConfig::default();
    config.max_idle_timeout(Some(IdleTimeout::try_from(IDLE_TIMEOUT).map_err(|e| {
        Error::Transport {
            message: format!("invalid idle timeout: {e}"),
        }
    })?));
    if keep_alive {
        config.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    }
    Ok(config)
}

/// Certificate verifier that accepts anything. Only reachable behind the
/// agent's --ignore-cert flag.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_identity_generates() {
        let identity = TlsIdentity::self_signed().unwrap();
        assert_eq!(identity.certs.len(), 1);
        assert!(!identity.certs[0].as_ref().is_empty());
    }

    #[tokio::test]
    async fn server_endpoint_binds_ephemeral() {
        let identity = TlsIdentity::self_signed().unwrap();
        let endpoint = server_endpoint("127.0.0.1:0".parse().unwrap(), identity).unwrap();
        assert_ne!(endpoint.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn client_endpoint_builds_both_modes() {
        client_endpoint(true).unwrap();
        client_endpoint(false).unwrap();
    }
}

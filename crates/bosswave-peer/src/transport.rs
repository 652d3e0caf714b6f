//! Transport seam under the peer link.
//!
//! The production transport is TLS with certificate verification
//! disabled: the peer's identity is established by the Ed25519 handshake
//! proof over the certificate's signature bytes, not by the web PKI.
//! Tests drive the link over in-memory duplex pipes instead.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::client::danger::ServerCertVerified;
use rustls::client::danger::ServerCertVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::ServerName;
use rustls::pki_types::UnixTime;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use x509_parser::prelude::FromDer;
use x509_parser::prelude::X509Certificate;

use crate::error::PeerError;
use crate::error::Result;

/// Reading half of a peer connection.
pub type ConnReader = Box<dyn AsyncRead + Send + Unpin>;
/// Writing half of a peer connection.
pub type ConnWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An established (but not yet proven) connection to a peer.
pub struct PeerConnection {
    pub reader: ConnReader,
    pub writer: ConnWriter,
    /// The bytes of the presented certificate that the handshake proof
    /// must sign.
    pub cert_signature: Vec<u8>,
}

/// Dials the remote router. Each call yields a fresh connection; the
/// link calls it again after every transport failure.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn connect(&self) -> Result<PeerConnection>;
}

/// Accept-anything certificate verifier: trust comes from the handshake
/// proof, not the certificate chain.
#[derive(Debug)]
struct ProofOnlyVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for ProofOnlyVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// TLS transport to a `host:port` target.
pub struct TlsTransport {
    target: String,
    config: Arc<rustls::ClientConfig>,
}

impl TlsTransport {
    pub fn new(target: impl Into<String>) -> TlsTransport {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .expect("ring provider supports default protocol versions")
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(ProofOnlyVerification(provider)))
            .with_no_client_auth();
        TlsTransport {
            target: target.into(),
            config: Arc::new(config),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait]
impl PeerTransport for TlsTransport {
    async fn connect(&self) -> Result<PeerConnection> {
        let tcp = TcpStream::connect(&self.target).await?;
        let connector = TlsConnector::from(self.config.clone());
        // The name is irrelevant: the proof, not the certificate,
        // carries identity.
        let server_name = ServerName::try_from("router.peer").expect("static server name");
        let tls = connector.connect(server_name, tcp).await?;

        let cert_signature = {
            let (_, session) = tls.get_ref();
            let certs = session.peer_certificates().ok_or_else(|| PeerError::BadProof {
                reason: "peer presented no certificate".to_string(),
            })?;
            if certs.len() != 1 {
                return Err(PeerError::BadProof {
                    reason: format!("peer presented {} certificates", certs.len()),
                });
            }
            let (_, cert) = X509Certificate::from_der(certs[0].as_ref()).map_err(|e| PeerError::BadProof {
                reason: format!("unparseable peer certificate: {e}"),
            })?;
            cert.signature_value.data.to_vec()
        };

        let (reader, writer) = tokio::io::split(tls);
        Ok(PeerConnection {
            reader: Box::new(reader),
            writer: Box::new(writer),
            cert_signature,
        })
    }
}

/// The server half of one in-memory connection, handed to the test.
pub struct MemoryServerEnd {
    pub reader: ConnReader,
    pub writer: ConnWriter,
    /// What the client will treat as the certificate signature bytes.
    pub cert_signature: Vec<u8>,
}

/// In-memory transport: every `connect` call opens a fresh duplex pipe
/// and hands the server end to the test harness.
pub struct MemoryTransport {
    cert_signature: Vec<u8>,
    accept_tx: mpsc::UnboundedSender<MemoryServerEnd>,
}

impl MemoryTransport {
    /// Returns the transport and the stream of accepted server ends.
    pub fn new(cert_signature: Vec<u8>) -> (MemoryTransport, mpsc::UnboundedReceiver<MemoryServerEnd>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport {
                cert_signature,
                accept_tx,
            },
            accept_rx,
        )
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn connect(&self) -> Result<PeerConnection> {
        let (client_side, server_side) = tokio::io::duplex(1024 * 1024);
        let (cr, cw) = tokio::io::split(client_side);
        let (sr, sw) = tokio::io::split(server_side);
        self.accept_tx
            .send(MemoryServerEnd {
                reader: Box::new(sr),
                writer: Box::new(sw),
                cert_signature: self.cert_signature.clone(),
            })
            .map_err(|_| PeerError::Disconnected)?;
        Ok(PeerConnection {
            reader: Box::new(cr),
            writer: Box::new(cw),
            cert_signature: self.cert_signature.clone(),
        })
    }
}

//! TLS setup for both ends of the admin/agent link.
//!
//! The client posture in this deployment model skips certificate
//! verification by default: agents reach administrators across
//! networks the operator does not always control the PKI for.
//! Operators that want a hardened posture should pin a CA or
//! fingerprint at the configuration layer rather than relying on
//! this crate's defaults.

use std::io;
use std::sync::Arc;

use log::{debug, warn};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector, client::TlsStream as ClientTlsStream, server::TlsStream as ServerTlsStream};

use crate::Error;

/// Loads a certificate/key pair from disk, or mints a self-signed one
/// in memory when both paths are empty.
pub fn load_or_self_signed(cert_path: &str, key_path: &str) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Error> {
    if cert_path.is_empty() && key_path.is_empty() {
        return self_signed();
    }

    let cert_pem = std::fs::read(cert_path).map_err(Error::Io)?;
    let key_pem = std::fs::read(key_path).map_err(Error::Io)?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| Error::InvalidCertificate)?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|_| Error::InvalidCertificate)?
        .ok_or(Error::InvalidCertificate)?;

    Ok((certs, key))
}

fn self_signed() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Error> {
    let generated = rcgen::generate_simple_self_signed(vec!["bproxy".to_string()])
        .map_err(|_| Error::InvalidCertificate)?;
    let key = PrivateKeyDer::Pkcs8(generated.key_pair.serialize_der().into());
    Ok((vec![generated.cert.der().clone()], key))
}

pub fn server_acceptor(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<TlsAcceptor, Error> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|_| Error::InvalidCertificate)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// A client configuration that accepts any server certificate,
/// matching the threat model documented above.
pub fn insecure_client_connector() -> TlsConnector {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

pub async fn accept(acceptor: &TlsAcceptor, stream: TcpStream) -> Result<ServerTlsStream<TcpStream>, Error> {
    let peer = stream.peer_addr().ok();
    match acceptor.accept(stream).await {
        Ok(tls_stream) => {
            debug!("transport: TLS handshake accepted from {peer:?}");
            Ok(tls_stream)
        }
        Err(err) => {
            warn!("transport: TLS handshake from {peer:?} failed: {err}");
            Err(Error::Io(err))
        }
    }
}

pub async fn connect(connector: &TlsConnector, addr: &str, stream: TcpStream) -> Result<ClientTlsStream<TcpStream>, Error> {
    let host = addr.split(':').next().unwrap_or(addr).to_string();
    let server_name = ServerName::try_from(host).map_err(|_| Error::InvalidCertificate)?;
    match connector.connect(server_name, stream).await {
        Ok(tls_stream) => {
            debug!("transport: TLS handshake to {addr} succeeded");
            Ok(tls_stream)
        }
        Err(err) => {
            warn!("transport: TLS handshake to {addr} failed: {err}");
            Err(Error::Io(err))
        }
    }
}

#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
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
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
        ]
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(value)
    }
}

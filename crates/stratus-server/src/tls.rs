//! TLS for the "dot" listeners.
//!
//! Client certificates are optional and are not validated against any CA:
//! authentication is by public key. After the handshake the SPKI SHA-256
//! of the presented certificate is matched against stored tlspubkey
//! credentials; authorization per zone happens later, like for TSIG.

use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use sha2::{Digest, Sha256};
use tracing::info;
use x509_cert::der::{Decode, Encode};

use stratus_common::types::Credential;
use stratus_common::{Error, Result};

use crate::store::StoreError;
use crate::App;

/// Accepts any client certificate; possession of the private key is
/// proven by the handshake, identity is checked against the credential
/// store afterwards.
#[derive(Debug)]
struct AcceptAnyClientCert;

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider()
                .signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider()
                .signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// The raw-url-base64 SHA-256 of a certificate's SubjectPublicKeyInfo.
pub fn spki_hash(cert_der: &[u8]) -> Result<String> {
    let cert = x509_cert::Certificate::from_der(cert_der)
        .map_err(|e| Error::user(format!("parsing certificate: {e}")))?;
    let spki = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| Error::user(format!("encoding spki: {e}")))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(Sha256::digest(&spki)))
}

/// Server TLS material: loaded from PEM files when given, otherwise an
/// ephemeral ed25519 key with a minimal self-signed certificate.
pub struct ServerTls {
    pub config: Arc<rustls::ServerConfig>,
    /// SPKI hash of our own certificate, logged at startup so operators
    /// can pin it.
    pub spki_hash: String,
}

pub fn server_tls(
    key_pem: Option<&Path>,
    cert_pem: Option<&Path>,
) -> Result<ServerTls> {
    let (certs, key) = match (key_pem, cert_pem) {
        (Some(key_path), Some(cert_path)) => {
            (load_certs(cert_path)?, load_key(key_path)?)
        }
        (Some(key_path), None) => {
            // Self-sign for the provided key.
            let pem = std::fs::read_to_string(key_path)
                .map_err(|e| Error::user(format!("reading tls key: {e}")))?;
            let key_pair = rcgen::KeyPair::from_pem(&pem)
                .map_err(|e| Error::user(format!("parsing tls key: {e}")))?;
            let cert = self_signed(&key_pair)?;
            (vec![cert], load_key(key_path)?)
        }
        _ => {
            // Ephemeral key and certificate.
            let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519)
                .map_err(|e| Error::invariant(format!("generating tls key: {e}")))?;
            let cert = self_signed(&key_pair)?;
            let key = PrivateKeyDer::try_from(key_pair.serialize_der())
                .map_err(|e| Error::invariant(format!("encoding tls key: {e}")))?;
            info!("generated ephemeral tls key");
            (vec![cert], key)
        }
    };

    let hash = spki_hash(certs[0].as_ref())?;

    let mut config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(AcceptAnyClientCert))
        .with_single_cert(certs, key)
        .map_err(|e| Error::user(format!("building tls config: {e}")))?;
    config.alpn_protocols = vec![b"dot".to_vec()];

    Ok(ServerTls {
        config: Arc::new(config),
        spki_hash: hash,
    })
}

fn self_signed(key_pair: &rcgen::KeyPair) -> Result<CertificateDer<'static>> {
    let params = rcgen::CertificateParams::default();
    let cert = params
        .self_signed(key_pair)
        .map_err(|e| Error::invariant(format!("self-signing certificate: {e}")))?;
    Ok(cert.der().clone())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|e| Error::user(format!("reading tls certs: {e}")))?;
    let mut reader = std::io::BufReader::new(pem.as_slice());
    let certs: std::result::Result<Vec<_>, _> =
        rustls_pemfile::certs(&mut reader).collect();
    let certs = certs.map_err(|e| Error::user(format!("parsing tls certs: {e}")))?;
    if certs.is_empty() {
        return Err(Error::user(format!("no certificates in {path:?}")));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .map_err(|e| Error::user(format!("reading tls key: {e}")))?;
    let mut reader = std::io::BufReader::new(pem.as_slice());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::user(format!("parsing tls key: {e}")))?
        .ok_or_else(|| Error::user(format!("no private key in {path:?}")))
}

/// Looks up the tlspubkey credential for the connection's client
/// certificate, when one was presented. Unknown keys are an error; the
/// caller drops the connection.
pub async fn client_credential(
    app: &Arc<App>,
    conn: &rustls::ServerConnection,
) -> Result<Option<Credential>> {
    let Some(certs) = conn.peer_certificates() else {
        return Ok(None);
    };
    let Some(leaf) = certs.first() else {
        return Ok(None);
    };
    let hash = spki_hash(leaf.as_ref())?;
    match app
        .store
        .read_async(move |tx| tx.credential_by_tls_key(&hash))
        .await
    {
        Ok(cred) => Ok(Some(cred)),
        Err(StoreError::NotFound(m)) => {
            Err(Error::permission(format!("unknown tls public key: {m}")))
        }
        Err(e) => Err(e.into()),
    }
}

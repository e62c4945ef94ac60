//! TLS configuration and server trust evaluation.
//!
//! [`TlsConfig`] controls how the reqwest transport sets up connections:
//! extra root certificates, client identity, and minimum protocol version.
//! [`ServerTrustPolicy`] decides, per host, whether the certificate a
//! server presented is accepted once the connection is up.
//!
//! ```ignore
//! use courier::tls::{Certificate, ServerTrustPolicy, TlsConfig, TrustMode};
//!
//! let ca = Certificate::from_pem_file("/etc/courier/ca.crt")?;
//! let tls = TlsConfig::new().add_root_certificate(ca);
//!
//! let pins = ServerTrustPolicy::new(TrustMode::Default)
//!     .host_override("api.example.com", TrustMode::pinned(["q1w2...="]));
//! ```

use std::collections::{HashMap, HashSet};
use std::io::{BufReader, Cursor};
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};

use crate::error::{HttpError, Result, TlsChallengeError};

fn tls_error(message: impl Into<String>) -> HttpError {
    TlsChallengeError::InvalidConfiguration(message.into()).into()
}

fn read_file(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| tls_error(format!("Failed to read {what} '{}': {e}", path.display())))
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(Cursor::new(pem));
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("Failed to parse PEM certificate: {e}")))?;
    if certs.is_empty() {
        return Err(tls_error("No certificates found in PEM data"));
    }
    Ok(certs)
}

/// Base64 SHA-256 digest of a DER certificate, the form used for pins.
pub fn fingerprint(der: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(der))
}

/// Minimum TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// TLS 1.2 (default minimum).
    #[default]
    Tls1_2,
    /// TLS 1.3.
    Tls1_3,
}

impl TlsVersion {
    pub(crate) fn to_reqwest_version(self) -> reqwest::tls::Version {
        match self {
            TlsVersion::Tls1_2 => reqwest::tls::Version::TLS_1_2,
            TlsVersion::Tls1_3 => reqwest::tls::Version::TLS_1_3,
        }
    }
}

/// One or more certificates to add to the trust store.
#[derive(Clone)]
pub struct Certificate {
    der_certs: Vec<CertificateDer<'static>>,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("cert_count", &self.der_certs.len())
            .finish()
    }
}

impl Certificate {
    /// Load certificates from PEM-encoded bytes. A chain is allowed.
    pub fn from_pem(pem_data: impl AsRef<[u8]>) -> Result<Self> {
        Ok(Self {
            der_certs: parse_certs(pem_data.as_ref())?,
        })
    }

    /// Load certificates from a PEM-encoded file.
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_pem(read_file(path.as_ref(), "certificate file")?)
    }

    /// Wrap a DER-encoded certificate.
    pub fn from_der(der_data: impl Into<Vec<u8>>) -> Self {
        Self {
            der_certs: vec![CertificateDer::from(der_data.into())],
        }
    }

    /// Pin fingerprints of the contained certificates.
    pub fn fingerprints(&self) -> Vec<String> {
        self.der_certs
            .iter()
            .map(|cert| fingerprint(cert.as_ref()))
            .collect()
    }

    pub(crate) fn der_certs(&self) -> &[CertificateDer<'static>] {
        &self.der_certs
    }

    pub(crate) fn to_reqwest_certificates(&self) -> Vec<reqwest::Certificate> {
        self.der_certs
            .iter()
            .filter_map(|cert| reqwest::Certificate::from_der(cert.as_ref()).ok())
            .collect()
    }
}

/// Client certificate and key for mutual TLS.
pub struct Identity {
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.clone_key(),
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("cert_count", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Create an identity from PEM certificate and key bytes.
    ///
    /// The client certificate comes first in the chain, followed by any
    /// intermediates.
    pub fn from_pem(cert_pem: impl AsRef<[u8]>, key_pem: impl AsRef<[u8]>) -> Result<Self> {
        let cert_chain = parse_certs(cert_pem.as_ref())?;
        let mut key_reader = BufReader::new(Cursor::new(key_pem.as_ref()));
        let private_key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| tls_error(format!("Failed to parse private key PEM: {e}")))?
            .ok_or_else(|| tls_error("No private key found in PEM data"))?;

        Ok(Self {
            cert_chain,
            private_key,
        })
    }

    /// Create an identity from a PEM certificate file and a PEM key file.
    pub fn from_pem_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_pem = read_file(cert_path.as_ref(), "certificate file")?;
        let key_pem = read_file(key_path.as_ref(), "key file")?;
        Self::from_pem(cert_pem, key_pem)
    }

    /// Create an identity from one PEM holding both certificate and key.
    pub fn from_pem_combined(pem_data: impl AsRef<[u8]>) -> Result<Self> {
        Self::from_pem(pem_data.as_ref(), pem_data.as_ref())
    }

    /// Re-encode as the combined PEM reqwest expects.
    pub(crate) fn to_reqwest_identity(&self) -> Result<reqwest::Identity> {
        let mut pem = String::new();
        for cert in &self.cert_chain {
            push_pem_block(&mut pem, "CERTIFICATE", cert.as_ref());
        }

        let (label, key_bytes) = match &self.private_key {
            PrivateKeyDer::Pkcs1(key) => ("RSA PRIVATE KEY", key.secret_pkcs1_der()),
            PrivateKeyDer::Pkcs8(key) => ("PRIVATE KEY", key.secret_pkcs8_der()),
            PrivateKeyDer::Sec1(key) => ("EC PRIVATE KEY", key.secret_sec1_der()),
            _ => return Err(tls_error("Unknown private key format")),
        };
        push_pem_block(&mut pem, label, key_bytes);

        reqwest::Identity::from_pem(pem.as_bytes())
            .map_err(|e| tls_error(format!("Failed to create identity: {e}")))
    }
}

fn push_pem_block(out: &mut String, label: &str, der: &[u8]) {
    out.push_str(&format!("-----BEGIN {label}-----\n"));
    let mut encoded = STANDARD.encode(der);
    while !encoded.is_empty() {
        let rest = encoded.split_off(encoded.len().min(64));
        out.push_str(&encoded);
        out.push('\n');
        encoded = rest;
    }
    out.push_str(&format!("-----END {label}-----\n"));
}

/// TLS settings applied when the transport builds its client.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Additional root certificates to trust.
    pub root_certificates: Vec<Certificate>,
    /// Whether to use only the provided root certificates.
    pub use_only_custom_roots: bool,
    /// Client identity for mutual TLS.
    pub identity: Option<Identity>,
    /// Minimum TLS version.
    pub min_version: TlsVersion,
    /// Accept invalid or self-signed certificates (testing only).
    pub danger_accept_invalid_certs: bool,
}

impl TlsConfig {
    /// Create a configuration with platform defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a root certificate to trust.
    pub fn add_root_certificate(mut self, cert: Certificate) -> Self {
        self.root_certificates.push(cert);
        self
    }

    /// Use only custom root certificates.
    pub fn use_only_custom_roots(mut self) -> Self {
        self.use_only_custom_roots = true;
        self
    }

    /// Set the client identity for mutual TLS.
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Set the minimum TLS version.
    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = version;
        self
    }

    /// Accept invalid certificates.
    ///
    /// # Warning
    ///
    /// This disables certificate verification in the connection layer. Pair
    /// it with a pinning [`ServerTrustPolicy`] or use it in tests only.
    pub fn danger_accept_invalid_certs(mut self) -> Self {
        self.danger_accept_invalid_certs = true;
        self
    }

    /// Check if this configuration has any custom settings.
    pub fn is_default(&self) -> bool {
        self.root_certificates.is_empty()
            && !self.use_only_custom_roots
            && self.identity.is_none()
            && self.min_version == TlsVersion::Tls1_2
            && !self.danger_accept_invalid_certs
    }

    /// Apply these settings to a reqwest client builder.
    pub(crate) fn apply(&self, mut builder: reqwest::ClientBuilder) -> Result<reqwest::ClientBuilder> {
        if self.use_only_custom_roots && self.root_certificates.is_empty() {
            return Err(tls_error(
                "No root certificates available; add one or drop use_only_custom_roots",
            ));
        }
        for cert in &self.root_certificates {
            for reqwest_cert in cert.to_reqwest_certificates() {
                builder = builder.add_root_certificate(reqwest_cert);
            }
        }
        if self.use_only_custom_roots {
            builder = builder.tls_built_in_root_certs(false);
        }
        if let Some(identity) = &self.identity {
            builder = builder.identity(identity.to_reqwest_identity()?);
        }
        builder = builder.min_tls_version(self.min_version.to_reqwest_version());
        if self.danger_accept_invalid_certs {
            tracing::warn!(target: "courier::tls", "Certificate verification disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(builder)
    }
}

/// How a presented certificate chain is judged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TrustMode {
    /// Accept what the connection layer already verified.
    #[default]
    Default,
    /// Accept only chains containing a certificate with one of these
    /// base64 SHA-256 fingerprints.
    PinnedCertificates(HashSet<String>),
    /// Accept any chain.
    AllowAll,
}

impl TrustMode {
    /// Pin the given fingerprints.
    pub fn pinned<S: Into<String>>(fingerprints: impl IntoIterator<Item = S>) -> Self {
        Self::PinnedCertificates(fingerprints.into_iter().map(Into::into).collect())
    }
}

/// Outcome of evaluating a server trust challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustEvaluation {
    /// The chain is trusted; answer the challenge with a credential.
    Trusted,
    /// The chain is rejected for the given reason.
    Rejected(String),
}

impl TrustEvaluation {
    /// Check whether the chain was trusted.
    pub fn is_trusted(&self) -> bool {
        matches!(self, Self::Trusted)
    }
}

/// Per-host server trust rules.
#[derive(Debug, Clone, Default)]
pub struct ServerTrustPolicy {
    mode: TrustMode,
    host_overrides: HashMap<String, TrustMode>,
}

impl ServerTrustPolicy {
    /// Create a policy applying `mode` to every host.
    pub fn new(mode: TrustMode) -> Self {
        Self {
            mode,
            host_overrides: HashMap::new(),
        }
    }

    /// Use a different mode for one host.
    pub fn host_override(mut self, host: impl Into<String>, mode: TrustMode) -> Self {
        self.host_overrides
            .insert(host.into().to_ascii_lowercase(), mode);
        self
    }

    /// The mode that applies to `host`.
    pub fn mode_for(&self, host: &str) -> &TrustMode {
        self.host_overrides
            .get(&host.to_ascii_lowercase())
            .unwrap_or(&self.mode)
    }

    /// Evaluate the DER certificates a server presented.
    pub fn evaluate(&self, host: &str, chain: &[Bytes]) -> TrustEvaluation {
        let evaluation = match self.mode_for(host) {
            TrustMode::AllowAll => TrustEvaluation::Trusted,
            TrustMode::Default if chain.is_empty() => {
                TrustEvaluation::Rejected("server presented no certificate".to_string())
            }
            TrustMode::Default => TrustEvaluation::Trusted,
            TrustMode::PinnedCertificates(pins) => {
                if chain.iter().any(|cert| pins.contains(&fingerprint(cert))) {
                    TrustEvaluation::Trusted
                } else {
                    TrustEvaluation::Rejected("no certificate matches a pinned fingerprint".to_string())
                }
            }
        };
        tracing::debug!(
            target: "courier::tls",
            host,
            certificates = chain.len(),
            trusted = evaluation.is_trusted(),
            "Evaluated server trust"
        );
        evaluation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CERT_PEM: &str = r#"-----BEGIN CERTIFICATE-----
MIIBkTCB+wIJAKHBfpegE3jEMA0GCSqGSIb3DQEBCwUAMBExDzANBgNVBAMMBnRl
c3RjYTAeFw0yMzAxMDEwMDAwMDBaFw0yNDAxMDEwMDAwMDBaMBExDzANBgNVBAMM
BnRlc3RjYTBcMA0GCSqGSIb3DQEBAQUAA0sAMEgCQQC7o96HtiK7onnPevKSE2LL
oSXwnmfYwZPV2bvfGS18lK8F+DL+42IjT3ucMXnLBhzNCLNKE8yCVK6LPlsvpNlX
AgMBAAGjUzBRMB0GA1UdDgQWBBQgHGHqPcVi1N4CG7IxDJaFMvP6XTAfBgNVHSME
GDAWgBQgHGHqPcVi1N4CG7IxDJaFMvP6XTAPBgNVHRMBAf8EBTADAQH/MA0GCSqG
SIb3DQEBCwUAA0EAGLJHfg9dS/T39L6VQLJeZcpH7mY8vKaM9dM/Zn3HMhfc0Yjv
3hxMPmPGjjpQ9JKaLI0Rq7n5oEUP+xluoAAfrQ==
-----END CERTIFICATE-----"#;

    #[test]
    fn test_tls_config_is_default() {
        assert!(TlsConfig::new().is_default());
        assert!(!TlsConfig::new().min_version(TlsVersion::Tls1_3).is_default());
    }

    #[test]
    fn test_certificate_from_pem() {
        let cert = Certificate::from_pem(TEST_CERT_PEM).unwrap();
        assert_eq!(cert.der_certs().len(), 1);
        assert_eq!(cert.fingerprints().len(), 1);

        let config = TlsConfig::new().add_root_certificate(cert);
        assert!(!config.is_default());
    }

    #[test]
    fn test_certificate_from_empty_pem() {
        let err = Certificate::from_pem("not a certificate").unwrap_err();
        assert_eq!(err.code(), 6002);
    }

    #[test]
    fn test_custom_roots_without_certs_fails() {
        let config = TlsConfig::new().use_only_custom_roots();
        assert!(config.apply(reqwest::Client::builder()).is_err());
    }

    #[test]
    fn test_pem_blocks_wrap_at_64_columns() {
        let mut pem = String::new();
        push_pem_block(&mut pem, "CERTIFICATE", &[7u8; 100]);
        let lines: Vec<&str> = pem.lines().collect();
        assert_eq!(lines.first(), Some(&"-----BEGIN CERTIFICATE-----"));
        assert_eq!(lines.last(), Some(&"-----END CERTIFICATE-----"));
        assert!(lines[1..lines.len() - 1].iter().all(|line| line.len() <= 64));
        assert_eq!(lines[1..lines.len() - 1].concat(), STANDARD.encode([7u8; 100]));
    }

    #[test]
    fn test_fingerprint_is_base64_sha256() {
        let print = fingerprint(b"leaf");
        assert_eq!(STANDARD.decode(&print).unwrap().len(), 32);
        assert_eq!(print, fingerprint(b"leaf"));
        assert_ne!(print, fingerprint(b"other"));
    }

    #[test]
    fn test_default_mode_requires_a_certificate() {
        let policy = ServerTrustPolicy::default();
        assert!(policy.evaluate("api.test", &[Bytes::from_static(b"leaf")]).is_trusted());
        assert!(!policy.evaluate("api.test", &[]).is_trusted());
    }

    #[test]
    fn test_pinning_with_host_override() {
        let leaf = Bytes::from_static(b"leaf");
        let policy = ServerTrustPolicy::new(TrustMode::Default)
            .host_override("Pinned.Test", TrustMode::pinned([fingerprint(b"other")]));

        assert!(policy.evaluate("api.test", &[leaf.clone()]).is_trusted());
        assert!(matches!(
            policy.evaluate("pinned.test", &[leaf.clone()]),
            TrustEvaluation::Rejected(_)
        ));

        let policy = policy.host_override("pinned.test", TrustMode::pinned([fingerprint(&leaf)]));
        assert!(policy.evaluate("pinned.test", &[leaf]).is_trusted());
    }

    #[test]
    fn test_allow_all() {
        let policy = ServerTrustPolicy::new(TrustMode::AllowAll);
        assert!(policy.evaluate("any.test", &[]).is_trusted());
    }
}

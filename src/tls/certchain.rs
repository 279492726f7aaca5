//! Peer certificate chains and their validation.
//!
//! # Responsibilities
//! - Parse the DER chain received in a Certificate message
//! - Extract the leaf public key at receipt time ([`PeerKey`])
//! - Validate the chain against a [`TrustStore`] for a given domain
//!
//! Validation is CPU-heavy and runs off the scheduler thread; everything
//! here is `Send + Sync` so a chain can be moved into that job.

use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;

use p256::ecdsa::signature::hazmat::PrehashVerifier;
use rand::rngs::OsRng;
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{parse_x509_certificate, X509Certificate};

use crate::error::CertError;
use crate::tls::wire::signature_scheme;

/// Leaf public key, in the forms the handshake can use.
#[derive(Debug, Clone)]
pub enum PeerKey {
    Rsa(RsaPublicKey),
    P256(p256::PublicKey),
    P384(p384::PublicKey),
}

impl PeerKey {
    /// Parse a DER `SubjectPublicKeyInfo`.
    pub fn from_spki_der(spki: &[u8]) -> Result<Self, CertError> {
        if let Ok(key) = RsaPublicKey::from_public_key_der(spki) {
            return Ok(Self::Rsa(key));
        }
        if let Ok(key) = p256::PublicKey::from_public_key_der(spki) {
            return Ok(Self::P256(key));
        }
        if let Ok(key) = p384::PublicKey::from_public_key_der(spki) {
            return Ok(Self::P384(key));
        }
        Err(CertError::UnsupportedKey)
    }

    pub fn is_rsa(&self) -> bool {
        matches!(self, Self::Rsa(_))
    }

    pub fn is_ec(&self) -> bool {
        !self.is_rsa()
    }

    /// Whether a ServerKeyExchange signed with `scheme` fits this key.
    pub fn accepts_scheme(&self, scheme: u16) -> bool {
        use signature_scheme::*;
        match scheme {
            RSA_PKCS1_SHA1 | RSA_PKCS1_SHA256 | RSA_PKCS1_SHA384 => self.is_rsa(),
            ECDSA_SHA1 => self.is_ec(),
            ECDSA_SECP256R1_SHA256 => matches!(self, Self::P256(_)),
            ECDSA_SECP384R1_SHA384 => matches!(self, Self::P384(_)),
            _ => false,
        }
    }

    /// Verify `signature` over `message` under `scheme`.
    pub fn verify(&self, scheme: u16, message: &[u8], signature: &[u8]) -> bool {
        use signature_scheme::*;
        match (self, scheme) {
            (Self::Rsa(key), RSA_PKCS1_SHA1) => verify_rsa::<Sha1>(key, message, signature),
            (Self::Rsa(key), RSA_PKCS1_SHA256) => verify_rsa::<Sha256>(key, message, signature),
            (Self::Rsa(key), RSA_PKCS1_SHA384) => verify_rsa::<Sha384>(key, message, signature),
            (Self::P256(key), ECDSA_SHA1 | ECDSA_SECP256R1_SHA256) => {
                let Ok(sig) = p256::ecdsa::Signature::from_der(signature) else {
                    return false;
                };
                p256::ecdsa::VerifyingKey::from(key)
                    .verify_prehash(&prehash(scheme, message), &sig)
                    .is_ok()
            }
            (Self::P384(key), ECDSA_SHA1 | ECDSA_SECP384R1_SHA384) => {
                let Ok(sig) = p384::ecdsa::Signature::from_der(signature) else {
                    return false;
                };
                p384::ecdsa::VerifyingKey::from(key)
                    .verify_prehash(&prehash(scheme, message), &sig)
                    .is_ok()
            }
            _ => false,
        }
    }

    /// RSAES-PKCS1-v1_5 encryption, used for the RSA pre-master secret.
    pub fn encrypt_pkcs1(&self, data: &[u8]) -> Result<Vec<u8>, CertError> {
        match self {
            Self::Rsa(key) => key
                .encrypt(&mut OsRng, Pkcs1v15Encrypt, data)
                .map_err(|e| CertError::Parse(e.to_string())),
            _ => Err(CertError::UnsupportedKey),
        }
    }
}

fn verify_rsa<D>(key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool
where
    D: Digest + rsa::pkcs8::AssociatedOid,
{
    let Ok(sig) = rsa::pkcs1v15::Signature::try_from(signature) else {
        return false;
    };
    rsa::pkcs1v15::VerifyingKey::<D>::new(key.clone())
        .verify(message, &sig)
        .is_ok()
}

fn prehash(scheme: u16, message: &[u8]) -> Vec<u8> {
    match scheme {
        signature_scheme::ECDSA_SHA1 => Sha1::digest(message).to_vec(),
        signature_scheme::ECDSA_SECP384R1_SHA384 => Sha384::digest(message).to_vec(),
        _ => Sha256::digest(message).to_vec(),
    }
}

/// A parsed peer chain: raw DER certificates (leaf first) and the leaf key.
#[derive(Debug, Clone)]
pub struct PeerChain {
    pub certs: Vec<Vec<u8>>,
    pub leaf_key: PeerKey,
}

impl PeerChain {
    pub fn from_der(certs: Vec<Vec<u8>>) -> Result<Self, CertError> {
        let leaf = certs.first().ok_or(CertError::EmptyChain)?;
        for der in &certs {
            parse(der)?;
        }
        let (_, cert) = parse(leaf)?;
        let leaf_key = PeerKey::from_spki_der(cert.public_key().raw)?;
        Ok(Self { certs, leaf_key })
    }

    pub fn leaf(&self) -> &[u8] {
        &self.certs[0]
    }
}

fn parse(der: &[u8]) -> Result<(&[u8], X509Certificate<'_>), CertError> {
    parse_x509_certificate(der).map_err(|e| CertError::Parse(e.to_string()))
}

/// Whether a certificate names `domain`, via SAN entries (with `*.`
/// wildcards) or, when there is no SAN extension, its common name.
pub fn is_valid_for_domain(cert_der: &[u8], domain: &str) -> bool {
    let Ok((_, cert)) = parse(cert_der) else {
        return false;
    };
    let ip = domain.parse::<IpAddr>().ok();

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        return san.value.general_names.iter().any(|name| match name {
            GeneralName::DNSName(pattern) => ip.is_none() && domain_matches(pattern, domain),
            GeneralName::IPAddress(bytes) => ip.is_some_and(|ip| ip_matches(bytes, ip)),
            _ => false,
        });
    }

    let matched = cert
        .subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .any(|cn| domain_matches(cn, domain));
    matched
}

fn domain_matches(pattern: &str, domain: &str) -> bool {
    let pattern = pattern.trim_end_matches('.');
    let domain = domain.trim_end_matches('.');
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return match domain.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
            None => false,
        };
    }
    pattern.eq_ignore_ascii_case(domain)
}

fn ip_matches(bytes: &[u8], ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => bytes == v4.octets(),
        IpAddr::V6(v6) => bytes == v6.octets(),
    }
}

/// Decides whether a peer chain is acceptable for a domain.
pub trait CertchainVerifier: Send + Sync {
    fn verify(&self, chain: &PeerChain, domain: &str) -> Result<(), CertError>;
}

/// Accepts every chain. For testing against self-signed peers only.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAnyCertchain;

impl CertchainVerifier for AcceptAnyCertchain {
    fn verify(&self, _chain: &PeerChain, _domain: &str) -> Result<(), CertError> {
        Ok(())
    }
}

/// Set of trusted root certificates (DER).
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    roots: Vec<Vec<u8>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn add_der(&mut self, der: Vec<u8>) -> Result<(), CertError> {
        parse(&der)?;
        self.roots.push(der);
        Ok(())
    }

    /// Add every certificate found in a PEM bundle. Returns how many were
    /// added.
    pub fn add_pem(&mut self, pem: &[u8]) -> Result<usize, CertError> {
        let mut reader = BufReader::new(pem);
        let mut added = 0;
        for cert in rustls_pemfile::certs(&mut reader) {
            self.add_der(cert?.to_vec())?;
            added += 1;
        }
        Ok(added)
    }

    pub fn load_pem_file(&mut self, path: &Path) -> Result<usize, CertError> {
        let pem = fs::read(path)?;
        let added = self.add_pem(&pem)?;
        tracing::debug!(path = %path.display(), roots = added, "Loaded trust roots");
        Ok(added)
    }
}

impl CertchainVerifier for TrustStore {
    fn verify(&self, chain: &PeerChain, domain: &str) -> Result<(), CertError> {
        if !is_valid_for_domain(chain.leaf(), domain) {
            return Err(CertError::DomainMismatch(domain.to_string()));
        }

        // Certificate `i` has `i + 1` certificates below its issuer,
        // counting the leaf.
        for (i, der) in chain.certs.iter().enumerate() {
            let (_, cert) = parse(der)?;
            if !cert.validity().is_valid() {
                return Err(CertError::Expired);
            }
            if self.roots.iter().any(|root| root == der) {
                return Ok(());
            }
            let anchor = self.roots.iter().find_map(|root_der| {
                let (_, root) = parse(root_der).ok()?;
                let signed = root.subject().as_raw() == cert.issuer().as_raw()
                    && cert.verify_signature(Some(root.public_key())).is_ok();
                signed.then(|| check_issuer(&root, i + 1))
            });
            if let Some(allowed) = anchor {
                return allowed;
            }
            let Some(next) = chain.certs.get(i + 1) else {
                break;
            };
            let (_, issuer) = parse(next)?;
            if cert.issuer().as_raw() != issuer.subject().as_raw()
                || cert.verify_signature(Some(issuer.public_key())).is_err()
            {
                return Err(CertError::UntrustedRoot);
            }
            check_issuer(&issuer, i + 1)?;
        }
        Err(CertError::UntrustedRoot)
    }
}

/// An issuer must be a CA, and its path length constraint bounds the
/// intermediates below it (`below` counts the leaf too).
fn check_issuer(issuer: &X509Certificate<'_>, below: usize) -> Result<(), CertError> {
    let allowed = match issuer.basic_constraints() {
        Ok(Some(ext)) if ext.value.ca => ext
            .value
            .path_len_constraint
            .map_or(true, |len| below <= len as usize + 1),
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(CertError::InvalidIssuer(issuer.subject().to_string()))
    }
}

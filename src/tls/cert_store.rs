//! Server identities.
//!
//! A [`CertStore`] maps the SNI host name a client asks for to the
//! certificate chain and RSA private key the server presents.

use std::fs;
use std::io::{self, BufReader};
use std::path::Path;

use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use rustls_pemfile::Item;

use crate::config::schema::IdentityConfig;
use crate::error::CertError;
use crate::tls::certchain::is_valid_for_domain;

pub const PRE_MASTER_SECRET_LEN: usize = 48;

#[derive(Clone)]
pub struct CertStoreEntry {
    /// DER certificates, leaf first.
    pub chain: Vec<Vec<u8>>,
    pub private_key: RsaPrivateKey,
}

impl CertStoreEntry {
    /// Decrypt an RSA-encrypted pre-master secret.
    ///
    /// Never fails: a malformed ciphertext, or a secret not led by the
    /// version the client offered in its ClientHello, yields random bytes.
    /// The handshake then only breaks later, at Finished, and padding
    /// errors are not observable by the peer.
    pub fn decrypt_pre_master_secret(&self, ciphertext: &[u8], client_version: u16) -> Vec<u8> {
        match self.private_key.decrypt_blinded(&mut OsRng, Pkcs1v15Encrypt, ciphertext) {
            Ok(secret)
                if secret.len() == PRE_MASTER_SECRET_LEN && secret[..2] == client_version.to_be_bytes() =>
            {
                secret
            }
            _ => {
                let mut secret = vec![0u8; PRE_MASTER_SECRET_LEN];
                OsRng.fill_bytes(&mut secret);
                secret
            }
        }
    }
}

#[derive(Default)]
pub struct CertStore {
    entries: Vec<CertStoreEntry>,
}

impl CertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, chain: Vec<Vec<u8>>, private_key: RsaPrivateKey) -> Result<(), CertError> {
        if chain.is_empty() {
            return Err(CertError::EmptyChain);
        }
        self.entries.push(CertStoreEntry { chain, private_key });
        Ok(())
    }

    /// Add an identity from DER: one certificate and a PKCS#8 or PKCS#1 key.
    pub fn add_der(&mut self, cert: Vec<u8>, key: &[u8]) -> Result<(), CertError> {
        let private_key = RsaPrivateKey::from_pkcs8_der(key)
            .or_else(|_| RsaPrivateKey::from_pkcs1_der(key))
            .map_err(|e| CertError::PrivateKey(e.to_string()))?;
        self.add(vec![cert], private_key)
    }

    /// Add an identity from PEM: a certificate chain (leaf first) and a key.
    pub fn add_pem(&mut self, cert_pem: &[u8], key_pem: &[u8]) -> Result<(), CertError> {
        let mut chain = Vec::new();
        for cert in rustls_pemfile::certs(&mut BufReader::new(cert_pem)) {
            chain.push(cert?.to_vec());
        }
        let private_key = read_private_key(key_pem)?;
        self.add(chain, private_key)
    }

    pub fn load_pem_files(&mut self, cert_path: &Path, key_path: &Path) -> Result<(), CertError> {
        for path in [cert_path, key_path] {
            if !path.exists() {
                return Err(CertError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("file not found: {}", path.display()),
                )));
            }
        }
        let cert_pem = fs::read(cert_path)?;
        let key_pem = fs::read(key_path)?;
        self.add_pem(&cert_pem, &key_pem)?;
        tracing::info!(cert = %cert_path.display(), "Loaded server identity");
        Ok(())
    }

    pub fn from_identities(identities: &[IdentityConfig]) -> Result<Self, CertError> {
        let mut store = Self::new();
        for identity in identities {
            store.load_pem_files(Path::new(&identity.cert_path), Path::new(&identity.key_path))?;
        }
        Ok(store)
    }

    /// Entry whose leaf names `domain`. With a single identity configured,
    /// that identity is returned regardless of the name.
    pub fn find_entry_for_domain(&self, domain: &str) -> Option<&CertStoreEntry> {
        if let [only] = self.entries.as_slice() {
            return Some(only);
        }
        self.entries
            .iter()
            .find(|entry| is_valid_for_domain(&entry.chain[0], domain))
    }
}

fn read_private_key(pem: &[u8]) -> Result<RsaPrivateKey, CertError> {
    let mut reader = BufReader::new(pem);
    while let Some(item) = rustls_pemfile::read_one(&mut reader)? {
        let parsed = match item {
            Item::Pkcs1Key(key) => {
                RsaPrivateKey::from_pkcs1_der(key.secret_pkcs1_der()).map_err(|e| e.to_string())
            }
            Item::Pkcs8Key(key) => {
                RsaPrivateKey::from_pkcs8_der(key.secret_pkcs8_der()).map_err(|e| e.to_string())
            }
            _ => continue,
        };
        return parsed.map_err(CertError::PrivateKey);
    }
    Err(CertError::PrivateKey("no RSA private key found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_chain_is_rejected() {
        let key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let mut store = CertStore::new();
        assert!(matches!(store.add(Vec::new(), key), Err(CertError::EmptyChain)));
        assert!(store.find_entry_for_domain("example.com").is_none());
    }

    #[test]
    fn key_pem_without_key_is_an_error() {
        assert!(matches!(read_private_key(b""), Err(CertError::PrivateKey(_))));
    }

    #[test]
    fn bad_ciphertext_yields_random_secret() {
        let key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let entry = CertStoreEntry {
            chain: vec![vec![0x30]],
            private_key: key,
        };
        let a = entry.decrypt_pre_master_secret(&[1, 2, 3], 0x0303);
        let b = entry.decrypt_pre_master_secret(&[1, 2, 3], 0x0303);
        assert_eq!(a.len(), PRE_MASTER_SECRET_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn valid_ciphertext_round_trips() {
        let key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = rsa::RsaPublicKey::from(&key);
        let secret = [3u8; PRE_MASTER_SECRET_LEN];
        let ciphertext = public.encrypt(&mut OsRng, Pkcs1v15Encrypt, &secret).unwrap();
        let entry = CertStoreEntry {
            chain: vec![vec![0x30]],
            private_key: key,
        };
        assert_eq!(entry.decrypt_pre_master_secret(&ciphertext, 0x0303), secret.to_vec());
    }

    #[test]
    fn version_mismatch_yields_random_secret() {
        let key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = rsa::RsaPublicKey::from(&key);
        let mut secret = [7u8; PRE_MASTER_SECRET_LEN];
        secret[..2].copy_from_slice(&[3, 1]);
        let ciphertext = public.encrypt(&mut OsRng, Pkcs1v15Encrypt, &secret).unwrap();
        let entry = CertStoreEntry {
            chain: vec![vec![0x30]],
            private_key: key,
        };

        assert_eq!(entry.decrypt_pre_master_secret(&ciphertext, 0x0301), secret.to_vec());
        let substituted = entry.decrypt_pre_master_secret(&ciphertext, 0x0303);
        assert_eq!(substituted.len(), PRE_MASTER_SECRET_LEN);
        assert_ne!(substituted, secret.to_vec());
    }
}

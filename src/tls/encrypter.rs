//! Per-direction record protection.
//!
//! # Design Decisions
//! - The sequence number is an explicit counter, bumped once per record in
//!   either direction, never inferred from call order
//! - GCM uses the sequence number as its 8-byte explicit nonce
//! - Every decryption failure (alignment, padding, MAC, tag) collapses into
//!   `bad_record_mac`

use std::fmt;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use bytes::BufMut;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use sha2::Sha256;

use crate::tls::alert::AlertDescription;
use crate::tls::cipher_suite::{CipherSuite, MacAlgorithm};
use crate::tls::wire::{ContentType, VERSION_TLS12};

const BLOCK_LEN: usize = 16;
const GCM_EXPLICIT_NONCE_LEN: usize = 8;
const GCM_TAG_LEN: usize = 16;

/// Key material for one direction, as cut from the key block.
#[derive(Clone, Default)]
pub struct DirectionKeys {
    pub mac_key: Vec<u8>,
    pub cipher_key: Vec<u8>,
    pub implicit_iv: Vec<u8>,
}

#[derive(Default)]
pub struct Encrypter {
    suite: Option<CipherSuite>,
    keys: DirectionKeys,
    seq_num: u64,
}

impl Encrypter {
    pub fn new(suite: CipherSuite, keys: DirectionKeys) -> Self {
        Self {
            suite: Some(suite),
            keys,
            seq_num: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.suite.is_some()
    }

    pub fn is_aead(&self) -> bool {
        self.suite.is_some_and(|s| s.is_aead())
    }

    pub fn seq_num(&self) -> u64 {
        self.seq_num
    }

    /// Drop keys and return to the inactive state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// `seq || type || version || length`, the MAC prefix and AEAD
    /// additional data. Consumes one sequence number.
    fn record_header(&mut self, content_type: ContentType, len: usize) -> [u8; 13] {
        let seq = self.seq_num;
        self.seq_num = self.seq_num.wrapping_add(1);

        let mut header = [0u8; 13];
        let mut out = &mut header[..];
        out.put_u64(seq);
        out.put_u8(content_type as u8);
        out.put_u16(VERSION_TLS12);
        out.put_u16(len as u16);
        header
    }

    fn mac(&self, header: &[u8], data: &[u8]) -> Vec<u8> {
        let key = &self.keys.mac_key;
        match self.suite.map(|s| s.mac) {
            Some(MacAlgorithm::Sha1) => {
                let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
                mac.update(header);
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            Some(MacAlgorithm::Sha256) => {
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
                mac.update(header);
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            _ => Vec::new(),
        }
    }

    /// Protect one record body. The caller frames it with a record header.
    pub fn encrypt(&mut self, content_type: ContentType, plaintext: &[u8]) -> Result<Vec<u8>, AlertDescription> {
        if self.is_aead() {
            self.encrypt_gcm(content_type, plaintext)
        } else {
            self.encrypt_cbc(content_type, plaintext)
        }
    }

    fn encrypt_cbc(&mut self, content_type: ContentType, plaintext: &[u8]) -> Result<Vec<u8>, AlertDescription> {
        let header = self.record_header(content_type, plaintext.len());
        let mac = self.mac(&header, plaintext);

        let content_len = plaintext.len() + mac.len();
        let pad_len = BLOCK_LEN - content_len % BLOCK_LEN;

        let mut iv = [0u8; BLOCK_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let mut out = Vec::with_capacity(BLOCK_LEN + content_len + pad_len);
        out.extend_from_slice(&iv);
        out.extend_from_slice(plaintext);
        out.extend_from_slice(&mac);
        out.resize(out.len() + pad_len, (pad_len - 1) as u8);

        cbc_encrypt(&self.keys.cipher_key, &iv, &mut out[BLOCK_LEN..])?;
        Ok(out)
    }

    fn encrypt_gcm(&mut self, content_type: ContentType, plaintext: &[u8]) -> Result<Vec<u8>, AlertDescription> {
        let explicit = self.seq_num.to_be_bytes();
        let aad = self.record_header(content_type, plaintext.len());
        let nonce = self.gcm_nonce(&explicit)?;

        let mut out = Vec::with_capacity(GCM_EXPLICIT_NONCE_LEN + plaintext.len() + GCM_TAG_LEN);
        out.extend_from_slice(&explicit);
        out.extend_from_slice(plaintext);
        let tag = match self.keys.cipher_key.len() {
            16 => gcm_seal::<Aes128Gcm>(&self.keys.cipher_key, &nonce, &aad, &mut out[GCM_EXPLICIT_NONCE_LEN..])?,
            32 => gcm_seal::<Aes256Gcm>(&self.keys.cipher_key, &nonce, &aad, &mut out[GCM_EXPLICIT_NONCE_LEN..])?,
            _ => return Err(AlertDescription::InternalError),
        };
        out.extend_from_slice(&tag);
        Ok(out)
    }

    fn gcm_nonce(&self, explicit: &[u8]) -> Result<[u8; 12], AlertDescription> {
        if self.keys.implicit_iv.len() != 4 || explicit.len() != GCM_EXPLICIT_NONCE_LEN {
            return Err(AlertDescription::InternalError);
        }
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.keys.implicit_iv);
        nonce[4..].copy_from_slice(explicit);
        Ok(nonce)
    }

    /// Verify and strip protection from one record body.
    pub fn decrypt(&mut self, content_type: ContentType, body: Vec<u8>) -> Result<Vec<u8>, AlertDescription> {
        if self.is_aead() {
            self.decrypt_gcm(content_type, body)
        } else {
            self.decrypt_cbc(content_type, body)
        }
    }

    fn decrypt_cbc(&mut self, content_type: ContentType, mut body: Vec<u8>) -> Result<Vec<u8>, AlertDescription> {
        let mac_len = self.keys.mac_key.len();
        if body.len() % BLOCK_LEN != 0 || body.len() < BLOCK_LEN + mac_len + 1 {
            return Err(AlertDescription::BadRecordMac);
        }

        let mut data = body.split_off(BLOCK_LEN);
        let iv = body;
        cbc_decrypt(&self.keys.cipher_key, &iv, &mut data)?;

        // Compute everything before judging, so padding and MAC failures
        // are indistinguishable.
        let pad_len = *data.last().unwrap_or(&0) as usize;
        let mut pad_ok = pad_len + 1 + mac_len <= data.len();
        let strip = if pad_ok { pad_len + 1 } else { 1 };
        for byte in &data[data.len() - strip..] {
            pad_ok &= *byte as usize == pad_len;
        }
        data.truncate(data.len() - strip);

        let split = data.len().saturating_sub(mac_len);
        let received_mac = data.split_off(split);
        let header = self.record_header(content_type, data.len());
        let expected_mac = self.mac(&header, &data);

        if !constant_time_eq(&expected_mac, &received_mac) || !pad_ok {
            return Err(AlertDescription::BadRecordMac);
        }
        Ok(data)
    }

    fn decrypt_gcm(&mut self, content_type: ContentType, mut body: Vec<u8>) -> Result<Vec<u8>, AlertDescription> {
        if body.len() < GCM_EXPLICIT_NONCE_LEN + GCM_TAG_LEN {
            return Err(AlertDescription::BadRecordMac);
        }
        let tag = body.split_off(body.len() - GCM_TAG_LEN);
        let mut data = body.split_off(GCM_EXPLICIT_NONCE_LEN);
        let nonce = self.gcm_nonce(&body)?;
        let aad = self.record_header(content_type, data.len());

        match self.keys.cipher_key.len() {
            16 => gcm_open::<Aes128Gcm>(&self.keys.cipher_key, &nonce, &aad, &mut data, &tag)?,
            32 => gcm_open::<Aes256Gcm>(&self.keys.cipher_key, &nonce, &aad, &mut data, &tag)?,
            _ => return Err(AlertDescription::InternalError),
        }
        Ok(data)
    }
}

impl fmt::Debug for Encrypter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encrypter")
            .field("suite", &self.suite.map(|s| s.id))
            .field("seq_num", &self.seq_num)
            .finish()
    }
}

fn cbc_encrypt(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<(), AlertDescription> {
    let len = data.len();
    let result = match key.len() {
        16 => cbc::Encryptor::<aes::Aes128>::new_from_slices(key, iv)
            .map_err(|_| AlertDescription::InternalError)?
            .encrypt_padded_mut::<NoPadding>(data, len)
            .map(|_| ()),
        32 => cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(|_| AlertDescription::InternalError)?
            .encrypt_padded_mut::<NoPadding>(data, len)
            .map(|_| ()),
        _ => return Err(AlertDescription::InternalError),
    };
    result.map_err(|_| AlertDescription::InternalError)
}

fn cbc_decrypt(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<(), AlertDescription> {
    let result = match key.len() {
        16 => cbc::Decryptor::<aes::Aes128>::new_from_slices(key, iv)
            .map_err(|_| AlertDescription::InternalError)?
            .decrypt_padded_mut::<NoPadding>(data)
            .map(|_| ()),
        32 => cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(|_| AlertDescription::InternalError)?
            .decrypt_padded_mut::<NoPadding>(data)
            .map(|_| ()),
        _ => return Err(AlertDescription::InternalError),
    };
    result.map_err(|_| AlertDescription::BadRecordMac)
}

fn gcm_seal<C: AeadInPlace + KeyInit>(
    key: &[u8],
    nonce: &[u8; 12],
    aad: &[u8],
    data: &mut [u8],
) -> Result<Vec<u8>, AlertDescription> {
    let cipher = C::new_from_slice(key).map_err(|_| AlertDescription::InternalError)?;
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, data)
        .map_err(|_| AlertDescription::InternalError)?;
    Ok(tag.to_vec())
}

fn gcm_open<C: AeadInPlace + KeyInit>(
    key: &[u8],
    nonce: &[u8; 12],
    aad: &[u8],
    data: &mut [u8],
    tag: &[u8],
) -> Result<(), AlertDescription> {
    let cipher = C::new_from_slice(key).map_err(|_| AlertDescription::InternalError)?;
    cipher
        .decrypt_in_place_detached(GenericArray::from_slice(nonce), aad, data, GenericArray::from_slice(tag))
        .map_err(|_| AlertDescription::BadRecordMac)
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::cipher_suite::*;

    fn pair(suite_id: u16) -> (Encrypter, Encrypter) {
        let suite = CipherSuite::from_id(suite_id).unwrap();
        let keys = DirectionKeys {
            mac_key: vec![0x11; suite.mac_key_len()],
            cipher_key: vec![0x22; suite.enc_key_len()],
            implicit_iv: vec![0x33; suite.fixed_iv_len()],
        };
        (Encrypter::new(suite, keys.clone()), Encrypter::new(suite, keys))
    }

    #[test]
    fn inactive_by_default() {
        let enc = Encrypter::default();
        assert!(!enc.is_active());
        assert!(!enc.is_aead());
    }

    #[test]
    fn each_mode_decrypts_what_it_encrypts() {
        for id in [
            TLS_RSA_WITH_AES_128_CBC_SHA,
            TLS_RSA_WITH_AES_256_CBC_SHA256,
            TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        ] {
            let (mut send, mut recv) = pair(id);
            for len in [0usize, 1, 15, 16, 17, 1000] {
                let plaintext = vec![0xAB; len];
                let body = send.encrypt(ContentType::ApplicationData, &plaintext).unwrap();
                let opened = recv.decrypt(ContentType::ApplicationData, body).unwrap();
                assert_eq!(opened, plaintext, "suite {id:#06x} len {len}");
            }
            assert_eq!(send.seq_num(), 6);
            assert_eq!(recv.seq_num(), 6);
        }
    }

    #[test]
    fn gcm_explicit_nonce_is_sequence_number() {
        let (mut send, _) = pair(TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256);
        send.encrypt(ContentType::ApplicationData, b"a").unwrap();
        let body = send.encrypt(ContentType::ApplicationData, b"b").unwrap();
        assert_eq!(&body[..8], &1u64.to_be_bytes());
    }

    #[test]
    fn out_of_order_record_fails() {
        let (mut send, mut recv) = pair(TLS_RSA_WITH_AES_128_CBC_SHA);
        let _first = send.encrypt(ContentType::ApplicationData, b"one").unwrap();
        let second = send.encrypt(ContentType::ApplicationData, b"two").unwrap();
        assert_eq!(
            recv.decrypt(ContentType::ApplicationData, second),
            Err(AlertDescription::BadRecordMac)
        );
    }

    #[test]
    fn content_type_is_authenticated() {
        let (mut send, mut recv) = pair(TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384);
        let body = send.encrypt(ContentType::Handshake, b"finished").unwrap();
        assert_eq!(
            recv.decrypt(ContentType::ApplicationData, body),
            Err(AlertDescription::BadRecordMac)
        );
    }

    #[test]
    fn misaligned_or_short_bodies_are_rejected() {
        let (_, mut recv) = pair(TLS_RSA_WITH_AES_128_CBC_SHA);
        assert_eq!(
            recv.decrypt(ContentType::ApplicationData, vec![0; 33]),
            Err(AlertDescription::BadRecordMac)
        );
        assert_eq!(
            recv.decrypt(ContentType::ApplicationData, vec![0; 16]),
            Err(AlertDescription::BadRecordMac)
        );

        let (_, mut recv) = pair(TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256);
        assert_eq!(
            recv.decrypt(ContentType::ApplicationData, vec![0; 23]),
            Err(AlertDescription::BadRecordMac)
        );
    }

    #[test]
    fn reset_clears_sequence() {
        let (mut send, _) = pair(TLS_RSA_WITH_AES_128_CBC_SHA);
        send.encrypt(ContentType::ApplicationData, b"x").unwrap();
        send.reset();
        assert!(!send.is_active());
        assert_eq!(send.seq_num(), 0);
    }
}

//! Cipher suite catalogue and negotiation.

use rand::seq::SliceRandom;
use rand::Rng;

pub const TLS_RSA_WITH_AES_128_CBC_SHA: u16 = 0x002F;
pub const TLS_RSA_WITH_AES_256_CBC_SHA: u16 = 0x0035;
pub const TLS_RSA_WITH_AES_128_CBC_SHA256: u16 = 0x003C;
pub const TLS_RSA_WITH_AES_256_CBC_SHA256: u16 = 0x003D;
pub const TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA: u16 = 0xC009;
pub const TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA: u16 = 0xC00A;
pub const TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA: u16 = 0xC013;
pub const TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA: u16 = 0xC014;
pub const TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256: u16 = 0xC023;
pub const TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256: u16 = 0xC027;
pub const TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256: u16 = 0xC02B;
pub const TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384: u16 = 0xC02C;
pub const TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256: u16 = 0xC02F;
pub const TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384: u16 = 0xC030;

/// Suites the server role accepts, in no particular order; the client's
/// preference decides.
pub const SERVER_SUITES: [u16; 4] = [
    TLS_RSA_WITH_AES_128_CBC_SHA,
    TLS_RSA_WITH_AES_256_CBC_SHA,
    TLS_RSA_WITH_AES_128_CBC_SHA256,
    TLS_RSA_WITH_AES_256_CBC_SHA256,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExchange {
    Rsa,
    EcdheRsa,
    EcdheEcdsa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkCipher {
    Aes128Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes256Gcm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    Sha1,
    Sha256,
    /// AEAD suites carry no separate MAC.
    Aead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrfHash {
    Sha256,
    Sha384,
}

/// Everything key derivation and the record layer need to know about a
/// negotiated suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSuite {
    pub id: u16,
    pub key_exchange: KeyExchange,
    pub cipher: BulkCipher,
    pub mac: MacAlgorithm,
    pub prf: PrfHash,
}

impl CipherSuite {
    pub fn from_id(id: u16) -> Option<Self> {
        use BulkCipher::*;
        use KeyExchange::*;
        use MacAlgorithm as M;

        let (key_exchange, cipher, mac) = match id {
            TLS_RSA_WITH_AES_128_CBC_SHA => (Rsa, Aes128Cbc, M::Sha1),
            TLS_RSA_WITH_AES_256_CBC_SHA => (Rsa, Aes256Cbc, M::Sha1),
            TLS_RSA_WITH_AES_128_CBC_SHA256 => (Rsa, Aes128Cbc, M::Sha256),
            TLS_RSA_WITH_AES_256_CBC_SHA256 => (Rsa, Aes256Cbc, M::Sha256),
            TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA => (EcdheEcdsa, Aes128Cbc, M::Sha1),
            TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA => (EcdheEcdsa, Aes256Cbc, M::Sha1),
            TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA => (EcdheRsa, Aes128Cbc, M::Sha1),
            TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA => (EcdheRsa, Aes256Cbc, M::Sha1),
            TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256 => (EcdheEcdsa, Aes128Cbc, M::Sha256),
            TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256 => (EcdheRsa, Aes128Cbc, M::Sha256),
            TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256 => (EcdheEcdsa, Aes128Gcm, M::Aead),
            TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384 => (EcdheEcdsa, Aes256Gcm, M::Aead),
            TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256 => (EcdheRsa, Aes128Gcm, M::Aead),
            TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384 => (EcdheRsa, Aes256Gcm, M::Aead),
            _ => return None,
        };
        let prf = if cipher == Aes256Gcm {
            PrfHash::Sha384
        } else {
            PrfHash::Sha256
        };
        Some(Self {
            id,
            key_exchange,
            cipher,
            mac,
            prf,
        })
    }

    pub fn is_ecdhe(&self) -> bool {
        self.key_exchange != KeyExchange::Rsa
    }

    pub fn is_aead(&self) -> bool {
        self.mac == MacAlgorithm::Aead
    }

    pub fn mac_key_len(&self) -> usize {
        match self.mac {
            MacAlgorithm::Sha1 => 20,
            MacAlgorithm::Sha256 => 32,
            MacAlgorithm::Aead => 0,
        }
    }

    pub fn enc_key_len(&self) -> usize {
        match self.cipher {
            BulkCipher::Aes128Cbc | BulkCipher::Aes128Gcm => 16,
            BulkCipher::Aes256Cbc | BulkCipher::Aes256Gcm => 32,
        }
    }

    /// Implicit (salt) IV length; CBC suites send their IV explicitly.
    pub fn fixed_iv_len(&self) -> usize {
        if self.is_aead() {
            4
        } else {
            0
        }
    }

    pub fn key_block_len(&self) -> usize {
        2 * (self.mac_key_len() + self.enc_key_len() + self.fixed_iv_len())
    }
}

/// The client's offer: five groups, each shuffled, with one GREASE value
/// dropped in at a random position.
pub fn client_offer() -> Vec<u16> {
    let groups: [&[u16]; 5] = [
        &[
            TLS_RSA_WITH_AES_256_CBC_SHA256,
            TLS_RSA_WITH_AES_128_CBC_SHA256,
            TLS_RSA_WITH_AES_256_CBC_SHA,
            TLS_RSA_WITH_AES_128_CBC_SHA,
        ],
        &[
            TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA,
            TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256,
            TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA,
        ],
        &[
            TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA,
            TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256,
            TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA,
        ],
        &[
            TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        ],
        &[
            TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        ],
    ];

    let mut rng = rand::thread_rng();
    let mut offer = Vec::with_capacity(15);
    for group in groups {
        let start = offer.len();
        offer.extend_from_slice(group);
        offer[start..].shuffle(&mut rng);
    }
    let at = rng.gen_range(0..offer.len());
    offer.insert(at, grease_value());
    offer
}

/// One of the sixteen reserved GREASE code points (0x0A0A, 0x1A1A, ...).
pub fn grease_value() -> u16 {
    let nibble: u16 = rand::thread_rng().gen_range(0..16);
    let byte = (nibble << 4) | 0x0A;
    (byte << 8) | byte
}

pub fn is_grease(id: u16) -> bool {
    id & 0x0F0F == 0x0A0A && id >> 8 == id & 0xFF
}

/// First suite in the client's list that the server role supports.
pub fn select_server_suite(offered: &[u16]) -> Option<CipherSuite> {
    offered
        .iter()
        .copied()
        .find(|id| SERVER_SUITES.contains(id))
        .and_then(CipherSuite::from_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_contains_every_suite_and_one_grease() {
        let offer = client_offer();
        assert_eq!(offer.len(), 15);
        assert_eq!(offer.iter().filter(|id| is_grease(**id)).count(), 1);
        for id in offer.iter().filter(|id| !is_grease(**id)) {
            assert!(CipherSuite::from_id(*id).is_some(), "unknown suite {id:#06x}");
        }
    }

    #[test]
    fn grease_values_are_reserved_points() {
        for _ in 0..64 {
            let value = grease_value();
            assert!(is_grease(value), "{value:#06x}");
        }
        assert!(!is_grease(TLS_RSA_WITH_AES_128_CBC_SHA));
    }

    #[test]
    fn key_material_sizes() {
        let cbc = CipherSuite::from_id(TLS_RSA_WITH_AES_128_CBC_SHA).unwrap();
        assert_eq!(cbc.key_block_len(), 2 * (20 + 16));

        let sha256 = CipherSuite::from_id(TLS_RSA_WITH_AES_256_CBC_SHA256).unwrap();
        assert_eq!(sha256.key_block_len(), 2 * (32 + 32));

        let gcm = CipherSuite::from_id(TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384).unwrap();
        assert_eq!(gcm.key_block_len(), 2 * (32 + 4));
        assert_eq!(gcm.prf, PrfHash::Sha384);
        assert!(gcm.is_ecdhe() && gcm.is_aead());
    }

    #[test]
    fn server_follows_client_preference() {
        let offered = [
            0x1A1A,
            TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            TLS_RSA_WITH_AES_256_CBC_SHA,
            TLS_RSA_WITH_AES_128_CBC_SHA,
        ];
        assert_eq!(select_server_suite(&offered).unwrap().id, TLS_RSA_WITH_AES_256_CBC_SHA);
        assert!(select_server_suite(&[TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256]).is_none());
    }
}

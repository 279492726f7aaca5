//! Client side of the key exchange.
//!
//! RSA suites encrypt a fresh pre-master secret to the server's leaf key.
//! ECDHE suites check the server's named-curve point, generate an ephemeral
//! key pair on the same curve and use the shared secret as the pre-master
//! secret.

use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::tls::alert::AlertDescription;
use crate::tls::cert_store::PRE_MASTER_SECRET_LEN;
use crate::tls::certchain::PeerKey;
use crate::tls::wire::{self, named_curve, EcdhParams, DecodeResult, VERSION_TLS12};

/// `ECCurveType.named_curve`.
pub const CURVE_TYPE_NAMED: u8 = 3;

/// Curves offered in the ClientHello, in preference order.
pub const SUPPORTED_CURVES: [u16; 3] = [named_curve::X25519, named_curve::SECP256R1, named_curve::SECP384R1];

/// What the client sends and what it keeps.
pub struct ClientKeyExchange {
    /// ClientKeyExchange body, ready for framing.
    pub message: Vec<u8>,
    pub pre_master_secret: Vec<u8>,
}

/// RSA key transport. The secret starts with the offered protocol version.
pub fn rsa_transport(peer_key: &PeerKey) -> DecodeResult<ClientKeyExchange> {
    if !peer_key.is_rsa() {
        return Err(AlertDescription::IllegalParameter);
    }
    let mut pre_master_secret = vec![0u8; PRE_MASTER_SECRET_LEN];
    pre_master_secret[..2].copy_from_slice(&VERSION_TLS12.to_be_bytes());
    OsRng.fill_bytes(&mut pre_master_secret[2..]);

    let encrypted = peer_key.encrypt_pkcs1(&pre_master_secret).map_err(|err| {
        tracing::warn!(error = %err, "RSA pre-master encryption failed");
        AlertDescription::IllegalParameter
    })?;
    Ok(ClientKeyExchange {
        message: wire::encode_rsa_client_key_exchange(&encrypted),
        pre_master_secret,
    })
}

/// Shape checks on the server's ECDH parameters: a named curve we offered,
/// with a point of the right size and encoding for it.
pub fn check_server_params(params: &EcdhParams) -> DecodeResult<()> {
    if params.curve_type != CURVE_TYPE_NAMED {
        return Err(AlertDescription::IllegalParameter);
    }
    let point = &params.point;
    let well_formed = match params.named_curve {
        named_curve::X25519 => point.len() == 32,
        named_curve::SECP256R1 => point.len() == 65 && point[0] == 0x04,
        named_curve::SECP384R1 => point.len() == 97 && point[0] == 0x04,
        _ => false,
    };
    if !well_formed {
        return Err(AlertDescription::IllegalParameter);
    }
    Ok(())
}

/// Ephemeral-ephemeral Diffie-Hellman against the server's point.
pub fn ecdhe(params: &EcdhParams) -> DecodeResult<ClientKeyExchange> {
    check_server_params(params)?;
    let (public, pre_master_secret) = match params.named_curve {
        named_curve::X25519 => x25519(&params.point)?,
        named_curve::SECP256R1 => {
            let peer = p256::PublicKey::from_sec1_bytes(&params.point)
                .map_err(|_| AlertDescription::IllegalParameter)?;
            let secret = p256::ecdh::EphemeralSecret::random(&mut OsRng);
            let shared = secret.diffie_hellman(&peer);
            (
                secret.public_key().to_encoded_point(false).as_bytes().to_vec(),
                shared.raw_secret_bytes().to_vec(),
            )
        }
        named_curve::SECP384R1 => {
            let peer = p384::PublicKey::from_sec1_bytes(&params.point)
                .map_err(|_| AlertDescription::IllegalParameter)?;
            let secret = p384::ecdh::EphemeralSecret::random(&mut OsRng);
            let shared = secret.diffie_hellman(&peer);
            (
                secret.public_key().to_encoded_point(false).as_bytes().to_vec(),
                shared.raw_secret_bytes().to_vec(),
            )
        }
        _ => return Err(AlertDescription::IllegalParameter),
    };
    Ok(ClientKeyExchange {
        message: wire::encode_ecdhe_client_key_exchange(&public),
        pre_master_secret,
    })
}

fn x25519(point: &[u8]) -> DecodeResult<(Vec<u8>, Vec<u8>)> {
    let bytes: [u8; 32] = point.try_into().map_err(|_| AlertDescription::IllegalParameter)?;
    let peer = x25519_dalek::PublicKey::from(bytes);
    let secret = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
    let public = x25519_dalek::PublicKey::from(&secret);
    let shared = secret.diffie_hellman(&peer);
    // A low-order point yields an all-zero secret.
    if !shared.was_contributory() {
        return Err(AlertDescription::IllegalParameter);
    }
    Ok((public.as_bytes().to_vec(), shared.as_bytes().to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(named_curve: u16, point: Vec<u8>) -> EcdhParams {
        EcdhParams {
            curve_type: CURVE_TYPE_NAMED,
            named_curve,
            point,
        }
    }

    #[test]
    fn point_shape_is_checked_per_curve() {
        assert!(check_server_params(&params(named_curve::X25519, vec![9; 32])).is_ok());
        assert!(check_server_params(&params(named_curve::X25519, vec![9; 33])).is_err());
        assert!(check_server_params(&params(named_curve::SECP256R1, vec![4; 65])).is_ok());
        assert!(check_server_params(&params(named_curve::SECP256R1, vec![2; 65])).is_err());
        assert!(check_server_params(&params(named_curve::SECP384R1, vec![4; 65])).is_err());
        assert!(check_server_params(&params(30, vec![4; 65])).is_err());

        let mut explicit = params(named_curve::X25519, vec![9; 32]);
        explicit.curve_type = 1;
        assert_eq!(check_server_params(&explicit), Err(AlertDescription::IllegalParameter));
    }

    #[test]
    fn x25519_agrees_with_server() {
        let server = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
        let server_public = x25519_dalek::PublicKey::from(&server);

        let exchange = ecdhe(&params(named_curve::X25519, server_public.as_bytes().to_vec())).unwrap();
        assert_eq!(exchange.message.len(), 33);
        assert_eq!(exchange.message[0], 32);

        let client_public: [u8; 32] = exchange.message[1..].try_into().unwrap();
        let shared = server.diffie_hellman(&x25519_dalek::PublicKey::from(client_public));
        assert_eq!(shared.as_bytes().to_vec(), exchange.pre_master_secret);
    }

    #[test]
    fn x25519_rejects_low_order_point() {
        let result = ecdhe(&params(named_curve::X25519, vec![0; 32]));
        assert!(matches!(result, Err(AlertDescription::IllegalParameter)));
    }

    #[test]
    fn p256_agrees_with_server() {
        let server = p256::ecdh::EphemeralSecret::random(&mut OsRng);
        let server_point = server.public_key().to_encoded_point(false).as_bytes().to_vec();

        let exchange = ecdhe(&params(named_curve::SECP256R1, server_point)).unwrap();
        assert_eq!(exchange.message[0], 65);

        let client = p256::PublicKey::from_sec1_bytes(&exchange.message[1..]).unwrap();
        let shared = server.diffie_hellman(&client);
        assert_eq!(shared.raw_secret_bytes().to_vec(), exchange.pre_master_secret);
    }

    #[test]
    fn p384_rejects_point_off_curve() {
        let mut point = vec![0x04];
        point.extend_from_slice(&[0xAB; 96]);
        let result = ecdhe(&params(named_curve::SECP384R1, point));
        assert!(matches!(result, Err(AlertDescription::IllegalParameter)));
    }

    #[test]
    fn rsa_secret_carries_version_and_decrypts() {
        let private = rsa::RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let peer = PeerKey::Rsa(rsa::RsaPublicKey::from(&private));

        let exchange = rsa_transport(&peer).unwrap();
        assert_eq!(exchange.pre_master_secret.len(), PRE_MASTER_SECRET_LEN);
        assert_eq!(&exchange.pre_master_secret[..2], &[3, 3]);

        let encrypted = wire::decode_rsa_client_key_exchange(&exchange.message).unwrap();
        let decrypted = private.decrypt(rsa::Pkcs1v15Encrypt, &encrypted).unwrap();
        assert_eq!(decrypted, exchange.pre_master_secret);
    }

    #[test]
    fn rsa_exchange_needs_rsa_leaf() {
        let secret = p256::SecretKey::random(&mut OsRng);
        let peer = PeerKey::P256(secret.public_key());
        assert!(matches!(rsa_transport(&peer), Err(AlertDescription::IllegalParameter)));
    }
}

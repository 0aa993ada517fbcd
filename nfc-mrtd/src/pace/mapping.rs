//! Generic mapping on the NIST P-256 curve and the cryptographic helpers around it.
//!
//! Points travel as uncompressed SEC1 encodings (`04 || x || y`).


use aes::Aes128;
use block_padding::NoPadding;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cipher::generic_array::GenericArray;
use hmac::{Hmac, Mac};
use p256::{FieldBytes, ProjectivePoint, PublicKey, Scalar};
use p256::elliptic_curve::PrimeField;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::pace::Error;


/// Length of the PACE nonce `s` (one AES block).
pub const NONCE_LENGTH: usize = 16;

/// Length of an authentication token.
pub const TOKEN_LENGTH: usize = 8;


/// Decrypts the nonce `z` sent by the chip into `s` using `K_π`.
pub fn decrypt_nonce(k_pi: &[u8; 16], encrypted_nonce: &[u8]) -> Result<Zeroizing<[u8; NONCE_LENGTH]>, Error> {
    if encrypted_nonce.len() != NONCE_LENGTH {
        return Err(Error::NonceLength { obtained: encrypted_nonce.len() });
    }
    let mut nonce = Zeroizing::new([0u8; NONCE_LENGTH]);
    nonce.copy_from_slice(encrypted_nonce);

    let iv = [0u8; NONCE_LENGTH];
    cbc::Decryptor::<Aes128>::new(GenericArray::from_slice(k_pi), &iv.into())
        .decrypt_padded_mut::<NoPadding>(nonce.as_mut_slice())
        .map_err(|_| Error::NonceLength { obtained: encrypted_nonce.len() })?;
    Ok(nonce)
}


/// Encrypts the nonce `s` into `z`; the chip side of [`decrypt_nonce`].
pub fn encrypt_nonce(k_pi: &[u8; 16], nonce: &[u8; NONCE_LENGTH]) -> Result<[u8; NONCE_LENGTH], Error> {
    let mut encrypted = *nonce;
    let iv = [0u8; NONCE_LENGTH];
    cbc::Encryptor::<Aes128>::new(GenericArray::from_slice(k_pi), &iv.into())
        .encrypt_padded_mut::<NoPadding>(&mut encrypted, NONCE_LENGTH)
        .map_err(|_| Error::NonceLength { obtained: NONCE_LENGTH })?;
    Ok(encrypted)
}


/// Interprets the nonce as a big-endian scalar.
pub fn nonce_scalar(nonce: &[u8; NONCE_LENGTH]) -> Result<Scalar, Error> {
    let mut repr = FieldBytes::default();
    let offset = repr.len() - NONCE_LENGTH;
    repr[offset..].copy_from_slice(nonce);
    Option::from(Scalar::from_repr(repr))
        .ok_or(Error::NonceLength { obtained: NONCE_LENGTH })
}


/// Encodes a point in uncompressed form. The point at infinity has no encoding.
pub fn encode_point(point: &ProjectivePoint) -> Result<Vec<u8>, Error> {
    let public_key = PublicKey::from_affine(point.to_affine())
        .map_err(|_| Error::IdentityPoint)?;
    Ok(public_key.to_encoded_point(false).as_bytes().to_vec())
}


/// Decodes a point received from the peer, checking that it lies on the curve.
pub fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint, Error> {
    let public_key = PublicKey::from_sec1_bytes(bytes)
        .map_err(|_| Error::PublicKey { bytes: Zeroizing::new(bytes.to_vec()) })?;
    Ok(public_key.to_projective())
}


/// Computes the mapped generator `G' = s·G + sk·PK`, where `PK` is the peer's mapping key.
pub fn map_generator(nonce: &Scalar, private_key: &Scalar, peer_mapping_key: &ProjectivePoint) -> Result<ProjectivePoint, Error> {
    let shared_point = *peer_mapping_key * private_key;
    if shared_point == ProjectivePoint::IDENTITY {
        return Err(Error::IdentityPoint);
    }
    let mapped = ProjectivePoint::GENERATOR * nonce + shared_point;
    if mapped == ProjectivePoint::IDENTITY {
        return Err(Error::IdentityPoint);
    }
    Ok(mapped)
}


/// Computes the ECDH shared secret: the x coordinate of `sk·PK`.
pub fn shared_secret(private_key: &Scalar, peer_public_key: &ProjectivePoint) -> Result<Zeroizing<Vec<u8>>, Error> {
    let shared_point = (*peer_public_key * private_key).to_affine();
    let encoded = shared_point.to_encoded_point(false);
    let x = encoded.x()
        .ok_or(Error::IdentityPoint)?;
    Ok(Zeroizing::new(x.to_vec()))
}


/// Computes an authentication token: the truncated HMAC-SHA-256 of the other party's ephemeral
/// public key.
pub fn authentication_token(k_mac: &[u8; 16], public_key: &[u8]) -> Result<[u8; TOKEN_LENGTH], Error> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(k_mac)
        .map_err(|_| Error::TokenKey)?;
    mac.update(public_key);
    let result = mac.finalize().into_bytes();
    let mut token = [0u8; TOKEN_LENGTH];
    token.copy_from_slice(&result[0..TOKEN_LENGTH]);
    Ok(token)
}


/// Checks a received token against the expected value in constant time.
pub fn verify_token(k_mac: &[u8; 16], public_key: &[u8], received_token: &[u8]) -> Result<bool, Error> {
    let expected = authentication_token(k_mac, public_key)?;
    Ok(expected[..].ct_eq(received_token).into())
}


#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use p256::NonZeroScalar;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use super::*;

    #[test]
    fn test_nonce_round_trip() {
        let k_pi = hex!("591468CDA83D65219CCCB8560233600F");
        let nonce = hex!("3F00C4D39D153F2B2A214A078D899B22");
        let encrypted = encrypt_nonce(&k_pi, &nonce).unwrap();
        assert_ne!(encrypted, nonce);
        assert_eq!(*decrypt_nonce(&k_pi, &encrypted).unwrap(), nonce);
        assert!(matches!(decrypt_nonce(&k_pi, &encrypted[..15]), Err(Error::NonceLength { obtained: 15 })));
    }

    #[test]
    fn test_point_encoding() {
        let encoded = encode_point(&ProjectivePoint::GENERATOR).unwrap();
        assert_eq!(encoded.len(), 65);
        assert_eq!(encoded[0], 0x04);
        assert_eq!(
            &encoded[1..33],
            &hex!("6B17D1F2E12C4247F8BCE6E563A440F277037D812DEB33A0F4A13945D898C296"),
        );
        assert_eq!(decode_point(&encoded).unwrap(), ProjectivePoint::GENERATOR);

        assert!(matches!(encode_point(&ProjectivePoint::IDENTITY), Err(Error::IdentityPoint)));

        let mut off_curve = encoded.clone();
        off_curve[64] ^= 0x01;
        assert!(matches!(decode_point(&off_curve), Err(Error::PublicKey { .. })));
    }

    #[test]
    fn test_both_sides_agree() {
        let mut rng = StdRng::seed_from_u64(9303);
        let nonce = nonce_scalar(&hex!("3F00C4D39D153F2B2A214A078D899B22")).unwrap();

        let terminal_map = NonZeroScalar::random(&mut rng);
        let chip_map = NonZeroScalar::random(&mut rng);
        let terminal_map_public = ProjectivePoint::GENERATOR * *terminal_map;
        let chip_map_public = ProjectivePoint::GENERATOR * *chip_map;

        let terminal_generator = map_generator(&nonce, &terminal_map, &chip_map_public).unwrap();
        let chip_generator = map_generator(&nonce, &chip_map, &terminal_map_public).unwrap();
        assert_eq!(terminal_generator, chip_generator);

        let terminal_eph = NonZeroScalar::random(&mut rng);
        let chip_eph = NonZeroScalar::random(&mut rng);
        let terminal_eph_public = terminal_generator * *terminal_eph;
        let chip_eph_public = chip_generator * *chip_eph;

        let terminal_secret = shared_secret(&terminal_eph, &chip_eph_public).unwrap();
        let chip_secret = shared_secret(&chip_eph, &terminal_eph_public).unwrap();
        assert_eq!(terminal_secret.len(), 32);
        assert_eq!(*terminal_secret, *chip_secret);
    }

    #[test]
    fn test_token() {
        let k_mac = hex!("000102030405060708090A0B0C0D0E0F");
        let token = authentication_token(&k_mac, b"public key").unwrap();
        assert!(verify_token(&k_mac, b"public key", &token).unwrap());
        assert!(!verify_token(&k_mac, b"other key", &token).unwrap());
        assert!(!verify_token(&k_mac, b"public key", &token[..7]).unwrap());
    }
}

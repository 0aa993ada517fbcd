//! Key derivation functions.
//!
//! BAC (and the session keys it produces) use SHA-1 with two-key 3DES keys; PACE derives its
//! session material using SHA-256.


use digest::Digest;
use sha1::Sha1;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypt::adjust_parity;
use crate::crypt::tdes::expand_key;
use crate::mrz::MrzInfo;


/// Counter value for deriving an encryption key.
pub const ENC_COUNTER: u32 = 1;

/// Counter value for deriving a MAC key.
pub const MAC_COUNTER: u32 = 2;


/// A key derivation function.
pub trait Kdf<K> {
    /// The key derivation function itself.
    fn derive_key(key_seed: &[u8], counter: u32) -> K;

    /// The key derivation function for encryption purposes.
    fn derive_encryption_key(key_seed: &[u8]) -> K {
        Self::derive_key(key_seed, ENC_COUNTER)
    }

    /// The key derivation function for message authentication purposes.
    fn derive_mac_key(key_seed: &[u8]) -> K {
        Self::derive_key(key_seed, MAC_COUNTER)
    }
}


/// Key derivation function for 3DES.
///
/// 3DES is used in EDE two-key mode, i.e. `K3 = K1`.
///
/// The KDF is equivalent to:
/// ```plain
/// keydata = sha1(key || counter)[0..16]
/// ```
/// whereupon each byte is adjusted to odd parity and
/// ```plain
/// K1 = keydata[0..8]
/// K2 = keydata[8..16]
/// K3 = K1
/// ```
pub struct Kdf3Des;
impl Kdf<Zeroizing<[u8; 24]>> for Kdf3Des {
    fn derive_key(key_seed: &[u8], counter: u32) -> Zeroizing<[u8; 24]> {
        let mut hasher = Sha1::new();
        hasher.update(key_seed);
        hasher.update(counter.to_be_bytes());
        let result = hasher.finalize();

        let mut keydata = Zeroizing::new([0u8; 16]);
        keydata.copy_from_slice(&result[0..16]);
        adjust_parity(keydata.as_mut_slice());
        Zeroizing::new(expand_key(&keydata))
    }
}


/// Key derivation function used by PACE with a 128-bit key size.
///
/// The KDF is equivalent to:
/// ```plain
/// keydata = sha256(key || counter)[0..16]
/// ```
pub struct KdfSha256;
impl Kdf<Zeroizing<[u8; 16]>> for KdfSha256 {
    fn derive_key(key_seed: &[u8], counter: u32) -> Zeroizing<[u8; 16]> {
        let mut hasher = Sha256::new();
        hasher.update(key_seed);
        hasher.update(counter.to_be_bytes());
        let result = hasher.finalize();

        let mut keydata = Zeroizing::new([0u8; 16]);
        keydata.copy_from_slice(&result[0..16]);
        keydata
    }
}


/// Derives the BAC key seed from the MRZ information: the first 16 bytes of its SHA-1 hash.
pub fn bac_key_seed(mrz_info: &MrzInfo) -> Zeroizing<[u8; 16]> {
    let information = Zeroizing::new(mrz_info.mrz_information());
    let hash = Sha1::digest(information.as_bytes());
    let mut seed = Zeroizing::new([0u8; 16]);
    seed.copy_from_slice(&hash[0..16]);
    seed
}


/// Derives the PACE password key `K_π`: the first 16 bytes of the SHA-256 hash of the password.
pub fn pace_password_key(password: &[u8]) -> Zeroizing<[u8; 16]> {
    let hash = Sha256::digest(password);
    let mut key = Zeroizing::new([0u8; 16]);
    key.copy_from_slice(&hash[0..16]);
    key
}


#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use super::*;

    #[test]
    fn test_key_derivation_part_11_appendix_d_1() {
        let info = MrzInfo::new("L898902C<", "690806", "940623").unwrap();
        assert_eq!(info.mrz_information(), "L898902C<369080619406236");

        let seed = bac_key_seed(&info);
        assert_eq!(*seed, hex!("239AB9CB282DAF66231DC5A4DF6BFBAE"));

        let k_enc = Kdf3Des::derive_encryption_key(seed.as_slice());
        assert_eq!(*k_enc, hex!("AB94FDECF2674FDFB9B391F85D7F76F2AB94FDECF2674FDF"));
        let k_mac = Kdf3Des::derive_mac_key(seed.as_slice());
        assert_eq!(*k_mac, hex!("7962D9ECE03D1ACD4C76089DCE1315437962D9ECE03D1ACD"));
    }

    #[test]
    fn test_key_derivation_specimen_passport() {
        let info = MrzInfo::new("L898902C3", "740812", "120415").unwrap();
        assert_eq!(info.mrz_information(), "L898902C3674081221204159");

        let seed = bac_key_seed(&info);
        assert_eq!(*seed, hex!("3F181D701DD9F12E525EF9B5EBEF8909"));
        assert_eq!(
            *Kdf3Des::derive_encryption_key(seed.as_slice()),
            hex!("3D6EA789F8973D023B435B104FA8D56B3D6EA789F8973D02"),
        );
        assert_eq!(
            *Kdf3Des::derive_mac_key(seed.as_slice()),
            hex!("DFD63E011A57F44C16A43B236EAB456BDFD63E011A57F44C"),
        );
    }

    #[test]
    fn test_sha256_derivation_is_a_prefix() {
        let full = Sha256::digest(b"secret\x00\x00\x00\x01");
        assert_eq!(KdfSha256::derive_encryption_key(b"secret").as_slice(), &full[0..16]);
        assert_ne!(*KdfSha256::derive_encryption_key(b"secret"), *KdfSha256::derive_mac_key(b"secret"));
        assert_eq!(pace_password_key(b"123456").as_slice(), &Sha256::digest(b"123456")[0..16]);
    }
}

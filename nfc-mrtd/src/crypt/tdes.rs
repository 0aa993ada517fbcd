//! Two-key 3DES in CBC mode and the ISO/IEC 9797-1 MAC algorithm 3 ("retail MAC").
//!
//! Keys are handled in their 24-byte `Ka || Kb || Ka` form throughout.


use block_padding::NoPadding;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cipher::generic_array::GenericArray;
use des::TdesEde3;
use retail_des::Des as MacDes;
use retail_mac::{Mac, RetailMac};
use retail_mac::digest::KeyInit;

use crate::crypt::{CryptError, DES_BLOCK_SIZE, ensure_aligned};


/// Expands a two-key 3DES key `Ka || Kb` into `Ka || Kb || Ka`.
pub fn expand_key(key: &[u8; 16]) -> [u8; 24] {
    let mut ret = [0u8; 24];
    ret[0..16].copy_from_slice(key);
    ret[16..24].copy_from_slice(&key[0..8]);
    ret
}


/// Encrypts pre-padded data in place with 3DES-CBC and an all-zero IV.
pub fn encrypt_cbc(key: &[u8; 24], data: &mut [u8]) -> Result<(), CryptError> {
    ensure_aligned(data, DES_BLOCK_SIZE)?;
    let iv = [0u8; DES_BLOCK_SIZE];
    let encryptor = cbc::Encryptor::<TdesEde3>::new(GenericArray::from_slice(key), &iv.into());
    let data_len = data.len();
    encryptor.encrypt_padded_mut::<NoPadding>(data, data_len)
        .map_err(|_| CryptError::Misaligned { length: data_len, block_size: DES_BLOCK_SIZE })?;
    Ok(())
}


/// Decrypts data in place with 3DES-CBC and an all-zero IV. Padding is left in place.
pub fn decrypt_cbc(key: &[u8; 24], data: &mut [u8]) -> Result<(), CryptError> {
    ensure_aligned(data, DES_BLOCK_SIZE)?;
    let iv = [0u8; DES_BLOCK_SIZE];
    let decryptor = cbc::Decryptor::<TdesEde3>::new(GenericArray::from_slice(key), &iv.into());
    let data_len = data.len();
    decryptor.decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| CryptError::Misaligned { length: data_len, block_size: DES_BLOCK_SIZE })?;
    Ok(())
}


/// Retail MAC keyed with `Ka || Kb`.
type RetailMacDes = RetailMac<MacDes>;


fn keyed_mac(key: &[u8; 24], padded_data: &[u8]) -> Result<RetailMacDes, CryptError> {
    ensure_aligned(padded_data, DES_BLOCK_SIZE)?;
    if padded_data.is_empty() {
        return Err(CryptError::Misaligned { length: 0, block_size: DES_BLOCK_SIZE });
    }
    let mut mac = <RetailMacDes as KeyInit>::new_from_slice(&key[0..16])
        .map_err(|_| CryptError::KeyLength { length: 16 })?;
    Mac::update(&mut mac, padded_data);
    Ok(mac)
}


/// Computes the retail MAC over pre-padded data.
///
/// Single DES with `Ka` in CBC mode over every block, then the final block is decrypted with `Kb`
/// and encrypted with `Ka` again.
pub fn retail_mac(key: &[u8; 24], padded_data: &[u8]) -> Result<[u8; 8], CryptError> {
    let tag = keyed_mac(key, padded_data)?
        .finalize()
        .into_bytes();
    let mut ret = [0u8; 8];
    ret.copy_from_slice(&tag);
    Ok(ret)
}


/// Verifies a retail MAC in constant time.
pub fn verify_retail_mac(key: &[u8; 24], padded_data: &[u8], expected_mac: &[u8]) -> Result<bool, CryptError> {
    Ok(keyed_mac(key, padded_data)?.verify_slice(expected_mac).is_ok())
}

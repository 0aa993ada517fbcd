//! Cryptographic primitives shared by the access control protocols and Secure Messaging.


pub mod tdes;


use block_padding::{Iso7816, RawPadding};
use thiserror::Error;


/// Block size of DES and 3DES in bytes.
pub const DES_BLOCK_SIZE: usize = 8;


#[derive(Clone, Copy, Debug, Eq, Error, Hash, PartialEq)]
pub enum CryptError {
    #[error("data length {length} is not a multiple of the block size {block_size}")]
    Misaligned { length: usize, block_size: usize },

    #[error("data does not end in valid ISO/IEC 9797-1 method 2 padding")]
    InvalidPadding,

    #[error("key is not {length} bytes long")]
    KeyLength { length: usize },
}


/// Appends ISO/IEC 9797-1 padding method 2 (a `0x80` byte followed by as many `0x00` bytes as
/// necessary) so that the length becomes a multiple of `block_size`.
///
/// Padding is always added, even if the data is already aligned.
pub fn pad_iso9797_m2(data: &mut Vec<u8>, block_size: usize) {
    let data_len = data.len();
    let padded_len = (data_len / block_size + 1) * block_size;
    data.resize(padded_len, 0x00);
    Iso7816::raw_pad(&mut data[data_len..], 0);
}


/// Returns a padded copy of the given data.
pub fn padded_iso9797_m2(data: &[u8], block_size: usize) -> Vec<u8> {
    let mut ret = data.to_vec();
    pad_iso9797_m2(&mut ret, block_size);
    ret
}


/// Strips ISO/IEC 9797-1 padding method 2.
pub fn unpad_iso9797_m2(data: &[u8]) -> Result<&[u8], CryptError> {
    Iso7816::raw_unpad(data)
        .map_err(|_| CryptError::InvalidPadding)
}


/// Adjusts each byte of a DES key to odd parity by modifying its least significant bit.
pub fn adjust_parity(key: &mut [u8]) {
    for b in key.iter_mut() {
        let upper = *b & 0b1111_1110;
        if upper.count_ones() % 2 == 0 {
            *b = upper | 0b0000_0001;
        } else {
            *b = upper;
        }
    }
}


pub(crate) fn ensure_aligned(data: &[u8], block_size: usize) -> Result<(), CryptError> {
    if data.len() % block_size != 0 {
        Err(CryptError::Misaligned { length: data.len(), block_size })
    } else {
        Ok(())
    }
}

//! Utility functions for Distinguished Encoding Rules.


/// Encode an ASN.1 DER primitive value length.
pub fn encode_primitive_length(output: &mut Vec<u8>, length: usize) {
    if length < 128 {
        // single-byte encoding
        output.push(length as u8);
    } else {
        // 0b1nnn_nnnn and then n additional bytes that actually specify the length
        // (big-endian)
        let length_bytes = length.to_be_bytes();
        let first_nonzero = length_bytes.iter()
            .position(|b| *b != 0x00)
            .unwrap_or(length_bytes.len() - 1);
        let trimmed_length_slice = &length_bytes[first_nonzero..];
        output.push(0b1000_0000 | trimmed_length_slice.len() as u8);
        output.extend(trimmed_length_slice);
    }
}


/// Decode an ASN.1 DER primitive value length.
///
/// The length must be at the beginning of the input slice.
///
/// Returns a tuple `(length, rest)` where `rest` is the rest of the input slice once the length has
/// been removed.
pub fn try_decode_primitive_length(input: &[u8]) -> Option<(usize, &[u8])> {
    let (&start_byte, rest) = input.split_first()?;
    let start_lower_bits = start_byte & 0b0111_1111;
    if start_byte & 0b1000_0000 != 0 {
        // multiple bytes
        let length_byte_count: usize = start_lower_bits.into();
        if length_byte_count == 0 || length_byte_count > rest.len() {
            // indefinite length, or that will never fit
            return None;
        }
        let mut length: usize = 0;
        for length_byte in &rest[..length_byte_count] {
            length = length.checked_mul(256)?
                .checked_add(usize::from(*length_byte))?;
        }
        Some((length, &rest[length_byte_count..]))
    } else {
        Some((start_lower_bits.into(), rest))
    }
}


/// Number of bytes the BER tag at the beginning of `input` occupies.
///
/// Tags whose low five bits are all set continue into subsequent bytes for as long as the top bit
/// of those bytes is set.
pub fn tag_length(input: &[u8]) -> Option<usize> {
    let first = *input.first()?;
    if first & 0b0001_1111 != 0b0001_1111 {
        return Some(1);
    }
    for (i, b) in input.iter().enumerate().skip(1) {
        if b & 0b1000_0000 == 0 {
            return Some(i + 1);
        }
    }
    None
}


/// A tag-length-value object borrowed from a larger buffer.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BorrowedTlv<'d> {
    pub tag: &'d [u8],
    pub tag_and_length: &'d [u8],
    pub value: &'d [u8],
}
impl<'d> BorrowedTlv<'d> {
    /// The tag as a number (big-endian over all tag bytes).
    pub fn tag_number(&self) -> u32 {
        self.tag.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
    }

    /// The whole object as it appeared in the buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ret = Vec::with_capacity(self.tag_and_length.len() + self.value.len());
        ret.extend_from_slice(self.tag_and_length);
        ret.extend_from_slice(self.value);
        ret
    }
}


/// Parses one TLV object from the beginning of `input`.
///
/// Returns the object and the remaining input, or `None` if the encoding is broken or the value
/// would run past the end of the input.
pub fn parse_tlv(input: &[u8]) -> Option<(BorrowedTlv<'_>, &[u8])> {
    let tag_len = tag_length(input)?;
    let (length, after_length) = try_decode_primitive_length(&input[tag_len..])?;
    if length > after_length.len() {
        return None;
    }
    let header_len = input.len() - after_length.len();
    let tlv = BorrowedTlv {
        tag: &input[..tag_len],
        tag_and_length: &input[..header_len],
        value: &after_length[..length],
    };
    Some((tlv, &after_length[length..]))
}


/// Parses a complete sequence of TLV objects.
pub fn parse_tlv_sequence(mut input: &[u8]) -> Option<Vec<BorrowedTlv<'_>>> {
    let mut ret = Vec::new();
    while !input.is_empty() {
        let (tlv, rest) = parse_tlv(input)?;
        ret.push(tlv);
        input = rest;
    }
    Some(ret)
}


/// Encodes a TLV object.
pub fn encode_tlv(output: &mut Vec<u8>, tag: &[u8], value: &[u8]) {
    output.extend_from_slice(tag);
    encode_primitive_length(output, value.len());
    output.extend_from_slice(value);
}

//! Access to ICAO 9303 electronic travel documents and contactless NFC tags.
//!
//! The passport side covers Basic Access Control, PACE with generic mapping, 3DES secure
//! messaging, chained file reads and decoding of the Logical Data Structure. The tag side
//! classifies MIFARE/NTAG/DESFire tags from their ATR, reads them technology by technology and
//! encodes/decodes NDEF. Both sides talk to hardware through [`adapter::ReaderAdapter`]
//! implementations, and [`engine::Engine`] ties card presence events to the protocols.


pub mod adapter;
pub mod bac;
pub mod config;
pub mod crypt;
pub mod der_util;
pub mod engine;
pub mod error;
pub mod iso7816;
pub mod kdf;
pub mod lds;
pub mod mrz;
pub mod pace;
pub mod passport;
pub mod presence;
pub mod secure_messaging;
pub mod tag;


pub use crate::error::{Error, ErrorKind, UnitError};


/// Renders a classic offset/hex/ASCII dump of a buffer.
///
/// Used for `trace`-level APDU logging; never pass key material.
pub fn hexdump(buf: &[u8]) -> String {
    use std::fmt::Write;

    let mut ret = String::new();
    for (line_index, line) in buf.chunks(16).enumerate() {
        let _ = write!(ret, "{:08X}  ", line_index * 16);
        for i in 0..16 {
            match line.get(i) {
                Some(b) => { let _ = write!(ret, " {:02X}", b); },
                None => ret.push_str("   "),
            }
        }
        ret.push_str(" |");
        for &b in line {
            if (b' '..=b'~').contains(&b) {
                ret.push(char::from(b));
            } else {
                ret.push('.');
            }
        }
        ret.push_str("|\n");
    }
    ret
}


#[cfg(test)]
mod tests {
    use super::hexdump;

    #[test]
    fn test_hexdump_layout() {
        let dump = hexdump(b"0106\x00\xFFabcdefghijklmn");
        let mut lines = dump.lines();
        assert_eq!(
            lines.next(),
            Some("00000000   30 31 30 36 00 FF 61 62 63 64 65 66 67 68 69 6A |0106..abcdefghij|"),
        );
        assert_eq!(
            lines.next(),
            Some("00000010   6B 6C 6D 6E                                     |klmn|"),
        );
        assert_eq!(lines.next(), None);
    }
}

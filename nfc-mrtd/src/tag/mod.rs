//! Contactless tags: classification by ATR, memory geometry and the in-memory tag model.


pub mod ndef;
pub mod reader;
pub mod writer;


use std::collections::BTreeMap;
use std::fmt;

use crate::tag::ndef::Record;


/// Key A (and B) of a MIFARE Classic sector in transport configuration.
pub const DEFAULT_KEY: [u8; 6] = [0xFF; 6];

/// Size of a MIFARE Classic block.
pub const CLASSIC_BLOCK_SIZE: usize = 16;

/// Size of a Type 2 tag page.
pub const PAGE_SIZE: usize = 4;

/// First Type 2 page holding user data.
pub const FIRST_USER_PAGE: u16 = 4;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum TagType {
    MifareClassic1K,
    MifareClassic4K,
    MifareUltralight,
    Ntag213,
    Ntag215,
    Ntag216,
    Desfire,
    Generic,

    /// Only the NDEF message is visible (Web NFC).
    Ndef,
    Unknown,
}
impl TagType {
    /// Memory size in bytes.
    pub const fn capacity(&self) -> usize {
        match self {
            Self::MifareClassic1K => 1024,
            Self::MifareClassic4K => 4096,
            Self::MifareUltralight => 64,
            Self::Ntag213 => 180,
            Self::Ntag215 => 504,
            Self::Ntag216 => 888,
            Self::Desfire => 8192,
            Self::Generic => 1024,
            Self::Ndef|Self::Unknown => 0,
        }
    }

    pub const fn technology(&self) -> Technology {
        match self {
            Self::MifareClassic1K|Self::MifareClassic4K => Technology::MifareClassic,
            Self::MifareUltralight|Self::Ntag213|Self::Ntag215|Self::Ntag216 => Technology::Type2,
            Self::Desfire => Technology::Desfire,
            Self::Generic => Technology::Generic,
            Self::Ndef => Technology::Ndef,
            Self::Unknown => Technology::Unknown,
        }
    }

    /// Number of sectors of a MIFARE Classic tag.
    pub const fn sector_count(&self) -> Option<u8> {
        match self {
            Self::MifareClassic1K => Some(16),
            Self::MifareClassic4K => Some(40),
            _ => None,
        }
    }

    /// Number of pages read from a Type 2 tag.
    pub const fn page_count(&self) -> Option<u16> {
        match self {
            Self::MifareUltralight => Some(16),
            Self::Ntag213 => Some(45),
            Self::Ntag215 => Some(135),
            Self::Ntag216 => Some(231),
            _ => None,
        }
    }

    /// First and last page of the area holding the NDEF TLV on a Type 2 tag.
    pub const fn ndef_pages(&self) -> Option<(u16, u16)> {
        match self {
            Self::MifareUltralight => Some((FIRST_USER_PAGE, 12)),
            Self::Ntag213 => Some((FIRST_USER_PAGE, 45 - 5)),
            Self::Ntag215 => Some((FIRST_USER_PAGE, 135 - 5)),
            Self::Ntag216 => Some((FIRST_USER_PAGE, 231 - 5)),
            _ => None,
        }
    }

    /// Whether the tag might be an ISO/IEC 14443-4 smart card such as an eMRTD.
    pub const fn may_be_smart_card(&self) -> bool {
        matches!(self, Self::Generic)
    }
}
impl fmt::Display for TagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MifareClassic1K => "MIFARE Classic 1K",
            Self::MifareClassic4K => "MIFARE Classic 4K",
            Self::MifareUltralight => "MIFARE Ultralight",
            Self::Ntag213 => "NTAG213",
            Self::Ntag215 => "NTAG215",
            Self::Ntag216 => "NTAG216",
            Self::Desfire => "MIFARE DESFire",
            Self::Generic => "generic ISO 14443",
            Self::Ndef => "NDEF",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}


/// How a tag is read and written.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Technology {
    /// Sectors of 16-byte blocks behind per-sector keys.
    MifareClassic,

    /// NFC Forum Type 2 (Ultralight and NTAG): 4-byte pages.
    Type2,

    /// Applications and files behind native DESFire commands.
    Desfire,

    /// 16-byte blocks without authentication.
    Generic,

    Ndef,
    Unknown,
}


/// Classifies a tag by looking for known historical bytes in its ATR.
pub fn detect_tag_type(atr: &[u8]) -> TagType {
    if atr.is_empty() {
        return TagType::Unknown;
    }

    let atr_hex = hex::encode_upper(atr);
    if atr_hex.contains("F011") {
        TagType::Ntag213
    } else if atr_hex.contains("F012") {
        TagType::Ntag215
    } else if atr_hex.contains("F013") {
        TagType::Ntag216
    } else if atr_hex.contains("0044") {
        TagType::MifareUltralight
    } else if atr_hex.contains("4403") {
        TagType::Desfire
    } else if let Some(position) = atr_hex.find("0003") {
        if atr_hex.get(position + 4..position + 6) == Some("18") {
            TagType::MifareClassic4K
        } else {
            TagType::MifareClassic1K
        }
    } else {
        TagType::Generic
    }
}


/// Sector of a MIFARE Classic block.
pub const fn sector_of_block(block: u16) -> u8 {
    if block < 128 {
        (block / 4) as u8
    } else {
        (32 + (block - 128) / 16) as u8
    }
}

/// First block of a MIFARE Classic sector; sectors from 32 on are 16 blocks long.
pub const fn sector_first_block(sector: u8) -> u16 {
    if sector < 32 {
        sector as u16 * 4
    } else {
        128 + (sector as u16 - 32) * 16
    }
}

pub const fn sector_block_count(sector: u8) -> u16 {
    if sector < 32 { 4 } else { 16 }
}

/// Whether the block holds the keys and access bits of its sector.
pub const fn is_sector_trailer(block: u16) -> bool {
    let sector = sector_of_block(block);
    block == sector_first_block(sector) + sector_block_count(sector) - 1
}


/// A tag in the field, as far as it has been read.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NfcTag {
    pub uid: Vec<u8>,
    pub atr: Vec<u8>,
    pub tag_type: TagType,

    /// Memory size in bytes.
    pub capacity: usize,

    /// Block or page number to its contents; absent entries were not read or failed.
    pub blocks: BTreeMap<u16, Vec<u8>>,

    pub is_writable: bool,
    pub is_locked: bool,
    pub ndef_records: Option<Vec<Record>>,
}
impl NfcTag {
    /// A tag classified from its ATR.
    pub fn new(uid: Vec<u8>, atr: Vec<u8>) -> Self {
        let tag_type = detect_tag_type(&atr);
        Self::with_type(uid, atr, tag_type)
    }

    /// A tag whose type is reported by the reader itself.
    pub fn with_type(uid: Vec<u8>, atr: Vec<u8>, tag_type: TagType) -> Self {
        Self {
            uid,
            atr,
            tag_type,
            capacity: tag_type.capacity(),
            blocks: BTreeMap::new(),
            is_writable: tag_type != TagType::Unknown,
            is_locked: false,
            ndef_records: None,
        }
    }

    pub fn uid_hex(&self) -> String {
        hex::encode_upper(&self.uid)
    }

    pub fn technology(&self) -> Technology {
        self.tag_type.technology()
    }
}


/// Renders bytes as ASCII, replacing non-printable characters with dots.
pub fn to_ascii(bytes: &[u8]) -> String {
    bytes.iter()
        .map(|&b| if (b' '..=b'~').contains(&b) { char::from(b) } else { '.' })
        .collect()
}


#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use super::*;

    #[test]
    fn test_detect() {
        assert_eq!(detect_tag_type(&[]), TagType::Unknown);
        assert_eq!(detect_tag_type(&hex!("3B8F8001804F0CA0000003060300010000000000")), TagType::MifareClassic1K);
        assert_eq!(detect_tag_type(&hex!("3B 8F 00 03 18 00 02")), TagType::MifareClassic4K);
        assert_eq!(detect_tag_type(&hex!("3B8F8001804F0CA00000030603F0110000000000")), TagType::Ntag213);
        assert_eq!(detect_tag_type(&hex!("3B8F8001804F0CA00000030603F0120000000000")), TagType::Ntag215);
        assert_eq!(detect_tag_type(&hex!("3B8F8001804F0CA00000030603F0130000000000")), TagType::Ntag216);
        assert_eq!(detect_tag_type(&hex!("3B8180018080")), TagType::Generic);
        assert_eq!(detect_tag_type(&hex!("3B 81 80 01 80 44 03")), TagType::Desfire);
        assert_eq!(detect_tag_type(&hex!("3B 00 44 00")), TagType::MifareUltralight);
    }

    #[test]
    fn test_capacities() {
        assert_eq!(TagType::MifareClassic1K.capacity(), 1024);
        assert_eq!(TagType::Ntag215.capacity(), 504);
        assert_eq!(TagType::Desfire.capacity(), 8192);
        assert_eq!(TagType::Unknown.capacity(), 0);
        assert_eq!(TagType::Ndef.technology(), Technology::Ndef);
        assert_eq!(TagType::Ntag216.technology(), Technology::Type2);
    }

    #[test]
    fn test_classic_geometry() {
        assert_eq!(sector_first_block(1), 4);
        assert_eq!(sector_first_block(32), 128);
        assert_eq!(sector_first_block(39), 240);
        assert_eq!(sector_of_block(143), 32);
        assert_eq!(sector_of_block(144), 33);
        assert!(is_sector_trailer(3));
        assert!(!is_sector_trailer(4));
        assert!(is_sector_trailer(127));
        assert!(!is_sector_trailer(131));
        assert!(is_sector_trailer(143));
        assert!(is_sector_trailer(255));
    }

    #[test]
    fn test_ascii() {
        assert_eq!(to_ascii(b"ab\x00\x7F~"), "ab..~");
    }
}

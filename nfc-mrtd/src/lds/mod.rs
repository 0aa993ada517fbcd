//! Decoding of the Logical Data Structure: EF.COM, EF.SOD and the data groups.


pub mod biometrics;


use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use digest::Digest;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::der_util::{parse_tlv, parse_tlv_sequence};
use crate::lds::biometrics::{Fingerprint, ImageData, PublicKeyInfo};
use crate::mrz::MrzData;


/// File identifier of EF.COM.
pub const EF_COM: u16 = 0x011E;

/// File identifier of EF.SOD.
pub const EF_SOD: u16 = 0x011D;

/// Highest data group number.
pub const MAX_DATA_GROUP: u8 = 16;


#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum Error {
    #[error("TLV object at offset {offset} is truncated or malformed")]
    Tlv { offset: usize },

    #[error("expected tag 0x{expected:02X}, found 0x{found:02X}")]
    UnexpectedTag { expected: u8, found: u8 },

    #[error("data group number {number} is outside 1..=16")]
    InvalidDataGroupNumber { number: u8 },

    #[error("fingerprint record {index} runs past the end of the data")]
    FingerprintTruncated { index: usize },

    #[error("text is not valid UTF-8")]
    Utf8,
}


/// The name of a data group.
pub fn data_group_name(number: u8) -> Option<&'static str> {
    let name = match number {
        1 => "MRZ",
        2 => "Face",
        3 => "Fingerprints",
        4 => "Iris",
        5 => "Portrait",
        6 => "Reserved",
        7 => "Signature",
        8 => "DataFeatures",
        9 => "StructureFeatures",
        10 => "SubstanceFeatures",
        11 => "AdditionalPersonalDetails",
        12 => "AdditionalDocumentDetails",
        13 => "OptionalDetails",
        14 => "SecurityOptions",
        15 => "ActiveAuthentication",
        16 => "PersonsToNotify",
        _ => return None,
    };
    Some(name)
}


/// The elementary file identifier of a data group.
pub fn file_id(number: u8) -> Option<u16> {
    if (1..=MAX_DATA_GROUP).contains(&number) {
        Some(0x0100 + u16::from(number))
    } else {
        None
    }
}


/// The data group number announced by a tag in the EF.COM tag list.
pub fn data_group_from_tag(tag: u8) -> Option<u8> {
    match tag {
        0x61 => Some(1),
        0x75 => Some(2),
        0x63 => Some(3),
        0x76 => Some(4),
        0x65..=0x70 => Some(tag - 0x60),
        _ => None,
    }
}


/// The tag a data group is announced with in EF.COM.
pub fn data_group_tag(number: u8) -> Option<u8> {
    match number {
        1 => Some(0x61),
        2 => Some(0x75),
        3 => Some(0x63),
        4 => Some(0x76),
        5..=MAX_DATA_GROUP => Some(0x60 + number),
        _ => None,
    }
}


/// Unwraps the application-class template around an LDS file and, if the template directly
/// contains a `5F xx` object, that object too.
///
/// Data that does not start with an application-class constructed tag is returned unchanged.
pub fn extract_content(raw: &[u8]) -> Result<&[u8], Error> {
    let Some(&first) = raw.first() else {
        return Ok(raw);
    };
    if first & 0b1110_0000 != 0b0110_0000 {
        return Ok(raw);
    }

    let (outer, _rest) = parse_tlv(raw)
        .ok_or(Error::Tlv { offset: 0 })?;
    if outer.value.first() != Some(&0x5F) {
        return Ok(outer.value);
    }
    let (inner, _rest) = parse_tlv(outer.value)
        .ok_or(Error::Tlv { offset: outer.tag_and_length.len() })?;
    Ok(inner.value)
}


/// The decoded contents of a data group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DataGroupContent {
    /// DG1 with a machine-readable zone that parsed and validated.
    Mrz(MrzData),

    /// DG1 whose text could not be interpreted as a valid MRZ.
    UnrecognizedMrz(String),

    /// DG2: the encoded face.
    Face { biometric_type: u8, biometric_subtype: u8, image: ImageData },

    /// DG3: the encoded fingerprints.
    Fingerprints(Vec<Fingerprint>),

    /// DG5: the displayed portrait.
    Portrait(ImageData),

    /// DG7: the displayed signature.
    Signature(ImageData),

    /// DG11 and DG12: `key: value` lines.
    Text { fields: BTreeMap<String, String>, raw: String },

    /// DG14 as hex.
    SecurityOptions(String),

    /// DG15: the Active Authentication public key.
    PublicKey(PublicKeyInfo),

    /// Any other data group as hex.
    Raw(String),
}


/// A data group read from the chip.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataGroup {
    pub number: u8,
    pub name: &'static str,
    pub raw: Vec<u8>,
    pub content: DataGroupContent,
}


/// Decodes a data group.
pub fn parse_data_group(number: u8, raw: &[u8]) -> Result<DataGroup, Error> {
    let name = data_group_name(number)
        .ok_or(Error::InvalidDataGroupNumber { number })?;
    let content = extract_content(raw)?;

    let parsed = match number {
        1 => parse_mrz(content),
        2 => DataGroupContent::Face {
            biometric_type: content.first().copied().unwrap_or(0),
            biometric_subtype: content.get(1).copied().unwrap_or(0),
            image: ImageData::find_jpeg(content),
        },
        3 => DataGroupContent::Fingerprints(biometrics::parse_fingerprints(content)?),
        5 => DataGroupContent::Portrait(ImageData::find_jpeg(content)),
        7 => DataGroupContent::Signature(ImageData::find_jpeg(content)),
        11|12 => parse_text(content)?,
        14 => DataGroupContent::SecurityOptions(hex::encode_upper(content)),
        15 => DataGroupContent::PublicKey(PublicKeyInfo::find(content)),
        _ => DataGroupContent::Raw(hex::encode_upper(content)),
    };
    debug!("parsed DG{} ({}), {} bytes", number, name, raw.len());

    Ok(DataGroup {
        number,
        name,
        raw: raw.to_vec(),
        content: parsed,
    })
}


fn parse_mrz(content: &[u8]) -> DataGroupContent {
    let text = String::from_utf8_lossy(content);
    match MrzData::parse(text.trim()) {
        Ok(mrz) => DataGroupContent::Mrz(mrz),
        Err(e) => {
            debug!("DG1 does not contain a valid MRZ: {}", e);
            DataGroupContent::UnrecognizedMrz(text.into_owned())
        },
    }
}


fn parse_text(content: &[u8]) -> Result<DataGroupContent, Error> {
    let raw = std::str::from_utf8(content)
        .map_err(|_| Error::Utf8)?;
    let mut fields = BTreeMap::new();
    for line in raw.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if !key.is_empty() && !value.is_empty() {
            fields.insert(key.to_owned(), value.to_owned());
        }
    }
    Ok(DataGroupContent::Text { fields, raw: raw.to_owned() })
}


/// The contents of EF.COM.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Com {
    pub lds_version: Option<String>,
    pub unicode_version: Option<String>,
    pub data_groups: Vec<u8>,
}


/// Decodes EF.COM.
pub fn parse_com(raw: &[u8]) -> Result<Com, Error> {
    let (outer, _rest) = parse_tlv(raw)
        .ok_or(Error::Tlv { offset: 0 })?;
    if outer.tag != [0x60] {
        return Err(Error::UnexpectedTag { expected: 0x60, found: outer.tag[0] });
    }
    let objects = parse_tlv_sequence(outer.value)
        .ok_or(Error::Tlv { offset: outer.tag_and_length.len() })?;

    let mut com = Com::default();
    for object in objects {
        match object.tag {
            [0x5F, 0x01] => com.lds_version = Some(String::from_utf8_lossy(object.value).into_owned()),
            [0x5F, 0x36] => com.unicode_version = Some(String::from_utf8_lossy(object.value).into_owned()),
            [0x5C] => {
                com.data_groups = object.value.iter()
                    .filter_map(|tag| data_group_from_tag(*tag))
                    .collect();
            },
            _ => {},
        }
    }
    Ok(com)
}


/// What is known about EF.SOD without verifying its signature.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SecurityObject {
    pub content_length: usize,

    /// SHA-256 of the content, as uppercase hex.
    pub sha256: String,

    /// The raw file encoded in base64.
    pub data_base64: String,

    /// Always `false`: the signature and certificate chain are not checked.
    pub signature_verified: bool,
}


/// Summarizes EF.SOD.
pub fn parse_sod(raw: &[u8]) -> Result<SecurityObject, Error> {
    let content = extract_content(raw)?;
    Ok(SecurityObject {
        content_length: content.len(),
        sha256: hex::encode_upper(Sha256::digest(content)),
        data_base64: STANDARD.encode(raw),
        signature_verified: false,
    })
}

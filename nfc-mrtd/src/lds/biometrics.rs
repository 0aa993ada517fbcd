//! Images, fingerprints and keys embedded in data groups.


use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::lds::Error;


const JPEG_START: [u8; 2] = [0xFF, 0xD8];
const DER_SEQUENCE_LONG: [u8; 2] = [0x30, 0x82];


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ImageFormat {
    Jpeg,
    Unknown,
}


/// An image found in a data group.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ImageData {
    pub format: ImageFormat,

    /// The image encoded in base64, if one was found.
    pub data_base64: Option<String>,

    /// Size of the image in bytes; zero if none was found.
    pub size: usize,
}
impl ImageData {
    /// Takes everything from the first JPEG start-of-image marker onward.
    pub fn find_jpeg(content: &[u8]) -> Self {
        match find(content, &JPEG_START) {
            Some(start) => {
                let image = &content[start..];
                Self {
                    format: ImageFormat::Jpeg,
                    data_base64: Some(STANDARD.encode(image)),
                    size: image.len(),
                }
            },
            None => Self {
                format: ImageFormat::Unknown,
                data_base64: None,
                size: 0,
            },
        }
    }
}


#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Fingerprint {
    pub position: u8,
    pub view_number: u8,
    pub impression_type: u8,
    pub quality: u8,
    pub image_base64: String,
}


/// Decodes the fingerprint records of DG3.
///
/// The content starts with the number of records; each record is a big-endian 16-bit length
/// followed by position, view number, impression type, quality and the image.
pub fn parse_fingerprints(content: &[u8]) -> Result<Vec<Fingerprint>, Error> {
    let Some((&count, mut rest)) = content.split_first() else {
        return Ok(Vec::new());
    };

    let mut ret = Vec::with_capacity(usize::from(count));
    for index in 0..usize::from(count) {
        if rest.len() < 2 {
            return Err(Error::FingerprintTruncated { index });
        }
        let length = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
        if length < 4 || rest.len() < 2 + length {
            return Err(Error::FingerprintTruncated { index });
        }
        let record = &rest[2..2 + length];
        ret.push(Fingerprint {
            position: record[0],
            view_number: record[1],
            impression_type: record[2],
            quality: record[3],
            image_base64: STANDARD.encode(&record[4..]),
        });
        rest = &rest[2 + length..];
    }
    Ok(ret)
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum KeyFormat {
    /// A DER `SubjectPublicKeyInfo`.
    Der,

    /// No recognizable structure; the whole content is kept.
    Unknown,
}


/// The Active Authentication public key from DG15.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PublicKeyInfo {
    pub format: KeyFormat,
    pub data_base64: String,
    pub length: usize,
}
impl PublicKeyInfo {
    /// Looks for the first DER sequence with a two-byte length.
    pub fn find(content: &[u8]) -> Self {
        if let Some(start) = find(content, &DER_SEQUENCE_LONG) {
            if let Some(length_bytes) = content.get(start + 2..start + 4) {
                let length = usize::from(u16::from_be_bytes([length_bytes[0], length_bytes[1]])) + 4;
                if let Some(key) = content.get(start..start + length) {
                    return Self {
                        format: KeyFormat::Der,
                        data_base64: STANDARD.encode(key),
                        length,
                    };
                }
            }
        }
        Self {
            format: KeyFormat::Unknown,
            data_base64: STANDARD.encode(content),
            length: content.len(),
        }
    }
}


fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len())
        .position(|window| window == needle)
}

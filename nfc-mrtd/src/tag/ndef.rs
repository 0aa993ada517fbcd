//! NFC Data Exchange Format messages and the Type 2 tag TLV wrapping around them.


use std::fmt;

use thiserror::Error;
use tracing::warn;


const FLAG_MESSAGE_BEGIN: u8 = 0x80;
const FLAG_MESSAGE_END: u8 = 0x40;
const FLAG_CHUNK: u8 = 0x20;
const FLAG_SHORT_RECORD: u8 = 0x10;
const FLAG_ID_LENGTH: u8 = 0x08;
const TNF_MASK: u8 = 0x07;

const TLV_NULL: u8 = 0x00;
const TLV_LOCK_CONTROL: u8 = 0x01;
const TLV_MEMORY_CONTROL: u8 = 0x02;
const TLV_NDEF_MESSAGE: u8 = 0x03;
const TLV_TERMINATOR: u8 = 0xFE;

const TEXT_UTF16: u8 = 0x80;
const TEXT_LANGUAGE_LENGTH_MASK: u8 = 0x3F;

/// URI identifier codes of the NFC Forum URI record type; the index is the code.
const URI_PREFIXES: [&str; 36] = [
    "",
    "http://www.",
    "https://www.",
    "http://",
    "https://",
    "tel:",
    "mailto:",
    "ftp://anonymous:anonymous@",
    "ftp://ftp.",
    "ftps://",
    "sftp://",
    "smb://",
    "nfs://",
    "ftp://",
    "dav://",
    "news:",
    "telnet://",
    "imap:",
    "rtsp://",
    "urn:",
    "pop:",
    "sip:",
    "sips:",
    "tftp:",
    "btspp://",
    "btl2cap://",
    "btgoep://",
    "tcpobex://",
    "irdaobex://",
    "file://",
    "urn:epc:id:",
    "urn:epc:tag:",
    "urn:epc:pat:",
    "urn:epc:raw:",
    "urn:epc:",
    "urn:nfc:",
];


#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum Error {
    #[error("record {index} is truncated")]
    Truncated { index: usize },

    #[error("first record does not carry the message-begin flag")]
    MissingMessageBegin,

    #[error("message ends without a record carrying the message-end flag")]
    MissingMessageEnd,

    #[error("record {index} is chunked; chunked records are not supported")]
    Chunked { index: usize },

    #[error("no NDEF message TLV found")]
    NoMessage,

    #[error("TLV at offset {offset} is truncated")]
    TlvTruncated { offset: usize },

    #[error("{field} is too long ({length} bytes)")]
    TooLong { field: &'static str, length: usize },

    #[error("malformed {record_type} record payload")]
    MalformedPayload { record_type: &'static str },
}


/// Type Name Format, the three low bits of a record header.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Tnf {
    Empty,
    WellKnown,
    Media,
    AbsoluteUri,
    External,
    Unknown,
    Unchanged,
    Reserved,
}
impl Tnf {
    pub const fn from_bits(bits: u8) -> Self {
        match bits & TNF_MASK {
            0 => Self::Empty,
            1 => Self::WellKnown,
            2 => Self::Media,
            3 => Self::AbsoluteUri,
            4 => Self::External,
            5 => Self::Unknown,
            6 => Self::Unchanged,
            _ => Self::Reserved,
        }
    }

    pub const fn to_bits(self) -> u8 {
        match self {
            Self::Empty => 0,
            Self::WellKnown => 1,
            Self::Media => 2,
            Self::AbsoluteUri => 3,
            Self::External => 4,
            Self::Unknown => 5,
            Self::Unchanged => 6,
            Self::Reserved => 7,
        }
    }
}


#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Record {
    pub tnf: Tnf,
    pub record_type: Vec<u8>,
    pub id: Vec<u8>,
    pub payload: Vec<u8>,
}
impl Record {
    pub fn new(tnf: Tnf, record_type: &[u8], payload: Vec<u8>) -> Self {
        Self {
            tnf,
            record_type: record_type.to_vec(),
            id: Vec::new(),
            payload,
        }
    }

    /// A well-known URI record, abbreviating the longest known prefix.
    pub fn uri(uri: &str) -> Self {
        let (code, prefix) = URI_PREFIXES.iter()
            .enumerate()
            .skip(1)
            .filter(|(_, prefix)| uri.starts_with(**prefix))
            .max_by_key(|(_, prefix)| prefix.len())
            .map(|(code, prefix)| (code, prefix.len()))
            .unwrap_or((0, 0));

        let mut payload = Vec::with_capacity(1 + uri.len() - prefix);
        // code < URI_PREFIXES.len() <= 0xFF
        payload.push(code as u8);
        payload.extend_from_slice(uri[prefix..].as_bytes());
        Self::new(Tnf::WellKnown, b"U", payload)
    }

    /// A well-known text record encoded as UTF-8.
    pub fn text(text: &str, language: &str) -> Result<Self, Error> {
        let language = language.as_bytes();
        if language.len() > usize::from(TEXT_LANGUAGE_LENGTH_MASK) {
            return Err(Error::TooLong { field: "language code", length: language.len() });
        }

        let mut payload = Vec::with_capacity(1 + language.len() + text.len());
        // checked against the mask above
        payload.push(language.len() as u8);
        payload.extend_from_slice(language);
        payload.extend_from_slice(text.as_bytes());
        Ok(Self::new(Tnf::WellKnown, b"T", payload))
    }

    pub fn is_well_known(&self, record_type: &[u8]) -> bool {
        self.tnf == Tnf::WellKnown && self.record_type == record_type
    }

    /// Interprets the payload of URI and text records.
    pub fn value(&self) -> Result<RecordValue, Error> {
        if self.is_well_known(b"U") {
            let Some((&code, rest)) = self.payload.split_first() else {
                return Err(Error::MalformedPayload { record_type: "URI" });
            };
            let prefix = URI_PREFIXES.get(usize::from(code)).copied().unwrap_or_else(|| {
                warn!("unknown URI identifier code 0x{:02X}", code);
                ""
            });
            let rest = std::str::from_utf8(rest)
                .map_err(|_| Error::MalformedPayload { record_type: "URI" })?;
            Ok(RecordValue::Uri(format!("{}{}", prefix, rest)))
        } else if self.is_well_known(b"T") {
            let Some((&status, rest)) = self.payload.split_first() else {
                return Err(Error::MalformedPayload { record_type: "text" });
            };
            let language_length = usize::from(status & TEXT_LANGUAGE_LENGTH_MASK);
            if rest.len() < language_length {
                return Err(Error::MalformedPayload { record_type: "text" });
            }
            let (language, text) = rest.split_at(language_length);
            let language = String::from_utf8_lossy(language).into_owned();
            let text = if status & TEXT_UTF16 != 0 {
                decode_utf16(text)?
            } else {
                std::str::from_utf8(text)
                    .map_err(|_| Error::MalformedPayload { record_type: "text" })?
                    .to_owned()
            };
            Ok(RecordValue::Text { text, language })
        } else {
            Ok(RecordValue::Other(hex::encode_upper(&self.payload)))
        }
    }
}


/// The meaning of a record, as far as it is understood.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum RecordValue {
    Uri(String),
    Text { text: String, language: String },

    /// Any other record; the payload in hex.
    Other(String),
}
impl fmt::Display for RecordValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uri(uri) => write!(f, "URI {}", uri),
            Self::Text { text, language } => write!(f, "text [{}] {}", language, text),
            Self::Other(payload) => write!(f, "data {}", payload),
        }
    }
}


fn decode_utf16(bytes: &[u8]) -> Result<String, Error> {
    if bytes.len() % 2 != 0 {
        return Err(Error::MalformedPayload { record_type: "text" });
    }
    let (little_endian, bytes) = match bytes {
        [0xFF, 0xFE, rest @ ..] => (true, rest),
        [0xFE, 0xFF, rest @ ..] => (false, rest),
        _ => (false, bytes),
    };
    let units = bytes.chunks_exact(2)
        .map(|pair| if little_endian {
            u16::from_le_bytes([pair[0], pair[1]])
        } else {
            u16::from_be_bytes([pair[0], pair[1]])
        });
    char::decode_utf16(units)
        .collect::<Result<String, _>>()
        .map_err(|_| Error::MalformedPayload { record_type: "text" })
}


/// Decodes an NDEF message. An empty buffer is an empty message.
pub fn decode_message(bytes: &[u8]) -> Result<Vec<Record>, Error> {
    let mut records = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let index = records.len();
        let truncated = Error::Truncated { index };

        let flags = rest[0];
        if index == 0 && flags & FLAG_MESSAGE_BEGIN == 0 {
            return Err(Error::MissingMessageBegin);
        }
        if flags & FLAG_CHUNK != 0 {
            return Err(Error::Chunked { index });
        }

        let type_length = usize::from(*rest.get(1).ok_or(truncated.clone())?);
        let mut pos = 2;
        let payload_length = if flags & FLAG_SHORT_RECORD != 0 {
            let length = *rest.get(pos).ok_or(truncated.clone())?;
            pos += 1;
            usize::from(length)
        } else {
            let length_bytes = rest.get(pos..pos + 4).ok_or(truncated.clone())?;
            pos += 4;
            let length = u32::from_be_bytes([length_bytes[0], length_bytes[1], length_bytes[2], length_bytes[3]]);
            usize::try_from(length).map_err(|_| truncated.clone())?
        };
        let id_length = if flags & FLAG_ID_LENGTH != 0 {
            let length = *rest.get(pos).ok_or(truncated.clone())?;
            pos += 1;
            usize::from(length)
        } else {
            0
        };

        let body_length = type_length
            .checked_add(id_length)
            .and_then(|l| l.checked_add(payload_length))
            .ok_or(truncated.clone())?;
        let body = rest.get(pos..pos + body_length).ok_or(truncated)?;
        let (record_type, body) = body.split_at(type_length);
        let (id, payload) = body.split_at(id_length);
        records.push(Record {
            tnf: Tnf::from_bits(flags),
            record_type: record_type.to_vec(),
            id: id.to_vec(),
            payload: payload.to_vec(),
        });
        rest = &rest[pos + body_length..];

        if flags & FLAG_MESSAGE_END != 0 {
            if !rest.is_empty() {
                warn!("ignoring {} bytes after the end of the NDEF message", rest.len());
            }
            return Ok(records);
        }
    }

    if records.is_empty() {
        Ok(records)
    } else {
        Err(Error::MissingMessageEnd)
    }
}


/// Encodes records as one NDEF message, using short records where the payload allows.
pub fn encode_message(records: &[Record]) -> Result<Vec<u8>, Error> {
    let mut ret = Vec::new();
    for (index, record) in records.iter().enumerate() {
        let type_length = u8::try_from(record.record_type.len())
            .map_err(|_| Error::TooLong { field: "record type", length: record.record_type.len() })?;
        let id_length = u8::try_from(record.id.len())
            .map_err(|_| Error::TooLong { field: "record ID", length: record.id.len() })?;
        let payload_length = u32::try_from(record.payload.len())
            .map_err(|_| Error::TooLong { field: "payload", length: record.payload.len() })?;

        let mut flags = record.tnf.to_bits();
        if index == 0 {
            flags |= FLAG_MESSAGE_BEGIN;
        }
        if index == records.len() - 1 {
            flags |= FLAG_MESSAGE_END;
        }
        let short_length = u8::try_from(payload_length).ok();
        if short_length.is_some() {
            flags |= FLAG_SHORT_RECORD;
        }
        if id_length > 0 {
            flags |= FLAG_ID_LENGTH;
        }

        ret.push(flags);
        ret.push(type_length);
        match short_length {
            Some(length) => ret.push(length),
            None => ret.extend_from_slice(&payload_length.to_be_bytes()),
        }
        if id_length > 0 {
            ret.push(id_length);
        }
        ret.extend_from_slice(&record.record_type);
        ret.extend_from_slice(&record.id);
        ret.extend_from_slice(&record.payload);
    }
    Ok(ret)
}


/// Wraps an NDEF message into an NDEF message TLV followed by a terminator TLV.
pub fn wrap_tlv(message: &[u8]) -> Result<Vec<u8>, Error> {
    let mut ret = Vec::with_capacity(message.len() + 5);
    ret.push(TLV_NDEF_MESSAGE);
    if message.len() < 0xFF {
        // checked just now
        ret.push(message.len() as u8);
    } else {
        let length = u16::try_from(message.len())
            .map_err(|_| Error::TooLong { field: "NDEF message", length: message.len() })?;
        ret.push(0xFF);
        ret.extend_from_slice(&length.to_be_bytes());
    }
    ret.extend_from_slice(message);
    ret.push(TLV_TERMINATOR);
    Ok(ret)
}


/// Finds the NDEF message TLV in the data area of a Type 2 tag, skipping control TLVs.
pub fn unwrap_tlv(area: &[u8]) -> Result<&[u8], Error> {
    let mut offset = 0;
    while offset < area.len() {
        let tag = area[offset];
        match tag {
            TLV_NULL => {
                offset += 1;
                continue;
            },
            TLV_TERMINATOR => return Err(Error::NoMessage),
            _ => {},
        }

        let truncated = Error::TlvTruncated { offset };
        let (length, value_offset) = match *area.get(offset + 1).ok_or(truncated.clone())? {
            0xFF => {
                let bytes = area.get(offset + 2..offset + 4).ok_or(truncated.clone())?;
                (usize::from(u16::from_be_bytes([bytes[0], bytes[1]])), offset + 4)
            },
            short => (usize::from(short), offset + 2),
        };
        let value = area.get(value_offset..value_offset + length).ok_or(truncated)?;

        match tag {
            TLV_NDEF_MESSAGE => return Ok(value),
            TLV_LOCK_CONTROL|TLV_MEMORY_CONTROL => {},
            other => warn!("skipping unknown TLV 0x{:02X} at offset {}", other, offset),
        }
        offset = value_offset + length;
    }
    Err(Error::NoMessage)
}

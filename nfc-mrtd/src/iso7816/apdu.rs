//! Structures related to application protocol data units (APDUs).


use std::fmt;
use std::io::{self, Write};

use thiserror::Error;


/// Largest request data length expressible in a short APDU.
pub const SHORT_MAX_DATA: usize = 255;

/// Largest request data length expressible in an extended APDU.
pub const EXTENDED_MAX_DATA: usize = 65535;


#[derive(Debug, Error)]
pub enum WriteError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("data is, but must not be, empty")]
    EmptyData,

    #[error("too much data: obtained {obtained} bytes, expected maximum {maximum} bytes")]
    DataTooLong { maximum: usize, obtained: usize },
}


#[derive(Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CommandHeader {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
}
impl CommandHeader {
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self { cla, ins, p1, p2 }
    }

    pub const fn to_bytes(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    pub const fn to_be_u32(&self) -> u32 {
        u32::from_be_bytes(self.to_bytes())
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }
}
impl fmt::Debug for CommandHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CommandHeader {} cla: 0x{:02X}, ins: 0x{:02X}, p1: 0x{:02X}, p2: 0x{:02X} {}",
            '{', self.cla, self.ins, self.p1, self.p2, '}',
        )
    }
}

#[derive(Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ResponseTrailer {
    pub sw1: u8,
    pub sw2: u8,
}
impl ResponseTrailer {
    /// `90 00`, normal processing.
    pub const SUCCESS: Self = Self::new(0x90, 0x00);

    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self {
            sw1,
            sw2,
        }
    }

    pub const fn from_word(word: u16) -> Self {
        let bytes = word.to_be_bytes();
        Self::new(bytes[0], bytes[1])
    }

    pub const fn to_bytes(&self) -> [u8; 2] {
        [self.sw1, self.sw2]
    }

    pub const fn to_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    pub const fn is_success(&self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }
}
impl fmt::Debug for ResponseTrailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseTrailer {} sw1: 0x{:02X}, sw2: 0x{:02X} {}", '{', self.sw1, self.sw2, '}')
    }
}


/// The body of a command APDU.
///
/// A stored `response_data_length` of zero means "as much as possible" (256 for short APDUs,
/// 65536 for extended APDUs), matching the wire encoding.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Data {
    NoData,
    RequestDataShort {
        request_data: Vec<u8>,
    },
    RequestDataExtended {
        request_data: Vec<u8>,
    },
    ResponseDataShort {
        response_data_length: u8,
    },
    ResponseDataExtended {
        response_data_length: u16,
    },
    BothDataShort {
        request_data: Vec<u8>,
        response_data_length: u8,
    },
    BothDataExtended {
        request_data: Vec<u8>,
        response_data_length: u16,
    },
}
impl Data {
    /// The number of response bytes the command asks for, if it asks for any.
    pub fn response_data_length(&self) -> Option<usize> {
        match self {
            Self::NoData|Self::RequestDataShort { .. }|Self::RequestDataExtended { .. } => None,
            Self::ResponseDataShort { response_data_length }|Self::BothDataShort { response_data_length, .. } => {
                if *response_data_length == 0 {
                    Some(0x100)
                } else {
                    Some(usize::from(*response_data_length))
                }
            },
            Self::ResponseDataExtended { response_data_length }|Self::BothDataExtended { response_data_length, .. } => {
                if *response_data_length == 0 {
                    Some(0x10000)
                } else {
                    Some(usize::from(*response_data_length))
                }
            },
        }
    }

    pub fn request_data(&self) -> Option<&[u8]> {
        match self {
            Self::NoData => None,
            Self::RequestDataShort { request_data } => Some(request_data.as_slice()),
            Self::RequestDataExtended { request_data } => Some(request_data.as_slice()),
            Self::ResponseDataShort { .. } => None,
            Self::ResponseDataExtended { .. } => None,
            Self::BothDataShort { request_data, .. } => Some(request_data.as_slice()),
            Self::BothDataExtended { request_data, .. } => Some(request_data.as_slice()),
        }
    }

    pub const fn is_extended(&self) -> bool {
        matches!(
            self,
            Self::RequestDataExtended { .. } | Self::ResponseDataExtended { .. } | Self::BothDataExtended { .. }
        )
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        fn ensure_length(request_data: &[u8], max_length: usize) -> Result<(), WriteError> {
            if request_data.is_empty() {
                Err(WriteError::EmptyData)
            } else if request_data.len() > max_length {
                Err(WriteError::DataTooLong { maximum: max_length, obtained: request_data.len() })
            } else {
                Ok(())
            }
        }

        match self {
            // "case" refers to the cases in ISO/IEC 7816-3:2006 § 12.1.3
            Data::NoData => {
                // case 1
                Ok(())
            },
            Data::RequestDataShort { request_data } => {
                // case 3S
                ensure_length(request_data, SHORT_MAX_DATA)?;

                // [Lc] [Data]
                writer.write_all(&[request_data.len() as u8])?;
                writer.write_all(request_data)?;
                Ok(())
            },
            Data::RequestDataExtended { request_data } => {
                // case 3E
                ensure_length(request_data, EXTENDED_MAX_DATA)?;
                let length_bytes = (request_data.len() as u16).to_be_bytes();

                // [0x00] [LcMSB] [LcLSB] [Data]
                writer.write_all(&[0x00, length_bytes[0], length_bytes[1]])?;
                writer.write_all(request_data)?;
                Ok(())
            },
            Data::ResponseDataShort { response_data_length } => {
                // case 2S
                // [Le]
                writer.write_all(&[*response_data_length])?;
                Ok(())
            },
            Data::ResponseDataExtended { response_data_length } => {
                // case 2E
                // [0x00] [LeMSB] [LeLSB]
                let length_bytes = response_data_length.to_be_bytes();
                writer.write_all(&[0x00, length_bytes[0], length_bytes[1]])?;
                Ok(())
            },
            Data::BothDataShort { request_data, response_data_length } => {
                // case 4S
                ensure_length(request_data, SHORT_MAX_DATA)?;

                // [Lc] [Data] [Le]
                writer.write_all(&[request_data.len() as u8])?;
                writer.write_all(request_data)?;
                writer.write_all(&[*response_data_length])?;
                Ok(())
            },
            Data::BothDataExtended { request_data, response_data_length } => {
                // case 4E
                ensure_length(request_data, EXTENDED_MAX_DATA)?;
                let request_length_bytes = (request_data.len() as u16).to_be_bytes();
                let response_length_bytes = response_data_length.to_be_bytes();

                // [0x00] [LcMSB] [LcLSB] [Data] [LeMSB] [LeLSB]
                writer.write_all(&[0x00, request_length_bytes[0], request_length_bytes[1]])?;
                writer.write_all(request_data)?;
                writer.write_all(&response_length_bytes)?;
                Ok(())
            },
        }
    }

    /// Decodes the part of a command APDU that follows the header.
    ///
    /// Returns `None` if the length fields do not agree with the number of bytes present.
    pub fn from_body(body: &[u8]) -> Option<Self> {
        match body.len() {
            0 => return Some(Self::NoData),
            1 => return Some(Self::ResponseDataShort { response_data_length: body[0] }),
            _ => {},
        }

        if body[0] != 0x00 {
            // short Lc
            let lc = usize::from(body[0]);
            let request_data = body.get(1..1+lc)?.to_vec();
            return match body.len() - 1 - lc {
                0 => Some(Self::RequestDataShort { request_data }),
                1 => Some(Self::BothDataShort { request_data, response_data_length: body[1+lc] }),
                _ => None,
            };
        }

        // extended; the leading zero is followed by a two-byte length
        if body.len() < 3 {
            return None;
        }
        let first_length = u16::from_be_bytes([body[1], body[2]]);
        if body.len() == 3 {
            return Some(Self::ResponseDataExtended { response_data_length: first_length });
        }
        if first_length == 0 {
            return None;
        }
        let lc = usize::from(first_length);
        let request_data = body.get(3..3+lc)?.to_vec();
        let rest = &body[3+lc..];
        match rest.len() {
            0 => Some(Self::RequestDataExtended { request_data }),
            2 => Some(Self::BothDataExtended {
                request_data,
                response_data_length: u16::from_be_bytes([rest[0], rest[1]]),
            }),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Apdu {
    pub header: CommandHeader,
    pub data: Data,
}
impl Apdu {
    pub const fn new(header: CommandHeader, data: Data) -> Self {
        Self { header, data }
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        self.header.write_bytes(writer)?;
        self.data.write_bytes(writer)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WriteError> {
        let mut ret = Vec::with_capacity(4 + 3 + self.data.request_data().map(|d| d.len()).unwrap_or(0) + 2);
        self.write_bytes(&mut ret)?;
        Ok(ret)
    }

    /// Decodes a raw command APDU.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 {
            return None;
        }
        let header = CommandHeader::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let data = Data::from_body(&bytes[4..])?;
        Some(Self { header, data })
    }
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Response {
    pub data: Vec<u8>,
    pub trailer: ResponseTrailer,
}
impl Response {
    pub const fn new(data: Vec<u8>, trailer: ResponseTrailer) -> Self {
        Self { data, trailer }
    }

    /// A response consisting only of a status word.
    pub const fn status(word: u16) -> Self {
        Self { data: Vec::new(), trailer: ResponseTrailer::from_word(word) }
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 2 {
            return None;
        }

        let data = bytes[..bytes.len() - 2].to_vec();
        let trailer = ResponseTrailer {
            sw1: bytes[bytes.len() - 2],
            sw2: bytes[bytes.len() - 1],
        };
        Some(Self {
            data,
            trailer,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ret = Vec::with_capacity(self.data.len() + 2);
        ret.extend_from_slice(&self.data);
        ret.extend_from_slice(&self.trailer.to_bytes());
        ret
    }

    pub const fn is_success(&self) -> bool {
        self.trailer.is_success()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_encoding() {
        let select = Apdu::new(
            CommandHeader::new(0x00, 0xA4, 0x02, 0x0C),
            Data::RequestDataShort { request_data: vec![0x01, 0x1E] },
        );
        assert_eq!(select.to_bytes().unwrap(), vec![0x00, 0xA4, 0x02, 0x0C, 0x02, 0x01, 0x1E]);

        let read = Apdu::new(
            CommandHeader::new(0x00, 0xB0, 0x00, 0x00),
            Data::ResponseDataShort { response_data_length: 0 },
        );
        assert_eq!(read.to_bytes().unwrap(), vec![0x00, 0xB0, 0x00, 0x00, 0x00]);
        assert_eq!(read.data.response_data_length(), Some(256));

        let extended = Apdu::new(
            CommandHeader::new(0x0C, 0xB0, 0x00, 0x00),
            Data::BothDataExtended { request_data: vec![0xAA; 300], response_data_length: 0 },
        );
        let bytes = extended.to_bytes().unwrap();
        assert_eq!(&bytes[4..7], &[0x00, 0x01, 0x2C]);
        assert_eq!(&bytes[bytes.len()-2..], &[0x00, 0x00]);
        assert_eq!(Apdu::from_bytes(&bytes), Some(extended));
    }

    #[test]
    fn test_short_data_limit() {
        let too_long = Data::RequestDataShort { request_data: vec![0; 256] };
        assert!(matches!(
            too_long.write_bytes(&mut Vec::new()),
            Err(WriteError::DataTooLong { maximum: 255, obtained: 256 }),
        ));
        let empty = Data::BothDataShort { request_data: Vec::new(), response_data_length: 0 };
        assert!(matches!(empty.write_bytes(&mut Vec::new()), Err(WriteError::EmptyData)));
    }

    #[test]
    fn test_decode_cases() {
        assert_eq!(Apdu::from_bytes(&[0x00, 0x84, 0x00, 0x00]).unwrap().data, Data::NoData);
        assert_eq!(
            Apdu::from_bytes(&[0x00, 0x84, 0x00, 0x00, 0x08]).unwrap().data,
            Data::ResponseDataShort { response_data_length: 8 },
        );
        assert_eq!(
            Apdu::from_bytes(&[0x00, 0x82, 0x00, 0x00, 0x02, 0xAB, 0xCD, 0x28]).unwrap().data,
            Data::BothDataShort { request_data: vec![0xAB, 0xCD], response_data_length: 0x28 },
        );
        assert_eq!(Apdu::from_bytes(&[0x00, 0xA4, 0x02, 0x0C, 0x02, 0x01]), None);
        assert_eq!(Apdu::from_bytes(&[0x00, 0xA4, 0x02]), None);
    }

    #[test]
    fn test_response_split() {
        assert_eq!(Response::from_slice(&[0x90]), None);
        let response = Response::from_slice(&[0x60, 0x14, 0x90, 0x00]).unwrap();
        assert_eq!(response.data, vec![0x60, 0x14]);
        assert!(response.is_success());
        assert_eq!(response.to_bytes(), vec![0x60, 0x14, 0x90, 0x00]);
        assert!(!Response::status(0x6A82).is_success());
    }
}

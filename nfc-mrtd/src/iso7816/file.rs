//! Selecting applications and elementary files, and reading transparent files.


use thiserror::Error;
use tracing::{debug, instrument};

use crate::der_util::{tag_length, try_decode_primitive_length};
use crate::error::ErrorKind;
use crate::iso7816::apdu::{Apdu, CommandHeader, Data, Response};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::presence::Presence;


/// Application identifier of the ICAO eMRTD application (LDS1).
pub const MRTD_APPLICATION_ID: [u8; 7] = [0xA0, 0x00, 0x00, 0x02, 0x47, 0x10, 0x01];

/// Highest offset READ BINARY can address with P1-P2 (bit 8 of P1 selects SFI mode).
const MAX_READ_OFFSET: usize = 0x7FFF;

/// Le value requesting as many bytes as the card is willing to return.
const FULL_CHUNK: usize = 256;


#[derive(Debug, Error)]
pub enum ReadError {
    #[error("failed to communicate while selecting: {0}")]
    SelectCommunication(#[source] CommunicationError),

    #[error("application {} not found", hex::encode_upper(.aid))]
    ApplicationNotFound { aid: Vec<u8> },

    #[error("file {:04X} not found", .file_id)]
    FileNotFound { file_id: u16 },

    #[error("selection failed with response code 0x{:04X}", .response.trailer.to_word())]
    SelectFailed { response: Response },

    #[error("failed to communicate while reading: {0}")]
    ReadCommunication(#[source] CommunicationError),

    #[error("reading at offset {} failed with response code 0x{:04X}", .offset, .response.trailer.to_word())]
    ReadFailed { offset: usize, response: Response },

    #[error("offset {} is beyond the range of READ BINARY", .offset)]
    OffsetTooLarge { offset: usize },

    #[error("file {:04X} ended after {} of {} bytes", .file_id, .obtained, .expected)]
    Truncated { file_id: u16, expected: usize, obtained: usize },
}
impl ReadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SelectCommunication(e) => e.kind(),
            Self::ReadCommunication(e) => e.kind(),
            _ => ErrorKind::Transport,
        }
    }

    /// Whether the file (or application) simply does not exist on the card.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::FileNotFound { .. } | Self::ApplicationNotFound { .. })
    }

    /// Whether the card left the field while the operation was running.
    pub fn is_card_removed(&self) -> bool {
        matches!(
            self,
            Self::SelectCommunication(CommunicationError::CardRemoved)
                | Self::ReadCommunication(CommunicationError::CardRemoved)
        )
    }
}


/// Selects an application by its AID (`00 A4 04 0C`).
#[instrument(skip(card))]
pub fn select_application<SC: SmartCard + ?Sized>(card: &mut SC, aid: &[u8]) -> Result<(), ReadError> {
    let request = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0xA4, // SELECT
            p1: 0b0000_0100, // select by DF name
            p2: 0b0000_1100, // no response data
        },
        data: Data::RequestDataShort {
            request_data: aid.to_vec(),
        },
    };
    let response = card.communicate(&request)
        .map_err(ReadError::SelectCommunication)?;
    match response.trailer.to_word() {
        0x9000 => Ok(()),
        0x6A82 => Err(ReadError::ApplicationNotFound { aid: aid.to_vec() }),
        _ => Err(ReadError::SelectFailed { response }),
    }
}


/// Selects an elementary file under the current DF by its file identifier (`00 A4 02 0C`).
#[instrument(skip(card))]
pub fn select_file<SC: SmartCard + ?Sized>(card: &mut SC, file_id: u16) -> Result<(), ReadError> {
    let request = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0xA4, // SELECT
            p1: 0b0000_0010, // select EF under current DF
            p2: 0b0000_1100, // no response data
        },
        data: Data::RequestDataShort {
            request_data: file_id.to_be_bytes().to_vec(),
        },
    };
    let response = card.communicate(&request)
        .map_err(ReadError::SelectCommunication)?;
    match response.trailer.to_word() {
        0x9000 => Ok(()),
        0x6A82 => Err(ReadError::FileNotFound { file_id }),
        _ => Err(ReadError::SelectFailed { response }),
    }
}


/// Issues a single READ BINARY at the given offset of the currently selected file.
///
/// `length` is the Le byte; zero asks for up to 256 bytes.
pub fn read_binary<SC: SmartCard + ?Sized>(card: &mut SC, offset: usize, length: u8) -> Result<Response, ReadError> {
    if offset > MAX_READ_OFFSET {
        return Err(ReadError::OffsetTooLarge { offset });
    }
    let offset_bytes = (offset as u16).to_be_bytes();
    let request = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0xB0, // READ BINARY
            p1: offset_bytes[0],
            p2: offset_bytes[1],
        },
        data: Data::ResponseDataShort {
            response_data_length: length,
        },
    };
    card.communicate(&request)
        .map_err(ReadError::ReadCommunication)
}


/// Selects a file and reads it completely using chained READ BINARY commands.
///
/// The size of the file is taken from the TLV header in the first chunk, and reading continues
/// until that many bytes have arrived, however short the individual chunks are. A card ending the
/// file early yields [`ReadError::Truncated`]. If the first chunk does not hold a complete header,
/// reading stops at the first chunk shorter than 256 bytes or at an error status after some data.
/// An error status on the first chunk is an error. The presence flag is checked before every
/// exchange.
#[instrument(skip(card, presence))]
pub fn read_file<SC: SmartCard + ?Sized>(card: &mut SC, file_id: u16, presence: &Presence) -> Result<Vec<u8>, ReadError> {
    presence.ensure_present()
        .map_err(ReadError::SelectCommunication)?;
    select_file(card, file_id)?;

    let mut data = Vec::new();
    let mut expected: Option<usize> = None;
    loop {
        presence.ensure_present()
            .map_err(ReadError::ReadCommunication)?;

        let offset = data.len();
        // Le 00 asks for 256 bytes
        let length = expected
            .and_then(|total| u8::try_from(total - offset).ok())
            .unwrap_or(0x00);
        let response = read_binary(card, offset, length)?;
        let status = response.trailer.to_word();
        let end_of_file_warning = status == 0x6282;
        if !response.is_success() && !end_of_file_warning {
            if data.is_empty() {
                return Err(ReadError::ReadFailed { offset, response });
            }
            if let Some(expected) = expected {
                return Err(ReadError::Truncated { file_id, expected, obtained: offset });
            }
            debug!("read of {:04X} ended at offset {} with status {:04X}", file_id, offset, status);
            break;
        }

        let chunk_length = response.data.len();
        data.extend_from_slice(&response.data);
        if expected.is_none() {
            expected = encoded_size(&data);
        }
        match expected {
            Some(total) if data.len() >= total => {
                data.truncate(total);
                break;
            },
            Some(total) if end_of_file_warning || chunk_length == 0 => {
                return Err(ReadError::Truncated { file_id, expected: total, obtained: data.len() });
            },
            Some(_) => {},
            None if chunk_length < FULL_CHUNK || end_of_file_warning => break,
            None => {},
        }
    }
    debug!("read {} bytes from file {:04X}", data.len(), file_id);
    Ok(data)
}


/// Total size of the TLV object at the start of `data`, once its tag and length are complete.
fn encoded_size(data: &[u8]) -> Option<usize> {
    let tag_bytes = tag_length(data)?;
    let (value_length, value) = try_decode_primitive_length(data.get(tag_bytes..)?)?;
    let header_length = data.len() - value.len();
    header_length.checked_add(value_length)
}

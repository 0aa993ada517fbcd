//! Secure Messaging with two-key 3DES and retail MAC.
//!
//! Both halves are implemented: the terminal side protects commands and unprotects responses, the
//! chip side unprotects commands and protects responses. The chip side is what card emulators use.


use std::fmt;

use thiserror::Error;
use tracing::trace;
use zeroize_derive::ZeroizeOnDrop;

use crate::crypt::{CryptError, DES_BLOCK_SIZE, pad_iso9797_m2, padded_iso9797_m2, unpad_iso9797_m2};
use crate::crypt::tdes::{decrypt_cbc, encrypt_cbc, expand_key, retail_mac, verify_retail_mac};
use crate::crypt::adjust_parity;
use crate::der_util::{BorrowedTlv, encode_tlv, parse_tlv_sequence};
use crate::iso7816::apdu::{Apdu, CommandHeader, Data, Response, ResponseTrailer, SHORT_MAX_DATA};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::kdf::{Kdf, Kdf3Des};


/// Bits of the CLA byte announcing Secure Messaging with an authenticated header.
const SECURE_MESSAGING_CLA: u8 = 0b0000_1100;

/// Padding indicator: ISO/IEC 9797-1 method 2.
const PADDING_ISO: u8 = 0x01;

const TAG_CRYPTOGRAM: u8 = 0x87;
const TAG_EXPECTED_LENGTH: u8 = 0x97;
const TAG_STATUS: u8 = 0x99;
const TAG_MAC: u8 = 0x8E;


#[derive(Debug, Error)]
pub enum Error {
    #[error("response MAC incorrect")]
    ResponseMac,

    #[error("command MAC incorrect")]
    CommandMac,

    #[error("response has an invalid TLV format")]
    ResponseTlvFormat,

    #[error("command has an invalid TLV format")]
    CommandTlvFormat,

    #[error("response does not contain a MAC")]
    MissingResponseMac,

    #[error("command does not contain a MAC")]
    MissingCommandMac,

    #[error("response does not contain status")]
    MissingResponseStatus,

    #[error("status has unexpected length {obtained}")]
    StatusLength { obtained: usize },

    #[error("expected length object has unexpected length {obtained}")]
    ExpectedLengthLength { obtained: usize },

    #[error("payload has unknown padding mode {padding_mode}")]
    UnknownPadding { padding_mode: u8 },

    #[error("command class 0x{cla:02X} does not announce Secure Messaging")]
    MissingSecureMessagingClass { cla: u8 },

    #[error("cryptographic operation failed: {0}")]
    Crypt(#[from] CryptError),
}


/// Session keys for Secure Messaging, both in `Ka || Kb || Ka` form.
///
/// The keys are zeroed when dropped and never shown by `Debug`.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SessionKeys {
    k_enc: [u8; 24],
    k_mac: [u8; 24],
}
impl SessionKeys {
    pub fn new(k_enc: [u8; 24], k_mac: [u8; 24]) -> Self {
        Self { k_enc, k_mac }
    }

    /// Derives both session keys from a key seed using the 3DES key derivation function.
    pub fn from_seed(key_seed: &[u8]) -> Self {
        Self::new(
            *Kdf3Des::derive_encryption_key(key_seed),
            *Kdf3Des::derive_mac_key(key_seed),
        )
    }

    /// Builds the session keys from two-key 3DES keys `Ka || Kb`, adjusting their parity.
    pub fn from_two_key(k_enc: &[u8; 16], k_mac: &[u8; 16]) -> Self {
        let mut k_enc = expand_key(k_enc);
        let mut k_mac = expand_key(k_mac);
        adjust_parity(&mut k_enc);
        adjust_parity(&mut k_mac);
        Self::new(k_enc, k_mac)
    }

    pub fn k_enc(&self) -> &[u8; 24] { &self.k_enc }
    pub fn k_mac(&self) -> &[u8; 24] { &self.k_mac }
}
impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("k_enc", &"<redacted>")
            .field("k_mac", &"<redacted>")
            .finish()
    }
}


/// Increments a big-endian send sequence counter in place, wrapping around at the maximum.
pub fn increment_send_sequence_counter(ssc: &mut [u8]) {
    for b in ssc.iter_mut().rev() {
        if *b == 0xFF {
            *b = 0x00;
            // carry; keep going
        } else {
            *b += 1;
            // the buck stops here
            break;
        }
    }
}


/// The state of one Secure Messaging session: the session keys and the send sequence counter.
///
/// The counter is incremented before every protected command and before every protected response,
/// on either side.
#[derive(Debug)]
pub struct SecureMessagingSession {
    keys: SessionKeys,
    send_sequence_counter: [u8; 8],
}
impl SecureMessagingSession {
    pub fn new(keys: SessionKeys, send_sequence_counter: [u8; 8]) -> Self {
        Self {
            keys,
            send_sequence_counter,
        }
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    pub fn send_sequence_counter(&self) -> [u8; 8] {
        self.send_sequence_counter
    }

    fn next_send_sequence_counter(&mut self) -> [u8; 8] {
        increment_send_sequence_counter(&mut self.send_sequence_counter);
        self.send_sequence_counter
    }

    fn compute_mac(&self, ssc: &[u8; 8], parts: &[&[u8]]) -> Result<[u8; 8], Error> {
        Ok(retail_mac(&self.keys.k_mac, &mac_input(ssc, parts))?)
    }

    fn verify_mac(&self, ssc: &[u8; 8], parts: &[&[u8]], expected: &[u8]) -> Result<bool, Error> {
        Ok(verify_retail_mac(&self.keys.k_mac, &mac_input(ssc, parts), expected)?)
    }

    fn encrypt_object(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut encrypted = padded_iso9797_m2(data, DES_BLOCK_SIZE);
        encrypt_cbc(&self.keys.k_enc, &mut encrypted)?;

        // 0x87 len padtype data...
        let mut value = Vec::with_capacity(1 + encrypted.len());
        value.push(PADDING_ISO);
        value.extend_from_slice(&encrypted);
        let mut data_object_87 = Vec::with_capacity(4 + value.len());
        encode_tlv(&mut data_object_87, &[TAG_CRYPTOGRAM], &value);
        Ok(data_object_87)
    }

    fn decrypt_object(&self, value: &[u8]) -> Result<Vec<u8>, Error> {
        let Some((&padding_mode, encrypted)) = value.split_first() else {
            return Err(CryptError::InvalidPadding.into());
        };
        if padding_mode != PADDING_ISO {
            return Err(Error::UnknownPadding { padding_mode });
        }
        let mut decrypted = encrypted.to_vec();
        decrypt_cbc(&self.keys.k_enc, &mut decrypted)?;
        let unpadded = unpad_iso9797_m2(&decrypted)?;
        Ok(unpadded.to_vec())
    }

    /// Protects a plain command APDU (terminal side).
    pub fn protect_command(&mut self, request: &Apdu) -> Result<Apdu, Error> {
        // add secure messaging mark to CLA (header is part of MAC)
        let mut header = request.header.clone();
        header.cla |= SECURE_MESSAGING_CLA;
        let padded_header = padded_iso9797_m2(&header.to_bytes(), DES_BLOCK_SIZE);

        let ssc = self.next_send_sequence_counter();

        let mut body_data = Vec::new();
        if let Some(request_data) = request.data.request_data() {
            body_data.extend(self.encrypt_object(request_data)?);
        }

        // are we expecting something in return?
        match &request.data {
            Data::NoData|Data::RequestDataShort { .. }|Data::RequestDataExtended { .. } => {},
            Data::ResponseDataShort { response_data_length }|Data::BothDataShort { response_data_length, .. } => {
                body_data.extend([TAG_EXPECTED_LENGTH, 0x01, *response_data_length]);
            },
            Data::ResponseDataExtended { response_data_length }|Data::BothDataExtended { response_data_length, .. } => {
                let le = response_data_length.to_be_bytes();
                body_data.extend([TAG_EXPECTED_LENGTH, 0x02, le[0], le[1]]);
            },
        }

        let mac = self.compute_mac(&ssc, &[&padded_header, &body_data])?;
        encode_tlv(&mut body_data, &[TAG_MAC], &mac);

        let data = if body_data.len() > SHORT_MAX_DATA {
            Data::BothDataExtended { request_data: body_data, response_data_length: 0 }
        } else {
            Data::BothDataShort { request_data: body_data, response_data_length: 0 }
        };
        Ok(Apdu::new(header, data))
    }

    /// Verifies and decrypts a protected response APDU (terminal side).
    ///
    /// A response consisting of nothing but an error status word is passed through unchanged;
    /// cards answer this way when they reject a protected command.
    pub fn unprotect_response(&mut self, response: &Response) -> Result<Response, Error> {
        let ssc = self.next_send_sequence_counter();

        if response.data.is_empty() && !response.is_success() {
            trace!("passing through plain status 0x{:04X}", response.trailer.to_word());
            return Ok(response.clone());
        }

        let objects = parse_tlv_sequence(&response.data)
            .ok_or(Error::ResponseTlvFormat)?;
        let received_mac = find_object(&objects, TAG_MAC)
            .ok_or(Error::MissingResponseMac)?;
        let covered = mac_covered_bytes(&objects);
        if !self.verify_mac(&ssc, &[&covered], received_mac.value)? {
            return Err(Error::ResponseMac);
        }

        let data = match find_object(&objects, TAG_CRYPTOGRAM) {
            Some(cryptogram) => self.decrypt_object(cryptogram.value)?,
            None => Vec::new(),
        };
        let status = find_object(&objects, TAG_STATUS)
            .ok_or(Error::MissingResponseStatus)?;
        if status.value.len() != 2 {
            return Err(Error::StatusLength { obtained: status.value.len() });
        }

        trace!("unprotected response data:\n{}", crate::hexdump(&data));
        Ok(Response::new(data, ResponseTrailer::new(status.value[0], status.value[1])))
    }

    /// Verifies and decrypts a protected command APDU (chip side).
    pub fn unprotect_command(&mut self, request: &Apdu) -> Result<Apdu, Error> {
        if request.header.cla & SECURE_MESSAGING_CLA != SECURE_MESSAGING_CLA {
            return Err(Error::MissingSecureMessagingClass { cla: request.header.cla });
        }
        let ssc = self.next_send_sequence_counter();

        let body = request.data.request_data().unwrap_or(&[]);
        let objects = parse_tlv_sequence(body)
            .ok_or(Error::CommandTlvFormat)?;
        let received_mac = find_object(&objects, TAG_MAC)
            .ok_or(Error::MissingCommandMac)?;

        let padded_header = padded_iso9797_m2(&request.header.to_bytes(), DES_BLOCK_SIZE);
        let covered = mac_covered_bytes(&objects);
        if !self.verify_mac(&ssc, &[&padded_header, &covered], received_mac.value)? {
            return Err(Error::CommandMac);
        }

        let request_data = match find_object(&objects, TAG_CRYPTOGRAM) {
            Some(cryptogram) => Some(self.decrypt_object(cryptogram.value)?),
            None => None,
        };
        let expected_length = match find_object(&objects, TAG_EXPECTED_LENGTH) {
            None => None,
            Some(tlv) => match tlv.value {
                [le] => Some(ExpectedLength::Short(*le)),
                [hi, lo] => Some(ExpectedLength::Extended(u16::from_be_bytes([*hi, *lo]))),
                other => return Err(Error::ExpectedLengthLength { obtained: other.len() }),
            },
        };

        let header = CommandHeader::new(
            request.header.cla & !SECURE_MESSAGING_CLA,
            request.header.ins,
            request.header.p1,
            request.header.p2,
        );
        Ok(Apdu::new(header, plain_data(request_data, expected_length)))
    }

    /// Protects a plain response APDU (chip side).
    ///
    /// The status word is carried in data object `99` and also used as the outer status word.
    pub fn protect_response(&mut self, response: &Response) -> Result<Response, Error> {
        let ssc = self.next_send_sequence_counter();

        let mut body_data = Vec::new();
        if !response.data.is_empty() {
            body_data.extend(self.encrypt_object(&response.data)?);
        }
        encode_tlv(&mut body_data, &[TAG_STATUS], &response.trailer.to_bytes());

        let mac = self.compute_mac(&ssc, &[&body_data])?;
        encode_tlv(&mut body_data, &[TAG_MAC], &mac);
        Ok(Response::new(body_data, response.trailer.clone()))
    }
}


#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ExpectedLength {
    Short(u8),
    Extended(u16),
}


fn plain_data(request_data: Option<Vec<u8>>, expected_length: Option<ExpectedLength>) -> Data {
    let extended_request = request_data.as_ref()
        .map(|d| d.len() > SHORT_MAX_DATA)
        .unwrap_or(false);
    match (request_data, expected_length) {
        (None, None) => Data::NoData,
        (None, Some(ExpectedLength::Short(response_data_length))) => Data::ResponseDataShort { response_data_length },
        (None, Some(ExpectedLength::Extended(response_data_length))) => Data::ResponseDataExtended { response_data_length },
        (Some(request_data), None) => if extended_request {
            Data::RequestDataExtended { request_data }
        } else {
            Data::RequestDataShort { request_data }
        },
        (Some(request_data), Some(ExpectedLength::Short(le))) if !extended_request => Data::BothDataShort {
            request_data,
            response_data_length: le,
        },
        (Some(request_data), Some(le)) => Data::BothDataExtended {
            request_data,
            response_data_length: match le {
                ExpectedLength::Short(short) => u16::from(short),
                ExpectedLength::Extended(extended) => extended,
            },
        },
    }
}


/// Data objects with an odd tag (other than the MAC itself) are covered by the MAC.
fn is_mac_covered(tlv: &BorrowedTlv<'_>) -> bool {
    let tag = tlv.tag[0];
    tag != TAG_MAC && tag & 0b1 != 0
}


fn mac_covered_bytes(objects: &[BorrowedTlv<'_>]) -> Vec<u8> {
    objects.iter()
        .filter(|tlv| is_mac_covered(tlv))
        .flat_map(|tlv| tlv.to_bytes())
        .collect()
}


/// `SSC || parts`, padded.
fn mac_input(ssc: &[u8; 8], parts: &[&[u8]]) -> Vec<u8> {
    let mut mac_data = ssc.to_vec();
    for part in parts {
        mac_data.extend_from_slice(part);
    }
    pad_iso9797_m2(&mut mac_data, DES_BLOCK_SIZE);
    mac_data
}


fn find_object<'a, 'd>(objects: &'a [BorrowedTlv<'d>], tag: u8) -> Option<&'a BorrowedTlv<'d>> {
    objects.iter()
        .find(|tlv| tlv.tag.len() == 1 && tlv.tag[0] == tag)
}


/// A smart card whose traffic is protected by Secure Messaging.
///
/// Every command passed to [`SmartCard::communicate`] is protected, and every response verified and
/// decrypted, using the contained session.
#[derive(Debug)]
pub struct SecureChannel<SC> {
    card: SC,
    session: SecureMessagingSession,
}
impl<SC: SmartCard> SecureChannel<SC> {
    pub fn new(card: SC, session: SecureMessagingSession) -> Self {
        Self {
            card,
            session,
        }
    }

    pub fn session(&self) -> &SecureMessagingSession {
        &self.session
    }

    pub fn card_mut(&mut self) -> &mut SC {
        &mut self.card
    }

    /// Takes the channel apart, returning the card and the session (with its current counter).
    pub fn into_parts(self) -> (SC, SecureMessagingSession) {
        (self.card, self.session)
    }
}
impl<SC: SmartCard> SmartCard for SecureChannel<SC> {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        let protected_request = self.session.protect_command(request)?;
        let protected_response = self.card.communicate(&protected_request)?;
        Ok(self.session.unprotect_response(&protected_response)?)
    }
}


#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use super::*;

    fn sessions() -> (SecureMessagingSession, SecureMessagingSession) {
        let keys = SessionKeys::from_seed(&hex!("0036D272F5C350ACAC50C3F572D23600"));
        let ssc = hex!("887022120C06C226");
        (
            SecureMessagingSession::new(keys.clone(), ssc),
            SecureMessagingSession::new(keys, ssc),
        )
    }

    #[test]
    fn test_ssc_increment() {
        let mut ssc = hex!("00000000000000FF");
        increment_send_sequence_counter(&mut ssc);
        assert_eq!(ssc, hex!("0000000000000100"));

        let mut ssc = [0xFF; 8];
        increment_send_sequence_counter(&mut ssc);
        assert_eq!(ssc, [0x00; 8]);
    }

    #[test]
    fn test_keys_are_redacted() {
        let keys = SessionKeys::new([0x42; 24], [0x43; 24]);
        let debug = format!("{:?}", keys);
        assert!(!debug.contains("42"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn test_round_trip() {
        let (mut terminal, mut chip) = sessions();
        for length in [0usize, 7, 8, 9, 16] {
            let payload: Vec<u8> = (0..length).map(|i| i as u8).collect();
            let data = if length == 0 {
                Data::ResponseDataShort { response_data_length: 0 }
            } else {
                Data::BothDataShort { request_data: payload.clone(), response_data_length: 0x10 }
            };
            let request = Apdu::new(CommandHeader::new(0x00, 0xB0, 0x00, 0x00), data);

            let protected = terminal.protect_command(&request).unwrap();
            assert_eq!(protected.header.cla, 0x0C);
            assert_eq!(chip.unprotect_command(&protected).unwrap(), request);

            let response = Response::new(payload.clone(), ResponseTrailer::SUCCESS);
            let protected_response = chip.protect_response(&response).unwrap();
            assert_eq!(terminal.unprotect_response(&protected_response).unwrap(), response);
        }
        assert_eq!(terminal.send_sequence_counter(), chip.send_sequence_counter());
    }

    #[test]
    fn test_long_command_becomes_extended() {
        let (mut terminal, mut chip) = sessions();
        let request = Apdu::new(
            CommandHeader::new(0x00, 0xD6, 0x00, 0x00),
            Data::RequestDataShort { request_data: vec![0xA5; 250] },
        );
        let protected = terminal.protect_command(&request).unwrap();
        assert!(protected.data.is_extended());
        assert_eq!(protected.data.response_data_length(), Some(0x10000));
        assert_eq!(chip.unprotect_command(&protected).unwrap(), request);
    }

    #[test]
    fn test_tampered_response_is_rejected() {
        let (mut terminal, mut chip) = sessions();
        let response = Response::new(b"tamper".to_vec(), ResponseTrailer::SUCCESS);
        let protected_response = chip.protect_response(&response).unwrap();

        for position in 0..protected_response.data.len() {
            let mut tampered = protected_response.clone();
            tampered.data[position] ^= 0x01;
            let mut session = SecureMessagingSession::new(
                terminal.keys().clone(),
                terminal.send_sequence_counter(),
            );
            assert!(session.unprotect_response(&tampered).is_err(), "tampering at {} went unnoticed", position);
        }
        assert_eq!(terminal.unprotect_response(&protected_response).unwrap(), response);
    }

    #[test]
    fn test_plain_error_passes_through() {
        let (mut terminal, _chip) = sessions();
        let before = terminal.send_sequence_counter();
        let response = terminal.unprotect_response(&Response::status(0x6988)).unwrap();
        assert_eq!(response.trailer.to_word(), 0x6988);
        assert_ne!(terminal.send_sequence_counter(), before);
    }

    #[test]
    fn test_missing_secure_messaging_class() {
        let (_terminal, mut chip) = sessions();
        let plain = Apdu::new(CommandHeader::new(0x00, 0x84, 0x00, 0x00), Data::ResponseDataShort { response_data_length: 8 });
        assert!(matches!(chip.unprotect_command(&plain), Err(Error::MissingSecureMessagingClass { cla: 0x00 })));
    }
}

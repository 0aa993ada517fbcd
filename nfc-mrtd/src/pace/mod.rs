//! Implementation of Password Authenticated Connection Establishment.
//!
//! Only the generic mapping over NIST P-256 is implemented. The session keys derived from the
//! shared secret drive 3DES secure messaging, exactly like the keys obtained through BAC.


pub mod chip;
pub mod mapping;


use std::fmt;

use p256::{NonZeroScalar, ProjectivePoint};
use rand::{CryptoRng, RngCore};
use thiserror::Error;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::der_util::{encode_tlv, parse_tlv};
use crate::error::ErrorKind;
use crate::iso7816::apdu::{Apdu, CommandHeader, Data, Response};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::kdf::{pace_password_key, Kdf, KdfSha256};
use crate::mrz::MrzInfo;
use crate::pace::mapping::{
    authentication_token, decode_point, decrypt_nonce, encode_point, map_generator, nonce_scalar,
    shared_secret, verify_token,
};
use crate::secure_messaging::{SecureMessagingSession, SessionKeys};


/// DER content of the object identifier id-PACE-ECDH-GM-AES-CBC-CMAC-128 (0.4.0.127.0.7.2.2.4.2.2).
pub const PACE_ECDH_GM_AES_CBC_CMAC_128: [u8; 10] = [0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x04, 0x02, 0x02];

/// Tag of the dynamic authentication data template.
const DYNAMIC_AUTHENTICATION_DATA: u8 = 0x7C;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    SetAuthenticationTemplate,
    ObtainNonce,
    ExchangeMappingPublicKeys,
    ExchangeEphemeralPublicKeys,
    MutualAuthentication,
}
impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetAuthenticationTemplate => write!(f, "MSE:SET AT"),
            Self::ObtainNonce => write!(f, "GENERAL AUTHENTICATE (nonce)"),
            Self::ExchangeMappingPublicKeys => write!(f, "GENERAL AUTHENTICATE (mapping)"),
            Self::ExchangeEphemeralPublicKeys => write!(f, "GENERAL AUTHENTICATE (key agreement)"),
            Self::MutualAuthentication => write!(f, "GENERAL AUTHENTICATE (mutual authentication)"),
        }
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PaceState {
    Idle,
    MseSet,
    NonceReceived,
    Mapped,
    KeyAgreed,
    Authenticated,
    Failed,
}


#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to communicate: {0}")]
    Communication(#[from] CommunicationError),

    #[error("{operation} failed with response code 0x{:04X}", .response.trailer.to_word())]
    OperationFailed { operation: Operation, response: Response },

    #[error("{operation} received a response shorter than {min_data_len} bytes")]
    ShortResponse { operation: Operation, min_data_len: usize },

    #[error("{operation} received data object of unexpected type 0x{type_tag:02X}")]
    UnexpectedType { operation: Operation, type_tag: u8 },

    #[error("invalid TLV encoding in response to {operation}")]
    TlvEncoding { operation: Operation },

    #[error("nonce has length {obtained}, expected 16")]
    NonceLength { obtained: usize },

    #[error("invalid public key")]
    PublicKey { bytes: Zeroizing<Vec<u8>> },

    #[error("point at infinity encountered")]
    IdentityPoint,

    #[error("terminal and chip ephemeral keys are equal")]
    DiffieHellmanKeysEqual,

    #[error("mutual authentication failed")]
    MutualAuthentication,

    #[error("invalid key for authentication token")]
    TokenKey,

    #[error("a card access number consists of decimal digits only")]
    InvalidCan,

    #[error("authentication cannot start in state {state:?}")]
    InvalidState { state: PaceState },
}
impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Communication(e) => e.kind(),
            Self::InvalidCan => ErrorKind::InvalidRequest,
            _ => ErrorKind::Authentication,
        }
    }
}


/// The password the PACE keys are derived from.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PasswordSource {
    Mrz,
    Can,
}
impl PasswordSource {
    /// The password reference sent in MSE:SET AT.
    pub const fn reference(&self) -> u8 {
        match self {
            Self::Mrz => 0x01,
            Self::Can => 0x02,
        }
    }

    pub const fn from_reference(reference: u8) -> Option<Self> {
        match reference {
            0x01 => Some(Self::Mrz),
            0x02 => Some(Self::Can),
            _ => None,
        }
    }
}


/// Checks that a card access number is a non-empty string of decimal digits.
pub fn validate_can(can: &str) -> Result<(), Error> {
    if can.is_empty() || !can.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidCan);
    }
    Ok(())
}


/// Wraps a data object into dynamic authentication data.
fn dynamic_authentication_data(tag: u8, value: &[u8]) -> Vec<u8> {
    let mut inner = Zeroizing::new(Vec::with_capacity(value.len() + 3));
    encode_tlv(&mut inner, &[tag], value);
    let mut outer = Vec::with_capacity(inner.len() + 3);
    encode_tlv(&mut outer, &[DYNAMIC_AUTHENTICATION_DATA], &inner);
    outer
}


/// Extracts the single data object with the given tag from dynamic authentication data.
fn extract_double_wrapped(operation: Operation, data: &[u8], inner_tag: u8) -> Result<Zeroizing<Vec<u8>>, Error> {
    if data.len() < 4 {
        return Err(Error::ShortResponse { operation, min_data_len: 4 });
    }
    let (outer, _rest) = parse_tlv(data)
        .ok_or(Error::TlvEncoding { operation })?;
    if outer.tag != [DYNAMIC_AUTHENTICATION_DATA] {
        return Err(Error::UnexpectedType { operation, type_tag: outer.tag[0] });
    }
    let (inner, _rest) = parse_tlv(outer.value)
        .ok_or(Error::TlvEncoding { operation })?;
    if inner.tag != [inner_tag] {
        return Err(Error::UnexpectedType { operation, type_tag: inner.tag[0] });
    }
    Ok(Zeroizing::new(inner.value.to_vec()))
}


#[instrument(skip(card))]
fn set_authentication_template<SC: SmartCard + ?Sized>(card: &mut SC, password_source: PasswordSource) -> Result<(), Error> {
    let mut request_data = Vec::new();
    encode_tlv(&mut request_data, &[0x80], &PACE_ECDH_GM_AES_CBC_CMAC_128);
    encode_tlv(&mut request_data, &[0x83], &[password_source.reference()]);

    let request = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0x22, // MANAGE SECURITY ENVIRONMENT
            p1: 0b1100_0001, // verify/encrypt/extauth, compute/decrypt/intauth, set
            p2: 0xA4, // control reference template for authentication
        },
        data: Data::RequestDataShort { request_data },
    };
    let response = card.communicate(&request)?;
    if response.is_success() {
        Ok(())
    } else {
        Err(Error::OperationFailed {
            operation: Operation::SetAuthenticationTemplate,
            response,
        })
    }
}


/// Sends one GENERAL AUTHENTICATE command and returns the data object the chip answers with.
///
/// Without an outgoing data object, empty dynamic authentication data is sent.
fn general_authenticate<SC: SmartCard + ?Sized>(
    card: &mut SC,
    operation: Operation,
    outgoing: Option<(u8, &[u8])>,
    incoming_tag: u8,
    last_in_chain: bool,
) -> Result<Zeroizing<Vec<u8>>, Error> {
    let request_data = match outgoing {
        Some((tag, value)) => dynamic_authentication_data(tag, value),
        None => vec![DYNAMIC_AUTHENTICATION_DATA, 0x00],
    };
    let request = Apdu {
        header: CommandHeader {
            cla: if last_in_chain { 0b000_0_00_00 } else { 0b000_1_00_00 }, // command chaining bit
            ins: 0x86, // GENERAL AUTHENTICATE
            p1: 0x00, // algorithm is known (from "set authentication template")
            p2: 0x00, // key index is known (from "set authentication template")
        },
        data: Data::BothDataShort {
            request_data,
            response_data_length: 0,
        },
    };
    let response = card.communicate(&request)?;
    if !response.is_success() {
        return Err(Error::OperationFailed { operation, response });
    }
    extract_double_wrapped(operation, &response.data, incoming_tag)
}


/// The PACE protocol for one card.
///
/// Like [`BacProtocol`](crate::bac::BacProtocol), it runs at most once.
pub struct PaceProtocol {
    password_source: PasswordSource,
    k_pi: Zeroizing<[u8; 16]>,
    state: PaceState,
}
impl PaceProtocol {
    /// Prepares PACE with a card access number.
    pub fn from_can(can: &str) -> Result<Self, Error> {
        validate_can(can)?;
        Ok(Self::from_password(PasswordSource::Can, can.as_bytes()))
    }

    /// Prepares PACE with the MRZ information.
    pub fn from_mrz(mrz_info: &MrzInfo) -> Self {
        let information = Zeroizing::new(mrz_info.mrz_information());
        Self::from_password(PasswordSource::Mrz, information.as_bytes())
    }

    fn from_password(password_source: PasswordSource, password: &[u8]) -> Self {
        Self {
            password_source,
            k_pi: pace_password_key(password),
            state: PaceState::Idle,
        }
    }

    pub fn password_source(&self) -> PasswordSource {
        self.password_source
    }

    pub fn state(&self) -> PaceState {
        self.state
    }

    /// Performs PACE, drawing the mapping and ephemeral private keys from the given random
    /// number generator.
    #[instrument(skip_all)]
    pub fn authenticate<SC: SmartCard + ?Sized, R: RngCore + CryptoRng>(
        &mut self,
        card: &mut SC,
        rng: &mut R,
    ) -> Result<SecureMessagingSession, Error> {
        let mapping_private_key = NonZeroScalar::random(&mut *rng);
        let ephemeral_private_key = NonZeroScalar::random(&mut *rng);
        self.authenticate_with_values(card, &mapping_private_key, &ephemeral_private_key)
    }

    /// Performs PACE with fixed terminal private keys.
    #[instrument(skip_all)]
    pub fn authenticate_with_values<SC: SmartCard + ?Sized>(
        &mut self,
        card: &mut SC,
        mapping_private_key: &NonZeroScalar,
        ephemeral_private_key: &NonZeroScalar,
    ) -> Result<SecureMessagingSession, Error> {
        if self.state != PaceState::Idle {
            return Err(Error::InvalidState { state: self.state });
        }
        match self.run(card, mapping_private_key, ephemeral_private_key) {
            Ok(session) => {
                self.state = PaceState::Authenticated;
                debug!("PACE established");
                Ok(session)
            },
            Err(e) => {
                self.state = PaceState::Failed;
                debug!("PACE failed: {}", e);
                Err(e)
            },
        }
    }

    fn run<SC: SmartCard + ?Sized>(
        &mut self,
        card: &mut SC,
        mapping_private_key: &NonZeroScalar,
        ephemeral_private_key: &NonZeroScalar,
    ) -> Result<SecureMessagingSession, Error> {
        set_authentication_template(card, self.password_source)?;
        self.state = PaceState::MseSet;

        // obtain and decrypt the nonce
        let encrypted_nonce = general_authenticate(card, Operation::ObtainNonce, None, 0x80, false)?;
        let nonce = decrypt_nonce(&self.k_pi, &encrypted_nonce)?;
        let nonce = nonce_scalar(&nonce)?;
        self.state = PaceState::NonceReceived;

        // generic mapping
        let mapping_public_key = encode_point(&(ProjectivePoint::GENERATOR * **mapping_private_key))?;
        let card_mapping_public_key = general_authenticate(
            card,
            Operation::ExchangeMappingPublicKeys,
            Some((0x81, mapping_public_key.as_slice())),
            0x82,
            false,
        )?;
        let card_mapping_point = decode_point(&card_mapping_public_key)?;
        let generator = map_generator(&nonce, mapping_private_key, &card_mapping_point)?;
        self.state = PaceState::Mapped;

        // key agreement on the mapped domain
        let ephemeral_point = generator * **ephemeral_private_key;
        let ephemeral_public_key = encode_point(&ephemeral_point)?;
        let card_ephemeral_public_key = general_authenticate(
            card,
            Operation::ExchangeEphemeralPublicKeys,
            Some((0x83, ephemeral_public_key.as_slice())),
            0x84,
            false,
        )?;
        let card_ephemeral_point = decode_point(&card_ephemeral_public_key)?;
        if card_ephemeral_point == ephemeral_point {
            return Err(Error::DiffieHellmanKeysEqual);
        }
        let secret = shared_secret(ephemeral_private_key, &card_ephemeral_point)?;
        self.state = PaceState::KeyAgreed;

        let k_enc = KdfSha256::derive_encryption_key(&secret);
        let k_mac = KdfSha256::derive_mac_key(&secret);

        // mutual authentication
        let terminal_token = authentication_token(&k_mac, &card_ephemeral_public_key)?;
        let card_token = general_authenticate(
            card,
            Operation::MutualAuthentication,
            Some((0x85, &terminal_token[..])),
            0x86,
            true,
        )?;
        if !verify_token(&k_mac, &ephemeral_public_key, &card_token)? {
            return Err(Error::MutualAuthentication);
        }

        // the initial send sequence counter is all-zeroes for PACE
        Ok(SecureMessagingSession::new(SessionKeys::from_two_key(&k_enc, &k_mac), [0u8; 8]))
    }
}


#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use super::*;

    #[test]
    fn test_dynamic_authentication_data() {
        assert_eq!(dynamic_authentication_data(0x85, &hex!("0102030405060708")), hex!("7C0A85080102030405060708"));
        let value = extract_double_wrapped(Operation::MutualAuthentication, &hex!("7C0A86080102030405060708"), 0x86)
            .unwrap();
        assert_eq!(value.as_slice(), &hex!("0102030405060708"));
        assert!(matches!(
            extract_double_wrapped(Operation::MutualAuthentication, &hex!("7C0A85080102030405060708"), 0x86),
            Err(Error::UnexpectedType { type_tag: 0x85, .. }),
        ));
        assert!(matches!(
            extract_double_wrapped(Operation::MutualAuthentication, &hex!("7C0A8608010203"), 0x86),
            Err(Error::TlvEncoding { .. }),
        ));
        assert!(matches!(
            extract_double_wrapped(Operation::ObtainNonce, &hex!("7C00"), 0x80),
            Err(Error::ShortResponse { .. }),
        ));
    }

    #[test]
    fn test_can_validation() {
        assert!(PaceProtocol::from_can("123456").is_ok());
        assert!(matches!(PaceProtocol::from_can(""), Err(Error::InvalidCan)));
        assert!(matches!(PaceProtocol::from_can("12a456"), Err(Error::InvalidCan)));
        assert_eq!(PaceProtocol::from_can("123456").unwrap().password_source(), PasswordSource::Can);
    }

    #[test]
    fn test_password_reference() {
        for source in [PasswordSource::Mrz, PasswordSource::Can] {
            assert_eq!(PasswordSource::from_reference(source.reference()), Some(source));
        }
        assert_eq!(PasswordSource::from_reference(0x03), None);
    }
}

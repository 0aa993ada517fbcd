//! The crate-wide error type and its classification.


use std::fmt;

use thiserror::Error;

use crate::bac;
use crate::config::ConfigError;
use crate::iso7816::card::CommunicationError;
use crate::iso7816::file::ReadError;
use crate::lds;
use crate::mrz;
use crate::pace;
use crate::secure_messaging;
use crate::tag::ndef;


/// Broad classification of a failure, deciding how a caller should react.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// The reader or the card did not deliver; may be retried by the caller.
    Transport,

    /// BAC or PACE failed; not retried automatically.
    Authentication,

    /// A secure messaging MAC did not verify; the session is unusable.
    Integrity,

    /// Data read from the card could not be interpreted.
    Parse,

    /// The platform refused access to the reader.
    Permission,

    /// The adapter or the tag cannot perform the operation.
    Unsupported,

    /// The configuration is invalid.
    Configuration,

    /// The caller asked for something that makes no sense.
    InvalidRequest,
}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Authentication => write!(f, "authentication"),
            Self::Integrity => write!(f, "integrity"),
            Self::Parse => write!(f, "parse"),
            Self::Permission => write!(f, "permission"),
            Self::Unsupported => write!(f, "unsupported"),
            Self::Configuration => write!(f, "configuration"),
            Self::InvalidRequest => write!(f, "invalid request"),
        }
    }
}


#[derive(Debug, Error)]
pub enum Error {
    #[error("communication failed: {0}")]
    Communication(#[from] CommunicationError),

    #[error("file access failed: {0}")]
    File(#[from] ReadError),

    #[error("Basic Access Control failed: {0}")]
    Bac(#[from] bac::Error),

    #[error("PACE failed: {0}")]
    Pace(#[from] pace::Error),

    #[error("invalid MRZ: {0}")]
    Mrz(#[from] mrz::ParseError),

    #[error("failed to parse data group: {0}")]
    DataGroup(#[from] lds::Error),

    #[error("invalid NDEF data: {0}")]
    Ndef(#[from] ndef::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("{operation} failed with response code 0x{status:04X}")]
    Status { operation: &'static str, status: u16 },

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Communication(e) => e.kind(),
            Self::File(e) => e.kind(),
            Self::Bac(e) => e.kind(),
            Self::Pace(e) => e.kind(),
            Self::Mrz(_) => ErrorKind::Parse,
            Self::DataGroup(_) => ErrorKind::Parse,
            Self::Ndef(_) => ErrorKind::Parse,
            Self::Config(_) => ErrorKind::Configuration,
            Self::Status { .. } => ErrorKind::Transport,
            Self::Permission(_) => ErrorKind::Permission,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    /// Whether the failure happened because the card left the field.
    pub fn is_card_removed(&self) -> bool {
        match self {
            Self::Communication(CommunicationError::CardRemoved) => true,
            Self::File(e) => e.is_card_removed(),
            Self::Bac(bac::Error::Communication(CommunicationError::CardRemoved)) => true,
            Self::Pace(pace::Error::Communication(CommunicationError::CardRemoved)) => true,
            _ => false,
        }
    }

    /// Whether the current session must be abandoned rather than continuing with the next unit.
    pub fn aborts_session(&self) -> bool {
        self.is_card_removed() || self.kind() == ErrorKind::Integrity
    }
}
impl From<secure_messaging::Error> for Error {
    fn from(value: secure_messaging::Error) -> Self {
        Self::Communication(CommunicationError::SecureMessaging(value))
    }
}


/// A failure recorded next to the unit (data group, sector, page) it concerns.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct UnitError {
    pub kind: ErrorKind,
    pub message: String,
}
impl UnitError {
    pub fn new<M: Into<String>>(kind: ErrorKind, message: M) -> Self {
        Self { kind, message: message.into() }
    }
}
impl fmt::Display for UnitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}
impl From<&Error> for UnitError {
    fn from(value: &Error) -> Self {
        Self::new(value.kind(), value.to_string())
    }
}

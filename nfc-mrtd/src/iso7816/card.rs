use std::io;

use thiserror::Error;
use tracing::trace;

use crate::error::ErrorKind;
use crate::iso7816::apdu;
use crate::secure_messaging;


#[derive(Debug, Error)]
pub enum CommunicationError {
    #[error("APDU write error: {0}")]
    Write(#[from] apdu::WriteError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("reader backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("response too short")]
    ShortResponse,

    #[error("Secure Messaging error: {0}")]
    SecureMessaging(#[from] secure_messaging::Error),

    #[error("no response within {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("card was removed from the field")]
    CardRemoved,

    #[error("reader is not connected")]
    NotConnected,

    #[error("reader reported failure: {0}")]
    Reader(String),
}
impl CommunicationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SecureMessaging(_) => ErrorKind::Integrity,
            _ => ErrorKind::Transport,
        }
    }
}


/// A smart card compatible with ISO/IEC 7816.
pub trait SmartCard {
    /// Send a request APDU to the smart card and receive a response APDU.
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError>;
}
impl<SC: SmartCard + ?Sized> SmartCard for &mut SC {
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError> {
        (**self).communicate(request)
    }
}
impl<SC: SmartCard + ?Sized> SmartCard for Box<SC> {
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError> {
        (**self).communicate(request)
    }
}


/// Sends raw bytes through a closure-based transport and splits off the status word.
///
/// Shared by adapters whose backend only knows how to move byte strings.
pub fn transmit_raw<F>(request: &apdu::Apdu, transmit: F) -> Result<apdu::Response, CommunicationError>
    where F: FnOnce(&[u8]) -> Result<Vec<u8>, CommunicationError>
{
    let out_buf = request.to_bytes()?;
    trace!("sending to card:\n{}", crate::hexdump(&out_buf));
    let in_buf = transmit(&out_buf)?;
    trace!("received from card:\n{}", crate::hexdump(&in_buf));
    apdu::Response::from_slice(&in_buf)
        .ok_or(CommunicationError::ShortResponse)
}

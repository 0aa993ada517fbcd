//! Reader backends and the interface the engine drives them through.
//!
//! An adapter owns the connection to the reader hardware (or its stand-in), reports tags
//! entering and leaving the field through an event channel and hands out channels for talking to
//! a tag in the field: a [`TagChannel`] for block-level access and a [`SmartCard`] for ISO 7816
//! cards such as passports.


pub mod mock;
#[cfg(feature = "pcsc")]
pub mod pcsc;
pub mod serial;
pub mod webnfc;


use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::{Receiver, Sender};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{Error, UnitError};
use crate::iso7816::card::SmartCard;
use crate::presence::Presence;
use crate::tag::{NfcTag, TagType};
use crate::tag::reader::{read_tag, TagChannel, TagContent};
use crate::tag::writer::{format_tag, lock_tag, write_tag, LockOptions, WriteRequest};


#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    #[default]
    Pcsc,
    Serial,
    WebNfc,
    Mock,
}
impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pcsc => write!(f, "PC/SC"),
            Self::Serial => write!(f, "serial"),
            Self::WebNfc => write!(f, "Web NFC"),
            Self::Mock => write!(f, "mock"),
        }
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Capability {
    Read,
    Write,
    Format,
    Lock,
    RawCommands,
    NdefRead,
    NdefWrite,
    SmartCard,
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReaderInfo {
    pub adapter: AdapterKind,
    pub version: String,
    pub readers: Vec<String>,
    pub capabilities: Vec<Capability>,

    /// Whether the backend (driver, service, device) can be used at all.
    pub available: bool,

    /// Backend-specific settings such as the port and baud rate.
    pub details: BTreeMap<String, String>,
}


/// A tag that entered the field of a reader.
#[derive(Clone, Debug)]
pub struct TagDescriptor {
    pub uid: Vec<u8>,
    pub atr: Vec<u8>,

    /// The type, if the reader determined it; otherwise it is derived from the ATR.
    pub tag_type: Option<TagType>,

    pub reader: String,

    /// Cleared by the adapter as soon as the tag leaves the field.
    pub presence: Presence,
}
impl TagDescriptor {
    pub fn to_tag(&self) -> NfcTag {
        match self.tag_type {
            Some(tag_type) => NfcTag::with_type(self.uid.clone(), self.atr.clone(), tag_type),
            None => NfcTag::new(self.uid.clone(), self.atr.clone()),
        }
    }
}


#[derive(Clone, Debug)]
pub enum AdapterEvent {
    ReaderConnected { reader: String },
    ReaderDisconnected { reader: String },
    TagDiscovered(TagDescriptor),
    TagRemoved { uid: Vec<u8> },
    Error(UnitError),
}


/// Sends an event if anybody subscribed; a subscriber that went away is forgotten.
pub(crate) fn emit(events: &mut Option<Sender<AdapterEvent>>, event: AdapterEvent) {
    if let Some(sender) = events {
        if sender.send(event).is_err() {
            debug!("event receiver is gone");
            *events = None;
        }
    }
}


/// Creates the adapter the configuration asks for. Nothing is probed or connected yet.
pub fn from_config(config: &EngineConfig) -> Result<Box<dyn ReaderAdapter>, Error> {
    match config.adapter {
        #[cfg(feature = "pcsc")]
        AdapterKind::Pcsc => Ok(Box::new(pcsc::PcscAdapter::new(config))),
        #[cfg(not(feature = "pcsc"))]
        AdapterKind::Pcsc => Err(Error::Unsupported("built without PC/SC support".to_owned())),
        AdapterKind::Serial => Ok(Box::new(serial::SerialAdapter::open(config))),
        AdapterKind::WebNfc => Ok(Box::new(webnfc::WebNfcAdapter::new())),
        AdapterKind::Mock => Ok(Box::new(mock::MockAdapter::new())),
    }
}


/// A reader backend.
///
/// The tag operations have default implementations on top of [`ReaderAdapter::tag_channel`];
/// backends whose hardware performs them natively override them.
pub trait ReaderAdapter {
    fn kind(&self) -> AdapterKind;

    /// Returns the receiving end of a new event channel; earlier subscriptions stop receiving.
    fn subscribe(&mut self) -> Receiver<AdapterEvent>;

    fn connect(&mut self) -> Result<(), Error>;

    fn disconnect(&mut self) -> Result<(), Error>;

    fn start_scanning(&mut self) -> Result<(), Error>;

    fn stop_scanning(&mut self) -> Result<(), Error>;

    /// Delivers pending events from backends that have to be polled; a no-op for the others.
    fn poll(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn get_info(&mut self) -> Result<ReaderInfo, Error>;

    /// Block-level access to the tag with the given UID.
    fn tag_channel(&mut self, uid: &[u8]) -> Result<Box<dyn TagChannel + '_>, Error>;

    /// ISO 7816 access to the card with the given UID.
    fn card_channel(&mut self, uid: &[u8]) -> Result<Box<dyn SmartCard + '_>, Error>;

    fn read(&mut self, tag: &mut NfcTag, key_a: &[u8; 6], presence: &Presence) -> Result<TagContent, Error> {
        let mut channel = self.tag_channel(&tag.uid)?;
        read_tag(&mut *channel, tag, key_a, presence)
    }

    fn write(
        &mut self,
        tag: &mut NfcTag,
        request: &WriteRequest,
        key_a: &[u8; 6],
        presence: &Presence,
    ) -> Result<(), Error> {
        let mut channel = self.tag_channel(&tag.uid)?;
        write_tag(&mut *channel, tag, request, key_a, presence)
    }

    fn format(&mut self, tag: &mut NfcTag, key_a: &[u8; 6], presence: &Presence) -> Result<(), Error> {
        let mut channel = self.tag_channel(&tag.uid)?;
        format_tag(&mut *channel, tag, key_a, presence)
    }

    fn lock(
        &mut self,
        tag: &mut NfcTag,
        key_a: &[u8; 6],
        options: &LockOptions,
        presence: &Presence,
    ) -> Result<(), Error> {
        let mut channel = self.tag_channel(&tag.uid)?;
        lock_tag(&mut *channel, tag, key_a, options, presence)
    }

    /// Sends a raw command to a tag; the response includes the status word.
    fn send_command(&mut self, tag: &NfcTag, command: &[u8]) -> Result<Vec<u8>, Error> {
        let mut channel = self.tag_channel(&tag.uid)?;
        channel.transmit(command)
    }
}
impl<A: ReaderAdapter + ?Sized> ReaderAdapter for Box<A> {
    fn kind(&self) -> AdapterKind { (**self).kind() }
    fn subscribe(&mut self) -> Receiver<AdapterEvent> { (**self).subscribe() }
    fn connect(&mut self) -> Result<(), Error> { (**self).connect() }
    fn disconnect(&mut self) -> Result<(), Error> { (**self).disconnect() }
    fn start_scanning(&mut self) -> Result<(), Error> { (**self).start_scanning() }
    fn stop_scanning(&mut self) -> Result<(), Error> { (**self).stop_scanning() }
    fn poll(&mut self) -> Result<(), Error> { (**self).poll() }
    fn get_info(&mut self) -> Result<ReaderInfo, Error> { (**self).get_info() }

    fn tag_channel(&mut self, uid: &[u8]) -> Result<Box<dyn TagChannel + '_>, Error> {
        (**self).tag_channel(uid)
    }

    fn card_channel(&mut self, uid: &[u8]) -> Result<Box<dyn SmartCard + '_>, Error> {
        (**self).card_channel(uid)
    }

    fn read(&mut self, tag: &mut NfcTag, key_a: &[u8; 6], presence: &Presence) -> Result<TagContent, Error> {
        (**self).read(tag, key_a, presence)
    }

    fn write(&mut self, tag: &mut NfcTag, request: &WriteRequest, key_a: &[u8; 6], presence: &Presence) -> Result<(), Error> {
        (**self).write(tag, request, key_a, presence)
    }

    fn format(&mut self, tag: &mut NfcTag, key_a: &[u8; 6], presence: &Presence) -> Result<(), Error> {
        (**self).format(tag, key_a, presence)
    }

    fn lock(&mut self, tag: &mut NfcTag, key_a: &[u8; 6], options: &LockOptions, presence: &Presence) -> Result<(), Error> {
        (**self).lock(tag, key_a, options, presence)
    }

    fn send_command(&mut self, tag: &NfcTag, command: &[u8]) -> Result<Vec<u8>, Error> {
        (**self).send_command(tag, command)
    }
}


/// A smart card that refuses to talk once its tag has left the field.
pub struct PresentCard<SC> {
    card: SC,
    presence: Presence,
}
impl<SC: SmartCard> PresentCard<SC> {
    pub fn new(card: SC, presence: Presence) -> Self {
        Self { card, presence }
    }
}
impl<SC: SmartCard> SmartCard for PresentCard<SC> {
    fn communicate(
        &mut self,
        request: &crate::iso7816::apdu::Apdu,
    ) -> Result<crate::iso7816::apdu::Response, crate::iso7816::card::CommunicationError> {
        self.presence.ensure_present()?;
        self.card.communicate(request)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::iso7816::apdu::{Apdu, CommandHeader, Data, Response};
    use crate::iso7816::card::CommunicationError;

    #[test]
    fn test_adapter_from_config() {
        let mut config = EngineConfig::default();
        config.adapter = AdapterKind::Mock;
        assert_eq!(from_config(&config).unwrap().kind(), AdapterKind::Mock);
        config.adapter = AdapterKind::WebNfc;
        assert_eq!(from_config(&config).unwrap().kind(), AdapterKind::WebNfc);
        config.adapter = AdapterKind::Serial;
        assert_eq!(from_config(&config).unwrap().kind(), AdapterKind::Serial);
    }

    struct Echo;
    impl SmartCard for Echo {
        fn communicate(&mut self, _request: &Apdu) -> Result<Response, CommunicationError> {
            Ok(Response::status(0x9000))
        }
    }

    #[test]
    fn test_present_card_refuses_after_removal() {
        let presence = Presence::new();
        let mut card = PresentCard::new(Echo, presence.clone());
        let request = Apdu {
            header: CommandHeader::new(0x00, 0x84, 0x00, 0x00),
            data: Data::ResponseDataShort { response_data_length: 8 },
        };
        assert!(card.communicate(&request).is_ok());
        presence.mark_removed();
        assert!(matches!(card.communicate(&request), Err(CommunicationError::CardRemoved)));
    }
}

//! NDEF-only access through a Web NFC host.
//!
//! The browser (or whatever embeds the crate) owns the actual `NDEFReader`. It forwards readings
//! and the permission state through a [`WebNfcHost`] handle and drains the writes the adapter
//! queued. Only NDEF messages are visible this way; blocks, raw commands and locking are not.


use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::adapter::{
    emit, AdapterEvent, AdapterKind, Capability, ReaderAdapter, ReaderInfo, TagDescriptor,
};
use crate::error::{Error, ErrorKind, UnitError};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::presence::Presence;
use crate::tag::{NfcTag, TagType};
use crate::tag::ndef::{self, Record};
use crate::tag::reader::{TagChannel, TagContent};
use crate::tag::writer::{ensure_writable, LockOptions, WriteRequest};


/// How long a read waits for the host to deliver a reading of the tag.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

pub const WEB_NFC_READER_NAME: &str = "Web NFC";


/// State of the `nfc` permission as reported by the host.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PermissionState {
    Granted,
    Denied,

    /// The user will be asked once scanning starts.
    #[default]
    Prompt,
}
impl fmt::Display for PermissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Granted => write!(f, "granted"),
            Self::Denied => write!(f, "denied"),
            Self::Prompt => write!(f, "prompt"),
        }
    }
}


/// An NDEF message the host has to write to a tag.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingWrite {
    pub uid: Vec<u8>,
    pub records: Vec<Record>,
}


/// Turns a Web NFC serial number (`04:a2:3b:...`) into UID bytes.
pub fn parse_serial_number(serial_number: &str) -> Option<Vec<u8>> {
    let digits: String = serial_number.split(':').collect();
    hex::decode(digits).ok()
}


#[derive(Default)]
struct BridgeState {
    available: bool,
    permission: PermissionState,
    connected: bool,
    scanning: bool,
    events: Option<Sender<AdapterEvent>>,

    /// The latest message read from each tag.
    readings: BTreeMap<Vec<u8>, Vec<Record>>,

    presences: BTreeMap<Vec<u8>, Presence>,
    outbox: VecDeque<PendingWrite>,
}


struct Bridge {
    state: Mutex<BridgeState>,
    reading_arrived: Condvar,
}
impl Bridge {
    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}


/// The host's end of a [`WebNfcAdapter`].
#[derive(Clone)]
pub struct WebNfcHost {
    bridge: Arc<Bridge>,
}
impl WebNfcHost {
    /// Declares whether the host supports Web NFC at all.
    pub fn set_available(&self, available: bool) {
        self.bridge.lock().available = available;
    }

    pub fn set_permission(&self, permission: PermissionState) {
        debug!("Web NFC permission is now {}", permission);
        self.bridge.lock().permission = permission;
    }

    /// Delivers a message read from a tag; ignored unless the adapter is scanning.
    pub fn push_reading(&self, uid: Vec<u8>, records: Vec<Record>) {
        let mut state = self.bridge.lock();
        if !state.scanning {
            debug!("ignoring reading of {} while not scanning", hex::encode_upper(&uid));
            return;
        }

        // every reading is a new tap; whatever was going on with the previous one is over
        let presence = Presence::new();
        if let Some(previous) = state.presences.insert(uid.clone(), presence.clone()) {
            previous.mark_removed();
        }
        state.readings.insert(uid.clone(), records);
        info!("NDEF tag {} read by the host", hex::encode_upper(&uid));
        emit(&mut state.events, AdapterEvent::TagDiscovered(TagDescriptor {
            uid,
            atr: Vec::new(),
            tag_type: Some(TagType::Ndef),
            reader: WEB_NFC_READER_NAME.to_owned(),
            presence,
        }));
        drop(state);
        self.bridge.reading_arrived.notify_all();
    }

    /// Delivers an encoded NDEF message read from a tag.
    pub fn push_message(&self, uid: Vec<u8>, message: &[u8]) -> Result<(), ndef::Error> {
        let records = ndef::decode_message(message)?;
        self.push_reading(uid, records);
        Ok(())
    }

    /// Reports a failed reading (`readingerror`).
    pub fn reading_error(&self, message: &str) {
        warn!("Web NFC reading failed: {}", message);
        let mut state = self.bridge.lock();
        emit(&mut state.events, AdapterEvent::Error(UnitError::new(ErrorKind::Transport, message)));
    }

    /// Reports that a tag is gone, for hosts that can tell.
    pub fn tag_left(&self, uid: &[u8]) {
        let mut state = self.bridge.lock();
        state.readings.remove(uid);
        if let Some(presence) = state.presences.remove(uid) {
            presence.mark_removed();
            emit(&mut state.events, AdapterEvent::TagRemoved { uid: uid.to_vec() });
        }
    }

    /// Takes the writes queued since the last call.
    pub fn take_writes(&self) -> Vec<PendingWrite> {
        self.bridge.lock().outbox.drain(..).collect()
    }
}


/// A reader bridged from a Web NFC host.
pub struct WebNfcAdapter {
    bridge: Arc<Bridge>,
    read_timeout: Duration,
}
impl WebNfcAdapter {
    pub fn new() -> Self {
        Self::with_read_timeout(DEFAULT_READ_TIMEOUT)
    }

    pub fn with_read_timeout(read_timeout: Duration) -> Self {
        Self {
            bridge: Arc::new(Bridge {
                state: Mutex::new(BridgeState::default()),
                reading_arrived: Condvar::new(),
            }),
            read_timeout,
        }
    }

    /// The handle the host feeds readings through.
    pub fn host(&self) -> WebNfcHost {
        WebNfcHost { bridge: Arc::clone(&self.bridge) }
    }

    fn connected_state(&self) -> Result<MutexGuard<'_, BridgeState>, Error> {
        let state = self.bridge.lock();
        if !state.connected {
            return Err(Error::from(CommunicationError::NotConnected));
        }
        Ok(state)
    }

    fn queue_write(&mut self, tag: &mut NfcTag, records: Vec<Record>, presence: &Presence) -> Result<(), Error> {
        ensure_writable(tag)?;
        presence.ensure_present()?;
        // refuse what could not be encoded before the host sees it
        ndef::encode_message(&records)?;

        let mut state = self.connected_state()?;
        state.outbox.push_back(PendingWrite { uid: tag.uid.clone(), records: records.clone() });
        debug!("queued NDEF message with {} records for {}", records.len(), tag.uid_hex());
        tag.ndef_records = Some(records);
        Ok(())
    }
}
impl Default for WebNfcAdapter {
    fn default() -> Self {
        Self::new()
    }
}
impl ReaderAdapter for WebNfcAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::WebNfc
    }

    fn subscribe(&mut self) -> Receiver<AdapterEvent> {
        let (sender, receiver) = mpsc::channel();
        self.bridge.lock().events = Some(sender);
        receiver
    }

    fn connect(&mut self) -> Result<(), Error> {
        let mut state = self.bridge.lock();
        if !state.available {
            return Err(Error::Unsupported("Web NFC is not available on this host".to_owned()));
        }
        if state.permission == PermissionState::Denied {
            return Err(Error::Permission("NFC permission denied".to_owned()));
        }
        if !state.connected {
            state.connected = true;
            emit(&mut state.events, AdapterEvent::ReaderConnected { reader: WEB_NFC_READER_NAME.to_owned() });
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        let mut state = self.bridge.lock();
        if state.connected {
            state.connected = false;
            state.scanning = false;
            for presence in std::mem::take(&mut state.presences).values() {
                presence.mark_removed();
            }
            state.readings.clear();
            emit(&mut state.events, AdapterEvent::ReaderDisconnected { reader: WEB_NFC_READER_NAME.to_owned() });
        }
        drop(state);
        // wake up reads waiting for a tag that will not come
        self.bridge.reading_arrived.notify_all();
        Ok(())
    }

    fn start_scanning(&mut self) -> Result<(), Error> {
        let mut state = self.connected_state()?;
        if state.permission == PermissionState::Denied {
            return Err(Error::Permission("NFC permission denied".to_owned()));
        }
        state.scanning = true;
        Ok(())
    }

    fn stop_scanning(&mut self) -> Result<(), Error> {
        self.bridge.lock().scanning = false;
        Ok(())
    }

    fn get_info(&mut self) -> Result<ReaderInfo, Error> {
        let state = self.bridge.lock();
        Ok(ReaderInfo {
            adapter: AdapterKind::WebNfc,
            version: env!("CARGO_PKG_VERSION").to_owned(),
            readers: vec![WEB_NFC_READER_NAME.to_owned()],
            capabilities: vec![Capability::NdefRead, Capability::NdefWrite],
            available: state.available,
            details: BTreeMap::from([("permission".to_owned(), state.permission.to_string())]),
        })
    }

    fn tag_channel(&mut self, _uid: &[u8]) -> Result<Box<dyn TagChannel + '_>, Error> {
        Err(Error::Unsupported("block-level access through Web NFC".to_owned()))
    }

    fn card_channel(&mut self, _uid: &[u8]) -> Result<Box<dyn SmartCard + '_>, Error> {
        Err(Error::Unsupported("ISO 7816 commands through Web NFC".to_owned()))
    }

    /// Returns the latest message the host read from the tag, waiting for one if there is none.
    fn read(&mut self, tag: &mut NfcTag, _key_a: &[u8; 6], presence: &Presence) -> Result<TagContent, Error> {
        let state = self.connected_state()?;
        let (state, _) = self.bridge.reading_arrived
            .wait_timeout_while(state, self.read_timeout, |state| {
                state.connected && presence.is_present() && !state.readings.contains_key(&tag.uid)
            })
            .unwrap_or_else(PoisonError::into_inner);
        presence.ensure_present()?;
        if !state.connected {
            return Err(Error::from(CommunicationError::NotConnected));
        }

        let Some(records) = state.readings.get(&tag.uid).cloned() else {
            let timeout_ms = u64::try_from(self.read_timeout.as_millis()).unwrap_or(u64::MAX);
            return Err(Error::from(CommunicationError::Timeout { timeout_ms }));
        };
        tag.ndef_records = Some(records.clone());
        Ok(TagContent::Ndef { records })
    }

    fn write(
        &mut self,
        tag: &mut NfcTag,
        request: &WriteRequest,
        _key_a: &[u8; 6],
        presence: &Presence,
    ) -> Result<(), Error> {
        match request {
            WriteRequest::Ndef(records) => self.queue_write(tag, records.clone(), presence),
            WriteRequest::Blocks(_) => Err(Error::Unsupported("block writes through Web NFC".to_owned())),
        }
    }

    /// Overwrites the tag with an empty NDEF message.
    fn format(&mut self, tag: &mut NfcTag, _key_a: &[u8; 6], presence: &Presence) -> Result<(), Error> {
        self.queue_write(tag, Vec::new(), presence)
    }

    fn lock(
        &mut self,
        _tag: &mut NfcTag,
        _key_a: &[u8; 6],
        _options: &LockOptions,
        _presence: &Presence,
    ) -> Result<(), Error> {
        Err(Error::Unsupported("locking through Web NFC".to_owned()))
    }

    fn send_command(&mut self, _tag: &NfcTag, _command: &[u8]) -> Result<Vec<u8>, Error> {
        Err(Error::Unsupported("raw commands through Web NFC".to_owned()))
    }
}


#[cfg(test)]
mod tests {
    use std::thread;

    use hex_literal::hex;
    use super::*;

    fn ready_adapter(read_timeout: Duration) -> (WebNfcAdapter, WebNfcHost, Receiver<AdapterEvent>) {
        let mut adapter = WebNfcAdapter::with_read_timeout(read_timeout);
        let host = adapter.host();
        host.set_available(true);
        host.set_permission(PermissionState::Granted);
        let events = adapter.subscribe();
        adapter.connect().unwrap();
        adapter.start_scanning().unwrap();
        (adapter, host, events)
    }

    fn ndef_tag(uid: &[u8]) -> NfcTag {
        NfcTag::with_type(uid.to_vec(), Vec::new(), TagType::Ndef)
    }

    #[test]
    fn test_serial_number() {
        assert_eq!(parse_serial_number("04:a2:3b:1c:6d:80:00"), Some(hex!("04A23B1C6D8000").to_vec()));
        assert_eq!(parse_serial_number("deadbeef"), Some(hex!("DEADBEEF").to_vec()));
        assert_eq!(parse_serial_number("04:zz"), None);
    }

    #[test]
    fn test_connect_requires_permission() {
        let mut adapter = WebNfcAdapter::new();
        let host = adapter.host();
        assert!(matches!(adapter.connect(), Err(Error::Unsupported(_))));

        host.set_available(true);
        host.set_permission(PermissionState::Denied);
        let error = adapter.connect().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Permission);

        host.set_permission(PermissionState::Prompt);
        adapter.connect().unwrap();
        let info = adapter.get_info().unwrap();
        assert_eq!(info.capabilities, vec![Capability::NdefRead, Capability::NdefWrite]);
        assert_eq!(info.details.get("permission").map(String::as_str), Some("prompt"));
    }

    #[test]
    fn test_reading_is_discovered_and_read() {
        let (mut adapter, host, events) = ready_adapter(Duration::from_millis(100));
        assert!(matches!(events.try_recv(), Ok(AdapterEvent::ReaderConnected { .. })));

        let uid = hex!("04A23B1C6D8000").to_vec();
        let records = vec![Record::uri("https://example.com"), Record::text("hi", "en").unwrap()];
        host.push_message(uid.clone(), &ndef::encode_message(&records).unwrap()).unwrap();

        let Ok(AdapterEvent::TagDiscovered(descriptor)) = events.try_recv() else {
            panic!("no discovery");
        };
        assert_eq!(descriptor.tag_type, Some(TagType::Ndef));
        let mut tag = descriptor.to_tag();
        let content = adapter.read(&mut tag, &crate::tag::DEFAULT_KEY, &descriptor.presence).unwrap();
        assert_eq!(content, TagContent::Ndef { records: records.clone() });
        assert_eq!(tag.ndef_records, Some(records));

        // a second tap replaces the first one
        host.push_reading(uid.clone(), Vec::new());
        assert!(!descriptor.presence.is_present());
        assert!(matches!(events.try_recv(), Ok(AdapterEvent::TagDiscovered(_))));
    }

    #[test]
    fn test_read_waits_for_reading() {
        let (mut adapter, host, _events) = ready_adapter(Duration::from_secs(5));
        let uid = hex!("0102030405060708").to_vec();
        let feeder = {
            let uid = uid.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                host.push_reading(uid, vec![Record::uri("tel:+43123")]);
            })
        };
        let mut tag = ndef_tag(&uid);
        let content = adapter.read(&mut tag, &crate::tag::DEFAULT_KEY, &Presence::new()).unwrap();
        feeder.join().unwrap();
        assert_eq!(content, TagContent::Ndef { records: vec![Record::uri("tel:+43123")] });
    }

    #[test]
    fn test_read_times_out() {
        let (mut adapter, _host, _events) = ready_adapter(Duration::from_millis(30));
        let mut tag = ndef_tag(&hex!("01020304"));
        let error = adapter.read(&mut tag, &crate::tag::DEFAULT_KEY, &Presence::new()).unwrap_err();
        assert!(matches!(error, Error::Communication(CommunicationError::Timeout { timeout_ms: 30 })));
    }

    #[test]
    fn test_writes_are_queued() {
        let (mut adapter, host, _events) = ready_adapter(Duration::from_millis(30));
        let mut tag = ndef_tag(&hex!("01020304"));
        let presence = Presence::new();
        let records = vec![Record::uri("https://example.org")];
        adapter.write(&mut tag, &WriteRequest::Ndef(records.clone()), &crate::tag::DEFAULT_KEY, &presence).unwrap();
        adapter.format(&mut tag, &crate::tag::DEFAULT_KEY, &presence).unwrap();
        assert_eq!(tag.ndef_records, Some(Vec::new()));
        assert_eq!(host.take_writes(), vec![
            PendingWrite { uid: hex!("01020304").to_vec(), records },
            PendingWrite { uid: hex!("01020304").to_vec(), records: Vec::new() },
        ]);
        assert!(host.take_writes().is_empty());
    }

    #[test]
    fn test_unsupported_operations() {
        let (mut adapter, _host, _events) = ready_adapter(Duration::from_millis(30));
        let mut tag = ndef_tag(&hex!("01020304"));
        let presence = Presence::new();
        let key = crate::tag::DEFAULT_KEY;
        assert_eq!(
            adapter.write(&mut tag, &WriteRequest::Blocks(vec![(4, vec![0; 4])]), &key, &presence)
                .unwrap_err().kind(),
            ErrorKind::Unsupported,
        );
        assert_eq!(
            adapter.lock(&mut tag, &key, &LockOptions::default(), &presence).unwrap_err().kind(),
            ErrorKind::Unsupported,
        );
        assert_eq!(adapter.send_command(&tag, &hex!("00A4040000")).unwrap_err().kind(), ErrorKind::Unsupported);
        assert!(adapter.card_channel(&tag.uid).is_err());
    }

    #[test]
    fn test_reading_error_and_removal() {
        let (_adapter, host, events) = ready_adapter(Duration::from_millis(30));
        let _ = events.try_recv();
        host.reading_error("tag lost");
        match events.try_recv() {
            Ok(AdapterEvent::Error(error)) => assert_eq!(error.kind, ErrorKind::Transport),
            other => panic!("unexpected {:?}", other),
        }

        host.push_reading(hex!("0A0B").to_vec(), Vec::new());
        let Ok(AdapterEvent::TagDiscovered(descriptor)) = events.try_recv() else {
            panic!("no discovery");
        };
        host.tag_left(&hex!("0A0B"));
        assert!(!descriptor.presence.is_present());
        assert!(matches!(events.try_recv(), Ok(AdapterEvent::TagRemoved { .. })));
    }
}

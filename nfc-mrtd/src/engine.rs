//! The loop that turns reader events into card sessions.
//!
//! The engine owns an adapter and the receiving end of its event channel. Every tag in the field
//! gets a slot that moves from present to (optionally) authenticated and is discarded, together
//! with its secure messaging keys, as soon as the adapter reports the tag gone.


use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use tracing::{debug, info, instrument, warn};

use crate::adapter::{AdapterEvent, ReaderAdapter, TagDescriptor};
use crate::config::EngineConfig;
use crate::error::{Error, UnitError};
use crate::iso7816::card::CommunicationError;
use crate::iso7816::file::{select_application, MRTD_APPLICATION_ID};
use crate::passport::{self, read_files, AccessKey, Authenticated, PassportData};
use crate::presence::Presence;
use crate::secure_messaging::{SecureChannel, SecureMessagingSession};
use crate::tag::{NfcTag, TagType};
use crate::tag::reader::TagContent;
use crate::tag::writer::{LockOptions, WriteRequest};


#[derive(Clone, Debug)]
pub enum EngineEvent {
    ReaderConnected { reader: String },
    ReaderDisconnected { reader: String },
    CardDetected { uid: Vec<u8>, tag_type: TagType, reader: String },
    CardRemoved { uid: Vec<u8> },
    Authenticated { uid: Vec<u8>, method: Authenticated },
    PassportRead { uid: Vec<u8>, data: Box<PassportData> },
    TagRead { uid: Vec<u8>, tag: Box<NfcTag>, content: TagContent },

    /// A failure; `uid` is unset if it concerns the reader rather than a card.
    Error { uid: Option<Vec<u8>>, error: UnitError },
}


pub trait EngineObserver: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}


/// Writes every event to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;
impl EngineObserver for TracingObserver {
    fn on_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::ReaderConnected { reader } => info!(reader = %reader, "reader connected"),
            EngineEvent::ReaderDisconnected { reader } => info!(reader = %reader, "reader disconnected"),
            EngineEvent::CardDetected { uid, tag_type, reader } => {
                info!(uid = %hex::encode_upper(uid), tag_type = %tag_type, reader = %reader, "card detected");
            },
            EngineEvent::CardRemoved { uid } => info!(uid = %hex::encode_upper(uid), "card removed"),
            EngineEvent::Authenticated { uid, method } => {
                info!(uid = %hex::encode_upper(uid), method = ?method, "card authenticated");
            },
            EngineEvent::PassportRead { uid, data } => {
                info!(
                    uid = %hex::encode_upper(uid),
                    data_groups = data.data_groups.len(),
                    "passport read",
                );
            },
            EngineEvent::TagRead { uid, tag, .. } => {
                info!(uid = %hex::encode_upper(uid), tag_type = %tag.tag_type, blocks = tag.blocks.len(), "tag read");
            },
            EngineEvent::Error { uid: Some(uid), error } => warn!(uid = %hex::encode_upper(uid), "{}", error),
            EngineEvent::Error { uid: None, error } => warn!("{}", error),
        }
    }
}


/// Forwards every event into a channel.
pub struct ChannelObserver {
    sender: Mutex<Sender<EngineEvent>>,
}
impl ChannelObserver {
    pub fn new() -> (Self, Receiver<EngineEvent>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender: Mutex::new(sender) }, receiver)
    }
}
impl EngineObserver for ChannelObserver {
    fn on_event(&self, event: &EngineEvent) {
        if let Ok(sender) = self.sender.lock() {
            // a receiver that went away is not our problem
            let _ = sender.send(event.clone());
        }
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SlotPhase {
    Empty,
    Present,
    Authenticated,
}


struct Slot {
    tag: NfcTag,
    reader: String,
    presence: Presence,
    session: Option<(Authenticated, SecureMessagingSession)>,
}


fn emit_to(observers: &[Box<dyn EngineObserver>], event: &EngineEvent) {
    for observer in observers {
        observer.on_event(event);
    }
}

fn card_removed() -> Error {
    Error::from(CommunicationError::CardRemoved)
}


pub struct Engine<A> {
    adapter: A,
    events: Receiver<AdapterEvent>,
    config: EngineConfig,
    key_a: [u8; 6],
    access_key: Option<AccessKey>,
    observers: Vec<Box<dyn EngineObserver>>,
    slots: BTreeMap<Vec<u8>, Slot>,
}
impl<A: ReaderAdapter> Engine<A> {
    pub fn new(mut adapter: A, config: EngineConfig) -> Result<Self, Error> {
        config.validate()?;
        let key_a = config.mifare_key_a()?;
        let events = adapter.subscribe();
        Ok(Self {
            adapter,
            events,
            config,
            key_a,
            access_key: None,
            observers: Vec::new(),
            slots: BTreeMap::new(),
        })
    }

    pub fn add_observer<O: EngineObserver + 'static>(&mut self, observer: O) {
        self.observers.push(Box::new(observer));
    }

    /// Sets the key used to unlock passports that are read automatically.
    pub fn set_access_key(&mut self, access_key: Option<AccessKey>) {
        self.access_key = access_key;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut A {
        &mut self.adapter
    }

    /// The tag in the field with the given UID, as far as it has been read.
    pub fn tag(&self, uid: &[u8]) -> Option<&NfcTag> {
        self.slots.get(uid).map(|slot| &slot.tag)
    }

    pub fn present_uids(&self) -> Vec<Vec<u8>> {
        self.slots.keys().cloned().collect()
    }

    pub fn slot_phase(&self, uid: &[u8]) -> SlotPhase {
        match self.slots.get(uid) {
            None => SlotPhase::Empty,
            Some(Slot { session: Some(_), .. }) => SlotPhase::Authenticated,
            Some(_) => SlotPhase::Present,
        }
    }

    fn emit(&self, event: EngineEvent) {
        emit_to(&self.observers, &event);
    }

    fn emit_error(&self, uid: &[u8], error: &Error) {
        self.emit(EngineEvent::Error { uid: Some(uid.to_vec()), error: UnitError::from(error) });
    }

    /// Connects to the reader and starts watching for tags.
    pub fn start(&mut self) -> Result<(), Error> {
        self.adapter.connect()?;
        self.adapter.start_scanning()?;
        info!("{} adapter started", self.adapter.kind());
        Ok(())
    }

    /// Stops watching, disconnects and forgets every tag.
    pub fn stop(&mut self) -> Result<(), Error> {
        self.adapter.stop_scanning()?;
        self.adapter.disconnect()?;
        if let Err(e) = self.drain() {
            debug!("event channel closed while stopping: {}", e);
        }
        let uids = self.present_uids();
        for uid in uids {
            self.drop_slot(&uid);
        }
        Ok(())
    }

    /// Handles every event that is already waiting. Returns the number of events handled.
    pub fn process_pending(&mut self) -> Result<usize, Error> {
        self.adapter.poll()?;
        self.drain()
    }

    /// Waits up to `timeout` for events and handles them.
    ///
    /// Returns as soon as at least one event has been handled; returns zero if none arrived.
    pub fn run_once(&mut self, timeout: Duration) -> Result<usize, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let handled = self.process_pending()?;
            if handled > 0 {
                return Ok(handled);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            let wait = (deadline - now).min(self.config.poll_interval());
            match self.events.recv_timeout(wait) {
                Ok(event) => {
                    self.handle(event);
                    return Ok(1 + self.drain()?);
                },
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(Error::from(CommunicationError::NotConnected)),
            }
        }
    }

    /// Handles events until `stop` is set.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), Error> {
        let interval = self.config.poll_interval();
        while !stop.load(Ordering::SeqCst) {
            self.run_once(interval)?;
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<usize, Error> {
        let mut handled = 0;
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    self.handle(event);
                    handled += 1;
                },
                Err(TryRecvError::Empty) => return Ok(handled),
                Err(TryRecvError::Disconnected) => {
                    return if handled > 0 {
                        Ok(handled)
                    } else {
                        Err(Error::from(CommunicationError::NotConnected))
                    };
                },
            }
        }
    }

    fn handle(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::ReaderConnected { reader } => {
                self.emit(EngineEvent::ReaderConnected { reader });
            },
            AdapterEvent::ReaderDisconnected { reader } => {
                let gone: Vec<Vec<u8>> = self.slots.iter()
                    .filter(|(_, slot)| slot.reader == reader)
                    .map(|(uid, _)| uid.clone())
                    .collect();
                for uid in gone {
                    self.drop_slot(&uid);
                }
                self.emit(EngineEvent::ReaderDisconnected { reader });
            },
            AdapterEvent::TagDiscovered(descriptor) => self.card_detected(descriptor),
            AdapterEvent::TagRemoved { uid } => {
                if !self.drop_slot(&uid) {
                    debug!("removal of unknown tag {}", hex::encode_upper(&uid));
                }
            },
            AdapterEvent::Error(error) => {
                self.emit(EngineEvent::Error { uid: None, error });
            },
        }
    }

    fn card_detected(&mut self, descriptor: TagDescriptor) {
        let uid = descriptor.uid.clone();
        if let Some(previous) = self.slots.remove(&uid) {
            debug!("tag {} rediscovered, dropping its previous session", hex::encode_upper(&uid));
            previous.presence.mark_removed();
        }

        let tag = descriptor.to_tag();
        let tag_type = tag.tag_type;
        self.slots.insert(uid.clone(), Slot {
            tag,
            reader: descriptor.reader.clone(),
            presence: descriptor.presence,
            session: None,
        });
        self.emit(EngineEvent::CardDetected { uid: uid.clone(), tag_type, reader: descriptor.reader });

        if !self.config.auto_read {
            return;
        }
        // failures have already been reported as events
        let result = if tag_type.may_be_smart_card() && self.access_key.is_some() {
            self.read_passport(&uid).map(|_| ())
        } else {
            self.read_tag(&uid).map(|_| ())
        };
        if let Err(e) = result {
            debug!("automatic read of {} failed: {}", hex::encode_upper(&uid), e);
        }
    }

    /// Forgets a tag and its session keys. Returns whether the tag was known.
    fn drop_slot(&mut self, uid: &[u8]) -> bool {
        match self.slots.remove(uid) {
            Some(slot) => {
                slot.presence.mark_removed();
                if slot.session.is_some() {
                    debug!("discarding session keys of {}", hex::encode_upper(uid));
                }
                self.emit(EngineEvent::CardRemoved { uid: uid.to_vec() });
                true
            },
            None => false,
        }
    }

    /// Unlocks the passport with the given UID, replacing any session it already has.
    #[instrument(skip_all, fields(uid = %hex::encode_upper(uid)))]
    pub fn authenticate(&mut self, uid: &[u8], access_key: &AccessKey) -> Result<Authenticated, Error> {
        let slot = self.slots.get_mut(uid)
            .ok_or_else(card_removed)?;
        slot.session = None;

        let result = establish(&mut self.adapter, uid, access_key, &self.config);
        match result {
            Ok((authenticated, session)) => {
                slot.session = Some((authenticated, session));
                emit_to(&self.observers, &EngineEvent::Authenticated { uid: uid.to_vec(), method: authenticated });
                Ok(authenticated)
            },
            Err(e) => {
                self.emit_error(uid, &e);
                Err(e)
            },
        }
    }

    /// Reads the passport with the given UID.
    ///
    /// An existing session is reused; otherwise the access key set with
    /// [`Engine::set_access_key`] is used to establish one, and without an access key the files
    /// are read in plain.
    #[instrument(skip_all, fields(uid = %hex::encode_upper(uid)))]
    pub fn read_passport(&mut self, uid: &[u8]) -> Result<PassportData, Error> {
        let result = self.read_passport_files(uid);
        match &result {
            Ok(data) => self.emit(EngineEvent::PassportRead { uid: uid.to_vec(), data: Box::new(data.clone()) }),
            Err(e) => self.emit_error(uid, e),
        }
        result
    }

    fn read_passport_files(&mut self, uid: &[u8]) -> Result<PassportData, Error> {
        let slot = self.slots.get_mut(uid)
            .ok_or_else(card_removed)?;
        let presence = slot.presence.clone();

        let session = match slot.session.take() {
            Some(session) => Some(session),
            None => match &self.access_key {
                Some(access_key) => {
                    let (authenticated, session) = establish(&mut self.adapter, uid, access_key, &self.config)?;
                    emit_to(&self.observers, &EngineEvent::Authenticated { uid: uid.to_vec(), method: authenticated });
                    Some((authenticated, session))
                },
                None => None,
            },
        };

        let mut card = self.adapter.card_channel(uid)?;
        match session {
            Some((authenticated, session)) => {
                let mut channel = SecureChannel::new(&mut *card, session);
                let result = read_files(&mut channel, &presence);
                let (_, session) = channel.into_parts();
                // the send sequence counter may be out of step after a failure
                let mut data = result?;
                slot.session = Some((authenticated, session));
                data.authenticated = Some(authenticated);
                Ok(data)
            },
            None => {
                select_application(&mut *card, &MRTD_APPLICATION_ID)?;
                read_files(&mut *card, &presence)
            },
        }
    }

    /// Reads the tag with the given UID according to its technology.
    pub fn read_tag(&mut self, uid: &[u8]) -> Result<TagContent, Error> {
        let slot = self.slots.get_mut(uid)
            .ok_or_else(card_removed)?;
        match self.adapter.read(&mut slot.tag, &self.key_a, &slot.presence) {
            Ok(content) => {
                emit_to(&self.observers, &EngineEvent::TagRead {
                    uid: uid.to_vec(),
                    tag: Box::new(slot.tag.clone()),
                    content: content.clone(),
                });
                Ok(content)
            },
            Err(e) => {
                self.emit_error(uid, &e);
                Err(e)
            },
        }
    }

    pub fn write_tag(&mut self, uid: &[u8], request: &WriteRequest) -> Result<(), Error> {
        let slot = self.slots.get_mut(uid)
            .ok_or_else(card_removed)?;
        let result = self.adapter.write(&mut slot.tag, request, &self.key_a, &slot.presence);
        self.report(uid, result)
    }

    pub fn format_tag(&mut self, uid: &[u8]) -> Result<(), Error> {
        let slot = self.slots.get_mut(uid)
            .ok_or_else(card_removed)?;
        let result = self.adapter.format(&mut slot.tag, &self.key_a, &slot.presence);
        self.report(uid, result)
    }

    pub fn lock_tag(&mut self, uid: &[u8], options: &LockOptions) -> Result<(), Error> {
        let slot = self.slots.get_mut(uid)
            .ok_or_else(card_removed)?;
        let result = self.adapter.lock(&mut slot.tag, &self.key_a, options, &slot.presence);
        self.report(uid, result)
    }

    pub fn send_command(&mut self, uid: &[u8], command: &[u8]) -> Result<Vec<u8>, Error> {
        let slot = self.slots.get(uid)
            .ok_or_else(card_removed)?;
        let result = self.adapter.send_command(&slot.tag, command);
        self.report(uid, result)
    }

    fn report<T>(&self, uid: &[u8], result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &result {
            self.emit_error(uid, e);
        }
        result
    }
}


fn establish<A: ReaderAdapter>(
    adapter: &mut A,
    uid: &[u8],
    access_key: &AccessKey,
    config: &EngineConfig,
) -> Result<(Authenticated, SecureMessagingSession), Error> {
    let mut card = adapter.card_channel(uid)?;
    select_application(&mut *card, &MRTD_APPLICATION_ID)?;
    passport::authenticate(&mut *card, access_key, config.auth_method, &mut OsRng)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::{MockAdapter, SimulatedTag};
    use crate::adapter::mock::passport::EmulatedPassport;
    use crate::der_util::encode_tlv;
    use crate::error::ErrorKind;
    use crate::mrz::MrzInfo;
    use crate::tag::ndef::Record;

    const DG1_MRZ: &str = "P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<L898902C36UTO7408122F1204159ZE184226B<<<<<10";

    fn mrz_info() -> MrzInfo {
        MrzInfo::new("L898902C3", "740812", "120415").unwrap()
    }

    fn dg1() -> Vec<u8> {
        let mut inner = Vec::new();
        encode_tlv(&mut inner, &[0x5F, 0x1F], DG1_MRZ.as_bytes());
        let mut outer = Vec::new();
        encode_tlv(&mut outer, &[0x61], &inner);
        outer
    }

    fn passport_tag(uid: Vec<u8>) -> SimulatedTag {
        let chip = EmulatedPassport::with_seed(11)
            .with_bac(&mrz_info())
            .with_com(&[1])
            .with_data_group(1, dg1());
        SimulatedTag::passport(uid, chip)
    }

    fn engine(auto_read: bool) -> (Engine<MockAdapter>, Receiver<EngineEvent>) {
        let config = EngineConfig {
            auto_read,
            poll_interval_ms: 10,
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(MockAdapter::new(), config).unwrap();
        let (observer, events) = ChannelObserver::new();
        engine.add_observer(observer);
        engine.start().unwrap();
        engine.process_pending().unwrap();
        (engine, events)
    }

    #[test]
    fn test_invalid_config_refused() {
        let config = EngineConfig {
            poll_interval_ms: 0,
            ..EngineConfig::default()
        };
        let error = Engine::new(MockAdapter::new(), config).err().unwrap();
        assert_eq!(error.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_discovery_reads_tag() {
        let (mut engine, events) = engine(true);
        assert!(matches!(events.try_recv(), Ok(EngineEvent::ReaderConnected { .. })));

        let uid = vec![0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
        let records = vec![Record::text("hi", "en").unwrap()];
        let tag = SimulatedTag::type2(TagType::Ntag213, uid.clone(), &records).unwrap();
        engine.adapter_mut().place_tag(tag);
        assert_eq!(engine.run_once(Duration::from_millis(100)).unwrap(), 1);

        match events.try_recv() {
            Ok(EngineEvent::CardDetected { uid: detected, tag_type, .. }) => {
                assert_eq!(detected, uid);
                assert_eq!(tag_type, TagType::Ntag213);
            },
            other => panic!("unexpected {:?}", other),
        }
        match events.try_recv() {
            Ok(EngineEvent::TagRead { content: TagContent::Type2 { ndef, .. }, tag, .. }) => {
                assert_eq!(ndef, Some(Ok(records.clone())));
                assert_eq!(tag.ndef_records, Some(records));
            },
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(engine.slot_phase(&uid), SlotPhase::Present);
    }

    #[test]
    fn test_no_auto_read() {
        let (mut engine, events) = engine(false);
        let _ = events.try_recv();

        let uid = vec![0xDE, 0xAD, 0xBE, 0xEF];
        engine.adapter_mut().place_tag(SimulatedTag::classic_1k(uid.clone()));
        engine.process_pending().unwrap();
        assert!(matches!(events.try_recv(), Ok(EngineEvent::CardDetected { .. })));
        assert!(events.try_recv().is_err());

        let content = engine.read_tag(&uid).unwrap();
        assert!(matches!(content, TagContent::Classic { .. }));
        assert!(matches!(events.try_recv(), Ok(EngineEvent::TagRead { .. })));
    }

    #[test]
    fn test_passport_read_with_access_key() {
        let (mut engine, events) = engine(true);
        let _ = events.try_recv();
        engine.set_access_key(Some(AccessKey::from(mrz_info())));

        let uid = vec![0x08, 0x01, 0x02, 0x03];
        engine.adapter_mut().place_tag(passport_tag(uid.clone()));
        engine.process_pending().unwrap();

        assert!(matches!(events.try_recv(), Ok(EngineEvent::CardDetected { .. })));
        assert!(matches!(events.try_recv(), Ok(EngineEvent::Authenticated { method: Authenticated::Bac, .. })));
        match events.try_recv() {
            Ok(EngineEvent::PassportRead { data, .. }) => {
                assert_eq!(data.authenticated, Some(Authenticated::Bac));
                assert_eq!(data.mrz().unwrap().document_number(), "L898902C3");
            },
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(engine.slot_phase(&uid), SlotPhase::Authenticated);

        // the established session is reused
        let again = engine.read_passport(&uid).unwrap();
        assert!(again.mrz().is_some());
        assert!(matches!(events.try_recv(), Ok(EngineEvent::PassportRead { .. })));
    }

    #[test]
    fn test_wrong_access_key_reported() {
        let (mut engine, events) = engine(false);
        let _ = events.try_recv();

        let uid = vec![0x08, 0x0A, 0x0B, 0x0C];
        engine.adapter_mut().place_tag(passport_tag(uid.clone()));
        engine.process_pending().unwrap();
        let _ = events.try_recv();

        let wrong = AccessKey::from(MrzInfo::new("L898902C3", "740812", "120416").unwrap());
        let error = engine.authenticate(&uid, &wrong).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Authentication);
        match events.try_recv() {
            Ok(EngineEvent::Error { uid: Some(failed), error }) => {
                assert_eq!(failed, uid);
                assert_eq!(error.kind, ErrorKind::Authentication);
            },
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(engine.slot_phase(&uid), SlotPhase::Present);
    }

    #[test]
    fn test_removal_drops_session() {
        let (mut engine, events) = engine(false);
        let _ = events.try_recv();

        let uid = vec![0x08, 0x04, 0x05, 0x06];
        let presence = engine.adapter_mut().place_tag(passport_tag(uid.clone()));
        engine.process_pending().unwrap();
        let _ = events.try_recv();

        let method = engine.authenticate(&uid, &AccessKey::from(mrz_info())).unwrap();
        assert_eq!(method, Authenticated::Bac);
        assert_eq!(engine.slot_phase(&uid), SlotPhase::Authenticated);
        assert!(matches!(events.try_recv(), Ok(EngineEvent::Authenticated { .. })));

        engine.adapter_mut().remove_tag(&uid);
        assert!(!presence.is_present());
        engine.process_pending().unwrap();
        assert!(matches!(events.try_recv(), Ok(EngineEvent::CardRemoved { uid: removed }) if removed == uid));
        assert_eq!(engine.slot_phase(&uid), SlotPhase::Empty);

        let error = engine.read_passport(&uid).unwrap_err();
        assert!(error.is_card_removed());
    }

    #[test]
    fn test_stop_forgets_tags() {
        let (mut engine, events) = engine(false);
        let _ = events.try_recv();

        let uid = vec![0x01, 0x02, 0x03, 0x04];
        engine.adapter_mut().place_tag(SimulatedTag::classic_1k(uid.clone()));
        engine.process_pending().unwrap();
        assert_eq!(engine.present_uids(), vec![uid.clone()]);

        engine.stop().unwrap();
        assert!(engine.present_uids().is_empty());
        let remaining: Vec<EngineEvent> = events.try_iter().collect();
        assert!(remaining.iter().any(|e| matches!(e, EngineEvent::ReaderDisconnected { .. })));
        assert!(remaining.iter().any(|e| matches!(e, EngineEvent::CardRemoved { .. })));
    }

    #[test]
    fn test_run_once_times_out() {
        let (mut engine, _events) = engine(true);
        assert_eq!(engine.run_once(Duration::from_millis(30)).unwrap(), 0);
    }
}

//! Readers reached through the PC/SC service (pcsc-lite, WinSCard).
//!
//! A scanning thread blocks in `SCardGetStatusChange` on every watched reader plus the
//! plug-and-play pseudo-reader, and reports cards arriving and leaving. The UID of a new card is
//! fetched with the `GET DATA` pseudo-APDU of PC/SC storage card readers.


use std::collections::{BTreeMap, BTreeSet};
use std::ffi::{CStr, CString};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pcsc::{Context, Protocols, ReaderState, Scope, ShareMode, State};
use tracing::{debug, info, instrument, warn};

use crate::adapter::{
    emit, AdapterEvent, AdapterKind, Capability, PresentCard, ReaderAdapter, ReaderInfo,
    TagDescriptor,
};
use crate::config::EngineConfig;
use crate::error::{Error, UnitError};
use crate::iso7816::apdu::{Apdu, CommandHeader, Data, Response};
use crate::iso7816::card::{transmit_raw, CommunicationError, SmartCard};
use crate::presence::Presence;
use crate::tag::reader::{ApduTagChannel, TagChannel};


/// Maps PC/SC failures; a card that went away is reported as such.
fn communication_error(error: pcsc::Error) -> CommunicationError {
    match error {
        pcsc::Error::RemovedCard|pcsc::Error::NoSmartcard|pcsc::Error::ResetCard => CommunicationError::CardRemoved,
        pcsc::Error::ReaderUnavailable|pcsc::Error::UnknownReader => CommunicationError::NotConnected,
        other => CommunicationError::Backend(Box::new(other)),
    }
}

/// Maps failures to reach the PC/SC service itself.
fn service_error(error: pcsc::Error) -> Error {
    match error {
        pcsc::Error::NoService|pcsc::Error::ServiceStopped|pcsc::Error::NoAccess => {
            Error::Permission(format!("PC/SC service unavailable: {}", error))
        },
        other => Error::from(communication_error(other)),
    }
}


/// A connected card; `transmit` only needs a shared reference.
struct PcscCard<'a> {
    card: &'a pcsc::Card,
}
impl<'a> SmartCard for PcscCard<'a> {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        let mut receive_buffer = vec![0u8; pcsc::MAX_BUFFER_SIZE_EXTENDED];
        transmit_raw(request, |bytes| {
            self.card.transmit(bytes, &mut receive_buffer)
                .map(|response| response.to_vec())
                .map_err(communication_error)
        })
    }
}


fn read_uid(context: &Context, reader: &CStr) -> Result<Vec<u8>, CommunicationError> {
    let card = context.connect(reader, ShareMode::Shared, Protocols::ANY)
        .map_err(communication_error)?;
    let get_uid = Apdu::new(
        CommandHeader::new(0xFF, 0xCA, 0x00, 0x00),
        Data::ResponseDataShort { response_data_length: 0 },
    );
    let response = PcscCard { card: &card }.communicate(&get_uid)?;
    if !response.is_success() {
        return Err(CommunicationError::Reader(format!(
            "GET DATA (UID) failed with response code 0x{:04X}", response.trailer.to_word(),
        )));
    }
    Ok(response.data)
}


fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}


struct Slot {
    reader: CString,
    presence: Presence,
}


/// State the adapter shares with the scanning thread.
#[derive(Default)]
struct Shared {
    events: Mutex<Option<Sender<AdapterEvent>>>,
    readers: Mutex<BTreeSet<String>>,

    /// Cards in the field by UID.
    slots: Mutex<BTreeMap<Vec<u8>, Slot>>,
}
impl Shared {
    fn emit(&self, event: AdapterEvent) {
        emit(&mut lock(&self.events), event);
    }

    fn report(&self, error: Error) {
        self.emit(AdapterEvent::Error(UnitError::from(&error)));
    }

    fn reader_appeared(&self, reader: &CStr) {
        let name = reader.to_string_lossy().into_owned();
        if lock(&self.readers).insert(name.clone()) {
            info!("reader {:?} appeared", name);
            self.emit(AdapterEvent::ReaderConnected { reader: name });
        }
    }

    fn reader_vanished(&self, reader: &CStr) {
        self.card_left(reader);
        let name = reader.to_string_lossy().into_owned();
        if lock(&self.readers).remove(&name) {
            info!("reader {:?} vanished", name);
            self.emit(AdapterEvent::ReaderDisconnected { reader: name });
        }
    }

    fn has_card(&self, reader: &CStr) -> bool {
        lock(&self.slots).values().any(|slot| slot.reader.as_c_str() == reader)
    }

    fn card_arrived(&self, context: &Context, reader: &CStr, atr: &[u8]) {
        let uid = match read_uid(context, reader) {
            Ok(uid) => uid,
            Err(e) => {
                warn!("failed to obtain UID of card in {:?}: {}", reader, e);
                self.report(Error::from(e));
                return;
            },
        };

        let presence = Presence::new();
        lock(&self.slots).insert(uid.clone(), Slot { reader: reader.to_owned(), presence: presence.clone() });
        info!("card {} entered {:?}", hex::encode_upper(&uid), reader);
        self.emit(AdapterEvent::TagDiscovered(TagDescriptor {
            uid,
            atr: atr.to_vec(),
            tag_type: None,
            reader: reader.to_string_lossy().into_owned(),
            presence,
        }));
    }

    fn card_left(&self, reader: &CStr) {
        let removed: Vec<Vec<u8>> = {
            let mut slots = lock(&self.slots);
            let uids: Vec<Vec<u8>> = slots.iter()
                .filter(|(_, slot)| slot.reader.as_c_str() == reader)
                .map(|(uid, _)| uid.clone())
                .collect();
            for uid in &uids {
                if let Some(slot) = slots.remove(uid) {
                    slot.presence.mark_removed();
                }
            }
            uids
        };
        for uid in removed {
            info!("card {} left {:?}", hex::encode_upper(&uid), reader);
            self.emit(AdapterEvent::TagRemoved { uid });
        }
    }

    fn forget_everything(&self) {
        for slot in std::mem::take(&mut *lock(&self.slots)).values() {
            slot.presence.mark_removed();
        }
        let readers = std::mem::take(&mut *lock(&self.readers));
        for reader in readers {
            self.emit(AdapterEvent::ReaderDisconnected { reader });
        }
    }
}


fn reader_wanted(filter: Option<&str>, reader: &CStr) -> bool {
    match filter {
        Some(wanted) => reader.to_string_lossy() == wanted,
        None => true,
    }
}


fn watch_readers(
    context: Context,
    filter: Option<String>,
    interval: Duration,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
) {
    let mut states = vec![ReaderState::new(pcsc::PNP_NOTIFICATION(), State::UNAWARE)];
    while !stop.load(Ordering::Acquire) {
        // readers that were unplugged
        for state in &states {
            if state.name() != pcsc::PNP_NOTIFICATION()
                    && state.event_state().intersects(State::UNKNOWN | State::IGNORE) {
                shared.reader_vanished(state.name());
            }
        }
        states.retain(|state| !state.event_state().intersects(State::UNKNOWN | State::IGNORE));

        match context.list_readers_owned() {
            Ok(readers) => {
                for reader in readers {
                    if reader_wanted(filter.as_deref(), &reader)
                            && !states.iter().any(|state| state.name() == reader.as_c_str()) {
                        shared.reader_appeared(&reader);
                        states.push(ReaderState::new(reader, State::UNAWARE));
                    }
                }
            },
            Err(pcsc::Error::NoReadersAvailable) => {},
            Err(e) => {
                warn!("failed to list readers: {}", e);
                shared.report(service_error(e));
                return;
            },
        }

        for state in &mut states {
            state.sync_current_state();
        }
        match context.get_status_change(Some(interval), &mut states) {
            Ok(()) => {},
            Err(pcsc::Error::Timeout) => continue,
            Err(pcsc::Error::Cancelled) => break,
            Err(e) => {
                warn!("waiting for reader changes failed: {}", e);
                shared.report(service_error(e));
                return;
            },
        }

        for state in &states {
            if state.name() == pcsc::PNP_NOTIFICATION() {
                continue;
            }
            let present = state.event_state().contains(State::PRESENT)
                && !state.event_state().contains(State::MUTE);
            match (present, shared.has_card(state.name())) {
                (true, false) => shared.card_arrived(&context, state.name(), state.atr()),
                (false, true) => shared.card_left(state.name()),
                _ => {},
            }
        }
    }
    debug!("stopped watching readers");
}


struct Scanner {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}


/// A PC/SC reader (or all of them).
pub struct PcscAdapter {
    reader_filter: Option<String>,
    poll_interval: Duration,
    context: Option<Context>,
    shared: Arc<Shared>,
    scanner: Option<Scanner>,

    /// Open connections by UID, with the presence they were opened under.
    cards: BTreeMap<Vec<u8>, (Presence, pcsc::Card)>,
}
impl PcscAdapter {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            reader_filter: config.pcsc.reader.clone(),
            poll_interval: config.poll_interval(),
            context: None,
            shared: Arc::new(Shared::default()),
            scanner: None,
            cards: BTreeMap::new(),
        }
    }

    /// Lists the names of the readers known to the PC/SC service.
    pub fn list_readers(&self) -> Result<Vec<String>, Error> {
        let owned_context;
        let context = match &self.context {
            Some(context) => context,
            None => {
                owned_context = Context::establish(Scope::User).map_err(service_error)?;
                &owned_context
            },
        };
        match context.list_readers_owned() {
            Ok(readers) => Ok(readers.iter().map(|reader| reader.to_string_lossy().into_owned()).collect()),
            Err(pcsc::Error::NoReadersAvailable) => Ok(Vec::new()),
            Err(e) => Err(service_error(e)),
        }
    }

    /// Connects to the card with the given UID, reusing the connection while it stays in the field.
    fn card(&mut self, uid: &[u8]) -> Result<(&pcsc::Card, Presence), Error> {
        let context = self.context.as_ref()
            .ok_or(Error::from(CommunicationError::NotConnected))?;
        let (reader, presence) = {
            let slots = lock(&self.shared.slots);
            let slot = slots.get(uid)
                .ok_or(Error::from(CommunicationError::CardRemoved))?;
            (slot.reader.clone(), slot.presence.clone())
        };
        presence.ensure_present()?;

        self.cards.retain(|_, (cached, _)| cached.is_present());
        if !self.cards.contains_key(uid) {
            debug!("connecting to card {} in {:?}", hex::encode_upper(uid), reader);
            let card = context.connect(&reader, ShareMode::Shared, Protocols::ANY)
                .map_err(communication_error)?;
            self.cards.insert(uid.to_vec(), (presence.clone(), card));
        }
        let (_, card) = self.cards.get(uid)
            .ok_or(Error::from(CommunicationError::CardRemoved))?;
        Ok((card, presence))
    }
}
impl ReaderAdapter for PcscAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Pcsc
    }

    fn subscribe(&mut self) -> Receiver<AdapterEvent> {
        let (sender, receiver) = mpsc::channel();
        *lock(&self.shared.events) = Some(sender);
        receiver
    }

    #[instrument(skip(self))]
    fn connect(&mut self) -> Result<(), Error> {
        if self.context.is_some() {
            return Ok(());
        }
        let context = Context::establish(Scope::User)
            .map_err(service_error)?;
        self.context = Some(context);
        let readers = self.list_readers()?;
        info!("PC/SC service knows {} readers", readers.len());
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        self.stop_scanning()?;
        self.cards.clear();
        self.context = None;
        self.shared.forget_everything();
        Ok(())
    }

    fn start_scanning(&mut self) -> Result<(), Error> {
        if self.scanner.is_some() {
            return Ok(());
        }
        let context = self.context.clone()
            .ok_or(Error::from(CommunicationError::NotConnected))?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let shared = Arc::clone(&self.shared);
        let filter = self.reader_filter.clone();
        let interval = self.poll_interval;
        let thread = thread::Builder::new()
            .name("pcsc-scanner".to_owned())
            .spawn(move || watch_readers(context, filter, interval, shared, thread_stop))
            .map_err(CommunicationError::from)?;
        self.scanner = Some(Scanner { stop, thread });
        Ok(())
    }

    fn stop_scanning(&mut self) -> Result<(), Error> {
        let Some(scanner) = self.scanner.take() else {
            return Ok(());
        };
        scanner.stop.store(true, Ordering::Release);
        if let Some(context) = &self.context {
            if let Err(e) = context.cancel() {
                debug!("failed to cancel the status wait: {}", e);
            }
        }
        if scanner.thread.join().is_err() {
            warn!("scanning thread panicked");
        }
        Ok(())
    }

    fn get_info(&mut self) -> Result<ReaderInfo, Error> {
        let (available, readers) = match self.list_readers() {
            Ok(readers) => (true, readers),
            Err(Error::Permission(message)) => {
                debug!("{}", message);
                (false, Vec::new())
            },
            Err(e) => return Err(e),
        };
        let mut details = BTreeMap::new();
        if let Some(filter) = &self.reader_filter {
            details.insert("reader".to_owned(), filter.clone());
        }
        Ok(ReaderInfo {
            adapter: AdapterKind::Pcsc,
            version: env!("CARGO_PKG_VERSION").to_owned(),
            readers,
            capabilities: vec![
                Capability::Read, Capability::Write, Capability::Format, Capability::Lock,
                Capability::RawCommands, Capability::SmartCard,
            ],
            available,
            details,
        })
    }

    fn tag_channel(&mut self, uid: &[u8]) -> Result<Box<dyn TagChannel + '_>, Error> {
        let (card, presence) = self.card(uid)?;
        Ok(Box::new(ApduTagChannel::new(PresentCard::new(PcscCard { card }, presence))))
    }

    fn card_channel(&mut self, uid: &[u8]) -> Result<Box<dyn SmartCard + '_>, Error> {
        let (card, presence) = self.card(uid)?;
        Ok(Box::new(PresentCard::new(PcscCard { card }, presence)))
    }
}
impl Drop for PcscAdapter {
    fn drop(&mut self) {
        if let Err(e) = self.stop_scanning() {
            debug!("failed to stop scanning: {}", e);
        }
    }
}

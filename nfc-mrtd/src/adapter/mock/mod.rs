//! An adapter backed by simulated tags, for tests and demonstrations.
//!
//! Tags are placed into and removed from the field by the caller; the adapter reports both as
//! events, exactly like a hardware reader would.


pub mod passport;


use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};

use tracing::debug;

use crate::adapter::{
    emit, AdapterEvent, AdapterKind, Capability, PresentCard, ReaderAdapter, ReaderInfo,
    TagDescriptor,
};
use crate::adapter::mock::passport::EmulatedPassport;
use crate::error::Error;
use crate::iso7816::apdu::{Apdu, Response, ResponseTrailer};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::presence::Presence;
use crate::tag::{
    CLASSIC_BLOCK_SIZE, DEFAULT_KEY, FIRST_USER_PAGE, PAGE_SIZE, TagType, Technology,
    is_sector_trailer, sector_block_count, sector_first_block, sector_of_block,
};
use crate::tag::ndef::{self, Record};
use crate::tag::reader::{KeyType, TagChannel};
use crate::tag::writer::DEFAULT_ACCESS_BITS;


pub const MOCK_READER_NAME: &str = "Mock Reader";

const SW_AUTHENTICATION_FAILED: u16 = 0x6300;
const SW_SECURITY_STATUS_NOT_SATISFIED: u16 = 0x6982;
const SW_FUNCTION_NOT_SUPPORTED: u16 = 0x6A81;
const SW_NOT_FOUND: u16 = 0x6A82;
const SW_WRONG_LENGTH: u16 = 0x6700;

const DESFIRE_OK: [u8; 2] = [0x91, 0x00];
const DESFIRE_MORE: [u8; 2] = [0x91, 0xAF];
const DESFIRE_ILLEGAL_COMMAND: [u8; 2] = [0x91, 0x1C];

const DESFIRE_HARDWARE_VERSION: [u8; 7] = [0x04, 0x01, 0x01, 0x01, 0x00, 0x18, 0x05];
const DESFIRE_SOFTWARE_VERSION: [u8; 7] = [0x04, 0x01, 0x01, 0x01, 0x04, 0x18, 0x05];


/// An ATR under which the tag type is recognized again.
fn simulated_atr(tag_type: TagType) -> Vec<u8> {
    let hex = match tag_type {
        TagType::MifareClassic1K => "3B8F8001804F0CA0000003060300010000000000",
        TagType::MifareClassic4K => "3B8F0003180002",
        TagType::MifareUltralight => "3B8F8001804F0CA0000000440000000000000000",
        TagType::Ntag213 => "3B8F8001804F0CA00000030603F0110000000000",
        TagType::Ntag215 => "3B8F8001804F0CA00000030603F0120000000000",
        TagType::Ntag216 => "3B8F8001804F0CA00000030603F0130000000000",
        TagType::Desfire => "3B8180018044036A",
        TagType::Generic => "3B888001E1F35E1177839500",
        TagType::Ndef|TagType::Unknown => "",
    };
    hex::decode(hex).unwrap_or_default()
}


/// Size byte of the capability container of a Type 2 tag.
fn capability_container_size(tag_type: TagType) -> u8 {
    match tag_type {
        TagType::MifareUltralight => 0x06,
        TagType::Ntag213 => 0x12,
        TagType::Ntag215 => 0x3E,
        TagType::Ntag216 => 0x6D,
        _ => 0x00,
    }
}


struct DesfireImage {
    applications: Vec<[u8; 3]>,
    production: [u8; 14],
    pending_frames: VecDeque<Vec<u8>>,
}


/// A tag held in memory.
pub struct SimulatedTag {
    uid: Vec<u8>,
    atr: Vec<u8>,
    tag_type: TagType,
    memory: BTreeMap<u16, Vec<u8>>,
    sector_keys: BTreeMap<u8, [u8; 6]>,
    authenticated_sector: Option<u8>,
    desfire: Option<DesfireImage>,
    passport: Option<EmulatedPassport>,
}
impl SimulatedTag {
    fn empty(uid: Vec<u8>, tag_type: TagType) -> Self {
        Self {
            atr: simulated_atr(tag_type),
            uid,
            tag_type,
            memory: BTreeMap::new(),
            sector_keys: BTreeMap::new(),
            authenticated_sector: None,
            desfire: None,
            passport: None,
        }
    }

    /// A factory-fresh MIFARE Classic 1K tag: zeroed data blocks, transport keys.
    pub fn classic_1k(uid: Vec<u8>) -> Self {
        Self::classic(uid, TagType::MifareClassic1K)
    }

    /// A factory-fresh MIFARE Classic 4K tag.
    pub fn classic_4k(uid: Vec<u8>) -> Self {
        Self::classic(uid, TagType::MifareClassic4K)
    }

    fn classic(uid: Vec<u8>, tag_type: TagType) -> Self {
        let mut tag = Self::empty(uid, tag_type);
        let sector_count = tag_type.sector_count().unwrap_or(16);
        for sector in 0..sector_count {
            let first = sector_first_block(sector);
            for block in first..first + sector_block_count(sector) {
                let data = if block == 0 {
                    let mut manufacturer = tag.uid.clone();
                    manufacturer.push(tag.uid.iter().fold(0, |bcc, b| bcc ^ b));
                    manufacturer.resize(CLASSIC_BLOCK_SIZE, 0x00);
                    manufacturer
                } else if is_sector_trailer(block) {
                    trailer(&DEFAULT_KEY, &DEFAULT_ACCESS_BITS, &DEFAULT_KEY)
                } else {
                    vec![0x00; CLASSIC_BLOCK_SIZE]
                };
                tag.memory.insert(block, data);
            }
        }
        tag
    }

    /// Protects a MIFARE Classic sector with a different key A.
    pub fn with_sector_key(mut self, sector: u8, key_a: [u8; 6]) -> Self {
        self.sector_keys.insert(sector, key_a);
        self
    }

    /// Fills a MIFARE Classic data block (or any block of a generic tag).
    pub fn with_block(mut self, block: u16, data: Vec<u8>) -> Self {
        self.memory.insert(block, data);
        self
    }

    /// A Type 2 tag (Ultralight or NTAG) holding an NDEF message; no records means no message.
    pub fn type2(tag_type: TagType, uid: Vec<u8>, records: &[Record]) -> Result<Self, Error> {
        let (Some(page_count), Some((first_page, last_page))) = (tag_type.page_count(), tag_type.ndef_pages()) else {
            return Err(Error::InvalidRequest(format!("{} is not a Type 2 tag", tag_type)));
        };
        let mut tag = Self::empty(uid, tag_type);

        let mut header = tag.uid.clone();
        header.resize(3 * PAGE_SIZE, 0x00);
        header[2 * PAGE_SIZE..].copy_from_slice(&[0x00, 0x48, 0x00, 0x00]);
        for (chunk, page) in header.chunks(PAGE_SIZE).zip(0u16..) {
            tag.memory.insert(page, chunk.to_vec());
        }
        tag.memory.insert(3, vec![0xE1, 0x10, capability_container_size(tag_type), 0x00]);

        let mut area = if records.is_empty() {
            Vec::new()
        } else {
            ndef::wrap_tlv(&ndef::encode_message(records)?)?
        };
        let area_size = usize::from(last_page - first_page + 1) * PAGE_SIZE;
        if area.len() > area_size {
            return Err(Error::InvalidRequest(format!(
                "NDEF message needs {} bytes, tag holds {}", area.len(), area_size,
            )));
        }
        area.resize(usize::from(page_count - FIRST_USER_PAGE) * PAGE_SIZE, 0x00);
        for (chunk, page) in area.chunks(PAGE_SIZE).zip(FIRST_USER_PAGE..) {
            tag.memory.insert(page, chunk.to_vec());
        }
        Ok(tag)
    }

    /// A DESFire tag with the given applications (besides the PICC level).
    pub fn desfire(uid: Vec<u8>, applications: Vec<[u8; 3]>) -> Self {
        let mut production = [0u8; 14];
        for (target, source) in production.iter_mut().zip(uid.iter()).take(7) {
            *target = *source;
        }
        production[12] = 0x10;
        production[13] = 0x09;
        let mut tag = Self::empty(uid, TagType::Desfire);
        tag.desfire = Some(DesfireImage {
            applications,
            production,
            pending_frames: VecDeque::new(),
        });
        tag
    }

    /// An ISO 14443 tag with plain 16-byte blocks.
    pub fn generic(uid: Vec<u8>, blocks: Vec<[u8; 16]>) -> Self {
        let mut tag = Self::empty(uid, TagType::Generic);
        for (block, data) in (0u16..).zip(blocks) {
            tag.memory.insert(block, data.to_vec());
        }
        tag
    }

    /// An ISO 14443-4 card carrying an eMRTD application.
    pub fn passport(uid: Vec<u8>, chip: EmulatedPassport) -> Self {
        let mut tag = Self::empty(uid, TagType::Generic);
        tag.passport = Some(chip);
        tag
    }

    pub fn uid(&self) -> &[u8] {
        &self.uid
    }

    pub fn tag_type(&self) -> TagType {
        self.tag_type
    }

    /// The current contents of a block or page.
    pub fn block(&self, number: u16) -> Option<&[u8]> {
        self.memory.get(&number).map(|data| data.as_slice())
    }

    fn status(operation: &'static str, status: u16) -> Error {
        Error::Status { operation, status }
    }

    fn sector_key(&self, sector: u8) -> [u8; 6] {
        self.sector_keys.get(&sector).copied().unwrap_or(DEFAULT_KEY)
    }

    /// Whether page 2 carries set static lock bytes.
    fn type2_locked(&self) -> bool {
        self.memory.get(&2)
            .map(|page| page.len() == PAGE_SIZE && page[2] == 0xFF && page[3] == 0xFF)
            .unwrap_or(false)
    }

    fn check_access(&self, block: u16, operation: &'static str) -> Result<(), Error> {
        if self.tag_type.technology() == Technology::MifareClassic
                && self.authenticated_sector != Some(sector_of_block(block)) {
            return Err(Self::status(operation, SW_SECURITY_STATUS_NOT_SATISFIED));
        }
        Ok(())
    }

    fn desfire_transmit(image: &mut DesfireImage, request: &Apdu) -> Vec<u8> {
        let mut frame = match request.header.ins {
            0x5A => return DESFIRE_OK.to_vec(),
            0x60 => {
                image.pending_frames.clear();
                image.pending_frames.push_back(DESFIRE_SOFTWARE_VERSION.to_vec());
                image.pending_frames.push_back(image.production.to_vec());
                DESFIRE_HARDWARE_VERSION.to_vec()
            },
            0xAF => match image.pending_frames.pop_front() {
                Some(frame) => frame,
                None => return DESFIRE_ILLEGAL_COMMAND.to_vec(),
            },
            0x6A => image.applications.iter().flatten().copied().collect(),
            _ => return DESFIRE_ILLEGAL_COMMAND.to_vec(),
        };
        if image.pending_frames.is_empty() {
            frame.extend_from_slice(&DESFIRE_OK);
        } else {
            frame.extend_from_slice(&DESFIRE_MORE);
        }
        frame
    }
}
impl TagChannel for SimulatedTag {
    fn authenticate(&mut self, block: u16, key_type: KeyType, key: &[u8; 6]) -> Result<(), Error> {
        if self.tag_type.technology() != Technology::MifareClassic {
            return Err(Self::status("GENERAL AUTHENTICATE", SW_FUNCTION_NOT_SUPPORTED));
        }
        let sector = sector_of_block(block);
        let expected = match key_type {
            KeyType::A => self.sector_key(sector),
            KeyType::B => {
                let trailer_block = sector_first_block(sector) + sector_block_count(sector) - 1;
                self.memory.get(&trailer_block)
                    .and_then(|trailer| trailer.get(10..16))
                    .and_then(|key_b| <[u8; 6]>::try_from(key_b).ok())
                    .unwrap_or(DEFAULT_KEY)
            },
        };
        if &expected != key {
            self.authenticated_sector = None;
            return Err(Self::status("GENERAL AUTHENTICATE", SW_AUTHENTICATION_FAILED));
        }
        self.authenticated_sector = Some(sector);
        Ok(())
    }

    fn read_block(&mut self, block: u16, length: u8) -> Result<Vec<u8>, Error> {
        self.check_access(block, "READ BINARY")?;
        let data = self.memory.get(&block)
            .ok_or(Self::status("READ BINARY", SW_NOT_FOUND))?;
        let mut data = data.clone();
        if self.tag_type.technology() == Technology::MifareClassic && is_sector_trailer(block) {
            // key A never reads back
            data[..6].fill(0x00);
        }
        if length > 0 {
            data.truncate(usize::from(length));
        }
        Ok(data)
    }

    fn write_block(&mut self, block: u16, data: &[u8]) -> Result<(), Error> {
        self.check_access(block, "UPDATE BINARY")?;
        match self.tag_type.technology() {
            Technology::MifareClassic => {
                if data.len() != CLASSIC_BLOCK_SIZE {
                    return Err(Self::status("UPDATE BINARY", SW_WRONG_LENGTH));
                }
                if block == 0 {
                    return Err(Self::status("UPDATE BINARY", SW_SECURITY_STATUS_NOT_SATISFIED));
                }
                if is_sector_trailer(block) {
                    let mut key_a = [0u8; 6];
                    key_a.copy_from_slice(&data[..6]);
                    self.sector_keys.insert(sector_of_block(block), key_a);
                }
            },
            Technology::Type2 => {
                if data.len() != PAGE_SIZE {
                    return Err(Self::status("UPDATE BINARY", SW_WRONG_LENGTH));
                }
                if block < 2 || (block >= FIRST_USER_PAGE && self.type2_locked()) {
                    return Err(Self::status("UPDATE BINARY", SW_SECURITY_STATUS_NOT_SATISFIED));
                }
            },
            _ => {},
        }
        if !self.memory.contains_key(&block) && self.tag_type.technology() != Technology::Generic {
            return Err(Self::status("UPDATE BINARY", SW_NOT_FOUND));
        }
        self.memory.insert(block, data.to_vec());
        Ok(())
    }

    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, Error> {
        let request = Apdu::from_bytes(command)
            .ok_or_else(|| Error::InvalidRequest(format!("malformed command APDU {}", hex::encode_upper(command))))?;
        if let Some(image) = self.desfire.as_mut() {
            return Ok(Self::desfire_transmit(image, &request));
        }
        if let Some(chip) = self.passport.as_mut() {
            return Ok(chip.communicate(&request)?.to_bytes());
        }
        Ok(Response::new(Vec::new(), ResponseTrailer::from_word(SW_FUNCTION_NOT_SUPPORTED)).to_bytes())
    }
}


fn trailer(key_a: &[u8; 6], access_bits: &[u8; 4], key_b: &[u8; 6]) -> Vec<u8> {
    let mut ret = Vec::with_capacity(CLASSIC_BLOCK_SIZE);
    ret.extend_from_slice(key_a);
    ret.extend_from_slice(access_bits);
    ret.extend_from_slice(key_b);
    ret
}


struct FieldEntry {
    tag: SimulatedTag,
    presence: Presence,
}


/// A reader whose field holds simulated tags.
pub struct MockAdapter {
    connected: bool,
    scanning: bool,
    events: Option<Sender<AdapterEvent>>,
    field: BTreeMap<Vec<u8>, FieldEntry>,
}
impl MockAdapter {
    pub fn new() -> Self {
        Self {
            connected: false,
            scanning: false,
            events: None,
            field: BTreeMap::new(),
        }
    }

    fn descriptor(entry: &FieldEntry) -> TagDescriptor {
        TagDescriptor {
            uid: entry.tag.uid.clone(),
            atr: entry.tag.atr.clone(),
            tag_type: Some(entry.tag.tag_type),
            reader: MOCK_READER_NAME.to_owned(),
            presence: entry.presence.clone(),
        }
    }

    /// Brings a tag into the field, replacing one with the same UID.
    pub fn place_tag(&mut self, tag: SimulatedTag) -> Presence {
        let uid = tag.uid.clone();
        self.remove_tag(&uid);

        let entry = FieldEntry { tag, presence: Presence::new() };
        let presence = entry.presence.clone();
        if self.scanning {
            emit(&mut self.events, AdapterEvent::TagDiscovered(Self::descriptor(&entry)));
        }
        debug!("simulated tag {} entered the field", hex::encode_upper(&uid));
        self.field.insert(uid, entry);
        presence
    }

    /// Takes a tag out of the field.
    pub fn remove_tag(&mut self, uid: &[u8]) -> Option<SimulatedTag> {
        let entry = self.field.remove(uid)?;
        entry.presence.mark_removed();
        if self.scanning {
            emit(&mut self.events, AdapterEvent::TagRemoved { uid: uid.to_vec() });
        }
        debug!("simulated tag {} left the field", hex::encode_upper(uid));
        Some(entry.tag)
    }

    pub fn tag(&self, uid: &[u8]) -> Option<&SimulatedTag> {
        self.field.get(uid).map(|entry| &entry.tag)
    }

    fn entry_mut(&mut self, uid: &[u8]) -> Result<&mut FieldEntry, Error> {
        if !self.connected {
            return Err(Error::from(CommunicationError::NotConnected));
        }
        self.field.get_mut(uid)
            .ok_or(Error::from(CommunicationError::CardRemoved))
    }
}
impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}
impl ReaderAdapter for MockAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Mock
    }

    fn subscribe(&mut self) -> Receiver<AdapterEvent> {
        let (sender, receiver) = mpsc::channel();
        self.events = Some(sender);
        receiver
    }

    fn connect(&mut self) -> Result<(), Error> {
        if !self.connected {
            self.connected = true;
            emit(&mut self.events, AdapterEvent::ReaderConnected { reader: MOCK_READER_NAME.to_owned() });
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        if self.connected {
            self.scanning = false;
            self.connected = false;
            for entry in self.field.values() {
                entry.presence.mark_removed();
            }
            emit(&mut self.events, AdapterEvent::ReaderDisconnected { reader: MOCK_READER_NAME.to_owned() });
        }
        Ok(())
    }

    fn start_scanning(&mut self) -> Result<(), Error> {
        if !self.connected {
            return Err(Error::from(CommunicationError::NotConnected));
        }
        if self.scanning {
            return Ok(());
        }
        self.scanning = true;
        for entry in self.field.values_mut() {
            // a tag already lying on the reader counts as newly arrived
            entry.presence = Presence::new();
        }
        let descriptors: Vec<TagDescriptor> = self.field.values()
            .map(Self::descriptor)
            .collect();
        for descriptor in descriptors {
            emit(&mut self.events, AdapterEvent::TagDiscovered(descriptor));
        }
        Ok(())
    }

    fn stop_scanning(&mut self) -> Result<(), Error> {
        self.scanning = false;
        Ok(())
    }

    fn get_info(&mut self) -> Result<ReaderInfo, Error> {
        Ok(ReaderInfo {
            adapter: AdapterKind::Mock,
            version: env!("CARGO_PKG_VERSION").to_owned(),
            readers: vec![MOCK_READER_NAME.to_owned()],
            capabilities: vec![
                Capability::Read, Capability::Write, Capability::Format, Capability::Lock,
                Capability::RawCommands, Capability::SmartCard,
            ],
            available: true,
            details: BTreeMap::from([("tags".to_owned(), self.field.len().to_string())]),
        })
    }

    fn tag_channel(&mut self, uid: &[u8]) -> Result<Box<dyn TagChannel + '_>, Error> {
        let entry = self.entry_mut(uid)?;
        Ok(Box::new(&mut entry.tag))
    }

    fn card_channel(&mut self, uid: &[u8]) -> Result<Box<dyn SmartCard + '_>, Error> {
        let entry = self.entry_mut(uid)?;
        let presence = entry.presence.clone();
        match entry.tag.passport.as_mut() {
            Some(chip) => Ok(Box::new(PresentCard::new(chip, presence))),
            None => Err(Error::Unsupported(format!("{} tags do not speak ISO 7816-4", entry.tag.tag_type))),
        }
    }
}


#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use super::*;
    use crate::tag::NfcTag;
    use crate::tag::reader::TagContent;
    use crate::tag::writer::{LockOptions, WriteRequest};

    fn connected() -> (MockAdapter, Receiver<AdapterEvent>) {
        let mut adapter = MockAdapter::new();
        let events = adapter.subscribe();
        adapter.connect().unwrap();
        adapter.start_scanning().unwrap();
        (adapter, events)
    }

    #[test]
    fn test_events() {
        let (mut adapter, events) = connected();
        assert!(matches!(events.try_recv(), Ok(AdapterEvent::ReaderConnected { .. })));

        let presence = adapter.place_tag(SimulatedTag::classic_1k(vec![1, 2, 3, 4]));
        match events.try_recv() {
            Ok(AdapterEvent::TagDiscovered(descriptor)) => {
                assert_eq!(descriptor.uid, vec![1, 2, 3, 4]);
                assert_eq!(descriptor.to_tag().tag_type, TagType::MifareClassic1K);
                assert_eq!(crate::tag::detect_tag_type(&descriptor.atr), TagType::MifareClassic1K);
            },
            other => panic!("unexpected event {:?}", other),
        }

        adapter.remove_tag(&[1, 2, 3, 4]).unwrap();
        assert!(!presence.is_present());
        assert!(matches!(events.try_recv(), Ok(AdapterEvent::TagRemoved { uid }) if uid == vec![1, 2, 3, 4]));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_simulated_atrs_classify() {
        for tag_type in [
            TagType::MifareClassic1K, TagType::MifareClassic4K, TagType::MifareUltralight,
            TagType::Ntag213, TagType::Ntag215, TagType::Ntag216, TagType::Desfire, TagType::Generic,
        ] {
            assert_eq!(crate::tag::detect_tag_type(&simulated_atr(tag_type)), tag_type);
        }
    }

    #[test]
    fn test_classic_read_with_locked_sector() {
        let (mut adapter, _events) = connected();
        let tag = SimulatedTag::classic_1k(vec![1, 2, 3, 4])
            .with_block(4, b"MIFARE block 4..".to_vec())
            .with_sector_key(5, [0x11; 6]);
        let presence = adapter.place_tag(tag);

        let mut nfc_tag = NfcTag::with_type(vec![1, 2, 3, 4], Vec::new(), TagType::MifareClassic1K);
        let content = adapter.read(&mut nfc_tag, &DEFAULT_KEY, &presence).unwrap();
        let TagContent::Classic { sectors } = content else { panic!("not a Classic readout") };
        assert!(sectors[5].blocks.is_err());
        let sector1 = sectors[1].blocks.as_ref().unwrap();
        assert_eq!(sector1[0].ascii().as_deref(), Some("MIFARE block 4.."));
        // key A reads back as zeros
        assert_eq!(&nfc_tag.blocks[&3][..6], &[0u8; 6]);
        assert_eq!(&nfc_tag.blocks[&0][..5], &hex!("01020304 04"));
    }

    #[test]
    fn test_ntag_write_then_read() {
        let (mut adapter, _events) = connected();
        let uid = hex!("04A1B2C3D4E5F6").to_vec();
        let presence = adapter.place_tag(SimulatedTag::type2(TagType::Ntag215, uid.clone(), &[]).unwrap());

        let mut nfc_tag = NfcTag::with_type(uid.clone(), Vec::new(), TagType::Ntag215);
        let records = vec![Record::text("bonjour", "fr").unwrap(), Record::uri("tel:+41000000")];
        adapter.write(&mut nfc_tag, &WriteRequest::Ndef(records.clone()), &DEFAULT_KEY, &presence).unwrap();

        let mut fresh = NfcTag::with_type(uid, Vec::new(), TagType::Ntag215);
        let content = adapter.read(&mut fresh, &DEFAULT_KEY, &presence).unwrap();
        let TagContent::Type2 { pages, capability_container, ndef } = content else { panic!("not a Type 2 readout") };
        assert_eq!(pages.len(), 135);
        assert_eq!(capability_container.unwrap().memory_size, 496);
        assert_eq!(ndef, Some(Ok(records)));
    }

    #[test]
    fn test_lock_type2() {
        let (mut adapter, _events) = connected();
        let uid = vec![4; 7];
        let presence = adapter.place_tag(SimulatedTag::type2(TagType::MifareUltralight, uid.clone(), &[]).unwrap());
        let mut nfc_tag = NfcTag::with_type(uid.clone(), Vec::new(), TagType::MifareUltralight);
        adapter.lock(&mut nfc_tag, &DEFAULT_KEY, &LockOptions::default(), &presence).unwrap();
        assert!(nfc_tag.is_locked);
        assert_eq!(adapter.tag(&uid).unwrap().block(2), Some(&hex!("00 00 FF FF")[..]));

        // the tag itself now refuses writes, whatever the caller believes
        let mut channel = adapter.tag_channel(&uid).unwrap();
        assert!(channel.write_block(4, &[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn test_classic_lock_changes_keys() {
        let (mut adapter, _events) = connected();
        let uid = vec![9, 8, 7, 6];
        let presence = adapter.place_tag(SimulatedTag::classic_1k(uid.clone()));
        let mut nfc_tag = NfcTag::with_type(uid.clone(), Vec::new(), TagType::MifareClassic1K);
        let options = LockOptions { key_a: [0x42; 6], ..LockOptions::default() };
        adapter.lock(&mut nfc_tag, &DEFAULT_KEY, &options, &presence).unwrap();

        let mut channel = adapter.tag_channel(&uid).unwrap();
        assert!(channel.authenticate(4, KeyType::A, &DEFAULT_KEY).is_err());
        assert!(channel.authenticate(4, KeyType::A, &[0x42; 6]).is_ok());
    }

    #[test]
    fn test_desfire_read() {
        let (mut adapter, _events) = connected();
        let uid = hex!("04112233445566").to_vec();
        let presence = adapter.place_tag(SimulatedTag::desfire(uid.clone(), vec![hex!("F0E0D0")]));
        let mut nfc_tag = NfcTag::with_type(uid, Vec::new(), TagType::Desfire);
        let TagContent::Desfire(data) = adapter.read(&mut nfc_tag, &DEFAULT_KEY, &presence).unwrap() else {
            panic!("not a DESFire readout");
        };
        assert_eq!(data.error, None);
        assert_eq!(data.applications, vec![hex!("F0E0D0")]);
        assert_eq!(data.version.unwrap().software.minor, 0x04);
    }

    #[test]
    fn test_removed_tag_is_unreachable() {
        let (mut adapter, _events) = connected();
        adapter.place_tag(SimulatedTag::generic(vec![1; 4], vec![[0xAA; 16]]));
        adapter.remove_tag(&[1; 4]);
        let err = adapter.tag_channel(&[1; 4]).err().unwrap();
        assert!(err.is_card_removed());
    }

    #[test]
    fn test_card_channel_requires_passport() {
        let (mut adapter, _events) = connected();
        adapter.place_tag(SimulatedTag::generic(vec![1; 4], Vec::new()));
        let err = adapter.card_channel(&[1; 4]).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Unsupported);
    }

    #[test]
    fn test_not_connected() {
        let mut adapter = MockAdapter::new();
        adapter.place_tag(SimulatedTag::generic(vec![1; 4], Vec::new()));
        assert!(adapter.start_scanning().is_err());
        assert!(adapter.tag_channel(&[1; 4]).is_err());
    }
}

//! Technology-specific reading of contactless tags.


use tracing::{debug, instrument, warn};

use crate::error::{Error, UnitError};
use crate::iso7816::apdu::{Apdu, CommandHeader, Data, Response};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::presence::Presence;
use crate::tag::{
    CLASSIC_BLOCK_SIZE, NfcTag, PAGE_SIZE, Technology, sector_block_count, sector_first_block,
};
use crate::tag::ndef::{self, Record};


/// Blocks read from a tag without a more specific layout.
const GENERIC_BLOCK_COUNT: u16 = 16;

const CAPABILITY_CONTAINER_PAGE: u16 = 3;

const DESFIRE_CLA: u8 = 0x90;
const DESFIRE_SELECT_APPLICATION: u8 = 0x5A;
const DESFIRE_GET_VERSION: u8 = 0x60;
const DESFIRE_GET_APPLICATION_IDS: u8 = 0x6A;
const DESFIRE_ADDITIONAL_FRAME: u8 = 0xAF;
const DESFIRE_OK: u16 = 0x9100;
const DESFIRE_MORE: u16 = 0x91AF;

/// Upper bound on additional frames, so a misbehaving card cannot keep us looping.
const DESFIRE_MAX_FRAMES: usize = 32;


/// MIFARE Classic key slot.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum KeyType {
    A,
    B,
}
impl KeyType {
    pub const fn code(&self) -> u8 {
        match self {
            Self::A => 0x60,
            Self::B => 0x61,
        }
    }
}


/// Block-level access to a contactless tag.
pub trait TagChannel {
    /// Authenticates to the sector containing `block` (MIFARE Classic).
    fn authenticate(&mut self, block: u16, key_type: KeyType, key: &[u8; 6]) -> Result<(), Error>;

    fn read_block(&mut self, block: u16, length: u8) -> Result<Vec<u8>, Error>;

    fn write_block(&mut self, block: u16, data: &[u8]) -> Result<(), Error>;

    /// Sends a raw command; the response includes the status word.
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, Error>;
}
impl<C: TagChannel + ?Sized> TagChannel for &mut C {
    fn authenticate(&mut self, block: u16, key_type: KeyType, key: &[u8; 6]) -> Result<(), Error> {
        (**self).authenticate(block, key_type, key)
    }

    fn read_block(&mut self, block: u16, length: u8) -> Result<Vec<u8>, Error> {
        (**self).read_block(block, length)
    }

    fn write_block(&mut self, block: u16, data: &[u8]) -> Result<(), Error> {
        (**self).write_block(block, data)
    }

    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, Error> {
        (**self).transmit(command)
    }
}


/// Tag access through the pseudo-APDUs (class `FF`) of PC/SC storage card readers.
pub struct ApduTagChannel<SC> {
    card: SC,
    key_slot: u8,
}
impl<SC: SmartCard> ApduTagChannel<SC> {
    pub fn new(card: SC) -> Self {
        Self {
            card,
            key_slot: 0x00,
        }
    }

    pub fn into_inner(self) -> SC {
        self.card
    }

    fn exchange(&mut self, operation: &'static str, request: Apdu) -> Result<Response, Error> {
        let response = self.card.communicate(&request)?;
        if !response.is_success() {
            return Err(Error::Status { operation, status: response.trailer.to_word() });
        }
        Ok(response)
    }
}
impl<SC: SmartCard> TagChannel for ApduTagChannel<SC> {
    fn authenticate(&mut self, block: u16, key_type: KeyType, key: &[u8; 6]) -> Result<(), Error> {
        let load_key = Apdu::new(
            CommandHeader::new(0xFF, 0x82, 0x00, self.key_slot),
            Data::RequestDataShort { request_data: key.to_vec() },
        );
        self.exchange("LOAD KEY", load_key)?;

        let [block_high, block_low] = block.to_be_bytes();
        let authenticate = Apdu::new(
            CommandHeader::new(0xFF, 0x86, 0x00, 0x00),
            Data::RequestDataShort {
                request_data: vec![0x01, block_high, block_low, key_type.code(), self.key_slot],
            },
        );
        self.exchange("GENERAL AUTHENTICATE", authenticate)?;
        Ok(())
    }

    fn read_block(&mut self, block: u16, length: u8) -> Result<Vec<u8>, Error> {
        let [p1, p2] = block.to_be_bytes();
        let request = Apdu::new(
            CommandHeader::new(0xFF, 0xB0, p1, p2),
            Data::ResponseDataShort { response_data_length: length },
        );
        let mut response = self.exchange("READ BINARY", request)?;
        // some readers always return four pages of a Type 2 tag
        if length > 0 {
            response.data.truncate(usize::from(length));
        }
        Ok(response.data)
    }

    fn write_block(&mut self, block: u16, data: &[u8]) -> Result<(), Error> {
        let [p1, p2] = block.to_be_bytes();
        let request = Apdu::new(
            CommandHeader::new(0xFF, 0xD6, p1, p2),
            Data::RequestDataShort { request_data: data.to_vec() },
        );
        self.exchange("UPDATE BINARY", request)?;
        Ok(())
    }

    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, Error> {
        let request = Apdu::from_bytes(command)
            .ok_or_else(|| Error::InvalidRequest(format!("malformed command APDU {}", hex::encode_upper(command))))?;
        let response = self.card.communicate(&request)?;
        Ok(response.to_bytes())
    }
}


/// One block or page, or why it could not be read.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct BlockData {
    pub number: u16,
    pub data: Result<Vec<u8>, UnitError>,
}
impl BlockData {
    pub fn ascii(&self) -> Option<String> {
        self.data.as_ref().ok().map(|data| crate::tag::to_ascii(data))
    }
}


#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SectorData {
    pub number: u8,

    /// The blocks of the sector; an error if authentication failed.
    pub blocks: Result<Vec<BlockData>, UnitError>,
}


/// The capability container of a Type 2 tag (page 3).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CapabilityContainer {
    pub magic: u8,
    pub version: u8,

    /// Size of the data area in bytes.
    pub memory_size: usize,

    pub access: u8,
}
impl CapabilityContainer {
    pub fn from_page(page: &[u8]) -> Option<Self> {
        let &[magic, version, size, access, ..] = page else {
            return None;
        };
        Some(Self {
            magic,
            version,
            memory_size: usize::from(size) * 8,
            access,
        })
    }

    /// Whether the write access nibble grants unrestricted writes.
    pub fn is_writable(&self) -> bool {
        self.access & 0x0F == 0x00
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DesfireVersionPart {
    pub vendor: u8,
    pub kind: u8,
    pub subtype: u8,
    pub major: u8,
    pub minor: u8,
    pub storage: u8,
    pub protocol: u8,
}
impl DesfireVersionPart {
    fn from_bytes(bytes: &[u8; 7]) -> Self {
        Self {
            vendor: bytes[0],
            kind: bytes[1],
            subtype: bytes[2],
            major: bytes[3],
            minor: bytes[4],
            storage: bytes[5],
            protocol: bytes[6],
        }
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DesfireVersion {
    pub hardware: DesfireVersionPart,
    pub software: DesfireVersionPart,
}


#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct DesfireData {
    pub version: Option<DesfireVersion>,
    pub applications: Vec<[u8; 3]>,

    /// Set if any of the DESFire commands failed.
    pub error: Option<UnitError>,
}


/// Everything read from a tag, laid out the way its technology organizes memory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TagContent {
    Classic {
        sectors: Vec<SectorData>,
    },
    Type2 {
        pages: Vec<BlockData>,
        capability_container: Option<CapabilityContainer>,

        /// `None` if the tag holds no NDEF message.
        ndef: Option<Result<Vec<Record>, UnitError>>,
    },
    Desfire(DesfireData),
    Generic {
        blocks: Vec<BlockData>,
    },
    Ndef {
        records: Vec<Record>,
    },
}


/// Turns a failure of one unit into an inline error unless the whole read has to stop.
fn isolate<T>(result: Result<T, Error>) -> Result<Result<T, UnitError>, Error> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(e) if e.aborts_session() => Err(e),
        Err(e) => Ok(Err(UnitError::from(&e))),
    }
}


/// Reads a tag according to its technology, recording what was read in `tag`.
///
/// Failures of single sectors, blocks or pages are recorded next to them; only removal of the
/// tag (or a broken channel) aborts the read.
#[instrument(skip_all, fields(uid = %tag.uid_hex(), tag_type = %tag.tag_type))]
pub fn read_tag<C: TagChannel + ?Sized>(
    channel: &mut C,
    tag: &mut NfcTag,
    key_a: &[u8; 6],
    presence: &Presence,
) -> Result<TagContent, Error> {
    match tag.technology() {
        Technology::MifareClassic => read_classic(channel, tag, key_a, presence),
        Technology::Type2 => read_type2(channel, tag, presence),
        Technology::Desfire => read_desfire(channel, presence).map(TagContent::Desfire),
        Technology::Generic => read_generic(channel, tag, presence),
        Technology::Ndef|Technology::Unknown => Err(Error::Unsupported(
            format!("block-level reading of {} tags", tag.tag_type),
        )),
    }
}


fn read_classic<C: TagChannel + ?Sized>(
    channel: &mut C,
    tag: &mut NfcTag,
    key_a: &[u8; 6],
    presence: &Presence,
) -> Result<TagContent, Error> {
    let sector_count = tag.tag_type.sector_count().unwrap_or(16);
    let mut sectors = Vec::with_capacity(usize::from(sector_count));

    for sector in 0..sector_count {
        presence.ensure_present()?;

        let first_block = sector_first_block(sector);
        if let Err(e) = isolate(channel.authenticate(first_block, KeyType::A, key_a))? {
            debug!("authentication to sector {} failed: {}", sector, e);
            sectors.push(SectorData {
                number: sector,
                blocks: Err(UnitError::new(e.kind, format!("authentication failed: {}", e.message))),
            });
            continue;
        }

        let mut blocks = Vec::with_capacity(usize::from(sector_block_count(sector)));
        for block in first_block..first_block + sector_block_count(sector) {
            presence.ensure_present()?;
            // CLASSIC_BLOCK_SIZE == 16
            let data = isolate(channel.read_block(block, CLASSIC_BLOCK_SIZE as u8))?;
            if let Ok(bytes) = &data {
                tag.blocks.insert(block, bytes.clone());
            }
            blocks.push(BlockData { number: block, data });
        }
        sectors.push(SectorData { number: sector, blocks: Ok(blocks) });
    }

    Ok(TagContent::Classic { sectors })
}


fn read_type2<C: TagChannel + ?Sized>(
    channel: &mut C,
    tag: &mut NfcTag,
    presence: &Presence,
) -> Result<TagContent, Error> {
    let page_count = tag.tag_type.page_count().unwrap_or(60);
    let mut pages = Vec::new();

    for page in 0..page_count {
        presence.ensure_present()?;
        // PAGE_SIZE == 4
        match isolate(channel.read_block(page, PAGE_SIZE as u8))? {
            Ok(data) => {
                tag.blocks.insert(page, data.clone());
                pages.push(BlockData { number: page, data: Ok(data) });
            },
            Err(e) => {
                debug!("stopping at page {}: {}", page, e);
                break;
            },
        }
    }

    let capability_container = tag.blocks.get(&CAPABILITY_CONTAINER_PAGE)
        .and_then(|page| CapabilityContainer::from_page(page));
    if let Some(cc) = &capability_container {
        tag.is_writable = cc.is_writable();
        tag.is_locked = !cc.is_writable();
    }

    let ndef = decode_type2_ndef(tag);
    if let Some(Ok(records)) = &ndef {
        tag.ndef_records = Some(records.clone());
    }

    Ok(TagContent::Type2 {
        pages,
        capability_container,
        ndef,
    })
}


/// Decodes the NDEF message from the pages of the NDEF area that were read.
fn decode_type2_ndef(tag: &NfcTag) -> Option<Result<Vec<Record>, UnitError>> {
    let (first_page, last_page) = tag.tag_type.ndef_pages()?;
    let mut area = Vec::new();
    for page in first_page..=last_page {
        match tag.blocks.get(&page) {
            Some(data) => area.extend_from_slice(data),
            None => break,
        }
    }
    if area.is_empty() {
        return None;
    }

    let result = ndef::unwrap_tlv(&area)
        .and_then(ndef::decode_message);
    match result {
        Ok(records) => Some(Ok(records)),
        Err(ndef::Error::NoMessage) => None,
        Err(e) => {
            warn!("undecodable NDEF data: {}", e);
            Some(Err(UnitError::from(&Error::from(e))))
        },
    }
}


/// Sends a native DESFire command wrapped in ISO 7816 framing, collecting additional frames.
fn desfire_command<C: TagChannel + ?Sized>(
    channel: &mut C,
    command: u8,
    data: &[u8],
) -> Result<Vec<u8>, Error> {
    let request_data = if data.is_empty() {
        Data::ResponseDataShort { response_data_length: 0 }
    } else {
        Data::BothDataShort { request_data: data.to_vec(), response_data_length: 0 }
    };
    let mut request = Apdu::new(CommandHeader::new(DESFIRE_CLA, command, 0x00, 0x00), request_data);

    let mut ret = Vec::new();
    for _ in 0..DESFIRE_MAX_FRAMES {
        let raw_response = channel.transmit(&request.to_bytes().map_err(CommunicationError::from)?)?;
        let response = Response::from_slice(&raw_response)
            .ok_or(CommunicationError::ShortResponse)?;
        ret.extend_from_slice(&response.data);
        match response.trailer.to_word() {
            DESFIRE_OK => return Ok(ret),
            DESFIRE_MORE => {
                request = Apdu::new(
                    CommandHeader::new(DESFIRE_CLA, DESFIRE_ADDITIONAL_FRAME, 0x00, 0x00),
                    Data::ResponseDataShort { response_data_length: 0 },
                );
            },
            status => return Err(Error::Status { operation: "DESFire command", status }),
        }
    }
    Err(Error::InvalidRequest(format!("DESFire command 0x{:02X} never finished", command)))
}


fn read_desfire<C: TagChannel + ?Sized>(channel: &mut C, presence: &Presence) -> Result<DesfireData, Error> {
    let mut ret = DesfireData::default();
    let result = isolate(read_desfire_parts(channel, presence, &mut ret))?;
    if let Err(e) = result {
        debug!("DESFire read failed: {}", e);
        ret.error = Some(e);
    }
    Ok(ret)
}

fn read_desfire_parts<C: TagChannel + ?Sized>(
    channel: &mut C,
    presence: &Presence,
    ret: &mut DesfireData,
) -> Result<(), Error> {
    presence.ensure_present()?;
    desfire_command(channel, DESFIRE_SELECT_APPLICATION, &[0x00, 0x00, 0x00])?;

    presence.ensure_present()?;
    let version = desfire_command(channel, DESFIRE_GET_VERSION, &[])?;
    let (Some(hardware), Some(software)) = (version.get(0..7), version.get(7..14)) else {
        return Err(Error::from(CommunicationError::ShortResponse));
    };
    // both slices are exactly seven bytes long
    let mut hardware_bytes = [0u8; 7];
    hardware_bytes.copy_from_slice(hardware);
    let mut software_bytes = [0u8; 7];
    software_bytes.copy_from_slice(software);
    ret.version = Some(DesfireVersion {
        hardware: DesfireVersionPart::from_bytes(&hardware_bytes),
        software: DesfireVersionPart::from_bytes(&software_bytes),
    });

    presence.ensure_present()?;
    let application_ids = desfire_command(channel, DESFIRE_GET_APPLICATION_IDS, &[])?;
    if application_ids.len() % 3 != 0 {
        warn!("application ID list has {} trailing bytes", application_ids.len() % 3);
    }
    ret.applications = application_ids.chunks_exact(3)
        .map(|aid| [aid[0], aid[1], aid[2]])
        .collect();
    Ok(())
}


fn read_generic<C: TagChannel + ?Sized>(
    channel: &mut C,
    tag: &mut NfcTag,
    presence: &Presence,
) -> Result<TagContent, Error> {
    let mut blocks = Vec::new();
    for block in 0..GENERIC_BLOCK_COUNT {
        presence.ensure_present()?;
        // CLASSIC_BLOCK_SIZE == 16
        match isolate(channel.read_block(block, CLASSIC_BLOCK_SIZE as u8))? {
            Ok(data) => {
                tag.blocks.insert(block, data.clone());
                blocks.push(BlockData { number: block, data: Ok(data) });
            },
            Err(e) => {
                debug!("stopping at block {}: {}", block, e);
                break;
            },
        }
    }
    Ok(TagContent::Generic { blocks })
}


#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet, VecDeque};

    use hex_literal::hex;
    use super::*;
    use crate::tag::TagType;

    /// Tag memory with sectors that refuse authentication and blocks that refuse reads.
    #[derive(Default)]
    struct FakeTag {
        memory: BTreeMap<u16, Vec<u8>>,
        locked_sectors: BTreeSet<u8>,
        broken_blocks: BTreeSet<u16>,
        transmit_responses: VecDeque<Vec<u8>>,
        transmitted: Vec<Vec<u8>>,
        remove_after_reads: Option<(usize, Presence)>,
    }
    impl TagChannel for FakeTag {
        fn authenticate(&mut self, block: u16, _key_type: KeyType, key: &[u8; 6]) -> Result<(), Error> {
            if key != &crate::tag::DEFAULT_KEY || self.locked_sectors.contains(&crate::tag::sector_of_block(block)) {
                return Err(Error::Status { operation: "GENERAL AUTHENTICATE", status: 0x6300 });
            }
            Ok(())
        }

        fn read_block(&mut self, block: u16, length: u8) -> Result<Vec<u8>, Error> {
            if let Some((remaining, presence)) = &mut self.remove_after_reads {
                if *remaining == 0 {
                    presence.mark_removed();
                    return Err(Error::from(CommunicationError::CardRemoved));
                }
                *remaining -= 1;
            }
            if self.broken_blocks.contains(&block) {
                return Err(Error::Status { operation: "READ BINARY", status: 0x6981 });
            }
            match self.memory.get(&block) {
                Some(data) => Ok(data[..usize::from(length)].to_vec()),
                None => Err(Error::Status { operation: "READ BINARY", status: 0x6A82 }),
            }
        }

        fn write_block(&mut self, block: u16, data: &[u8]) -> Result<(), Error> {
            self.memory.insert(block, data.to_vec());
            Ok(())
        }

        fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, Error> {
            self.transmitted.push(command.to_vec());
            self.transmit_responses.pop_front()
                .ok_or(Error::Status { operation: "transmit", status: 0x6988 })
        }
    }

    fn classic_1k() -> FakeTag {
        let mut fake = FakeTag::default();
        for block in 0..64u16 {
            fake.memory.insert(block, vec![block as u8; 16]);
        }
        fake
    }

    #[test]
    fn test_classic_sector_isolation() {
        let mut fake = classic_1k();
        fake.locked_sectors.insert(2);
        fake.broken_blocks.insert(5);
        let mut tag = NfcTag::with_type(vec![1, 2, 3, 4], Vec::new(), TagType::MifareClassic1K);

        let content = read_tag(&mut fake, &mut tag, &crate::tag::DEFAULT_KEY, &Presence::new()).unwrap();
        let TagContent::Classic { sectors } = content else { panic!("not a Classic readout") };
        assert_eq!(sectors.len(), 16);

        let sector2 = sectors[2].blocks.as_ref().unwrap_err();
        assert!(sector2.message.contains("authentication failed"));

        let sector1 = sectors[1].blocks.as_ref().unwrap();
        assert_eq!(sector1.len(), 4);
        assert_eq!(sector1[0].number, 4);
        assert_eq!(sector1[0].data, Ok(vec![4; 16]));
        assert!(sector1[1].data.is_err());
        assert_eq!(sector1[2].data, Ok(vec![6; 16]));

        assert!(sectors[3].blocks.is_ok());
        assert!(!tag.blocks.contains_key(&5));
        assert!(!tag.blocks.contains_key(&8));
        assert_eq!(tag.blocks.get(&63), Some(&vec![63; 16]));
    }

    #[test]
    fn test_classic_4k_numbering() {
        let mut fake = FakeTag::default();
        for block in 0..256u16 {
            fake.memory.insert(block, vec![0x00; 16]);
        }
        let mut tag = NfcTag::with_type(vec![1, 2, 3, 4], Vec::new(), TagType::MifareClassic4K);
        let content = read_tag(&mut fake, &mut tag, &crate::tag::DEFAULT_KEY, &Presence::new()).unwrap();
        let TagContent::Classic { sectors } = content else { panic!("not a Classic readout") };
        assert_eq!(sectors.len(), 40);
        let sector33 = sectors[33].blocks.as_ref().unwrap();
        assert_eq!(sector33.len(), 16);
        assert_eq!(sector33[0].number, 144);
        assert_eq!(sector33[15].number, 159);
        assert_eq!(tag.blocks.len(), 256);
    }

    #[test]
    fn test_wrong_key_fails_every_sector() {
        let mut fake = classic_1k();
        let mut tag = NfcTag::with_type(vec![1, 2, 3, 4], Vec::new(), TagType::MifareClassic1K);
        let content = read_tag(&mut fake, &mut tag, &[0x00; 6], &Presence::new()).unwrap();
        let TagContent::Classic { sectors } = content else { panic!("not a Classic readout") };
        assert!(sectors.iter().all(|s| s.blocks.is_err()));
        assert!(tag.blocks.is_empty());
    }

    fn ntag213(ndef_area: &[u8]) -> FakeTag {
        let mut fake = FakeTag::default();
        fake.memory.insert(0, hex!("04 A1 B2 9F").to_vec());
        fake.memory.insert(1, hex!("C3 D4 E5 F6").to_vec());
        fake.memory.insert(2, hex!("07 48 00 00").to_vec());
        fake.memory.insert(3, hex!("E1 10 12 00").to_vec());
        for page in 4..45u16 {
            let offset = usize::from(page - 4) * 4;
            let mut data = [0u8; 4];
            for (i, b) in data.iter_mut().enumerate() {
                *b = ndef_area.get(offset + i).copied().unwrap_or(0);
            }
            fake.memory.insert(page, data.to_vec());
        }
        fake
    }

    #[test]
    fn test_ntag_with_ndef() {
        let records = vec![Record::uri("https://www.icao.int/")];
        let area = ndef::wrap_tlv(&ndef::encode_message(&records).unwrap()).unwrap();
        let mut fake = ntag213(&area);
        let mut tag = NfcTag::with_type(hex!("04A1B2C3D4E5F6").to_vec(), Vec::new(), TagType::Ntag213);

        let content = read_tag(&mut fake, &mut tag, &crate::tag::DEFAULT_KEY, &Presence::new()).unwrap();
        let TagContent::Type2 { pages, capability_container, ndef } = content else { panic!("not a Type 2 readout") };
        assert_eq!(pages.len(), 45);
        let cc = capability_container.unwrap();
        assert_eq!(cc.magic, 0xE1);
        assert_eq!(cc.memory_size, 144);
        assert!(cc.is_writable());
        assert_eq!(ndef, Some(Ok(records.clone())));
        assert_eq!(tag.ndef_records, Some(records));
        assert!(tag.is_writable);
    }

    #[test]
    fn test_type2_stops_at_first_error() {
        let mut fake = ntag213(&hex!("03 00 FE"));
        fake.broken_blocks.insert(10);
        let mut tag = NfcTag::with_type(vec![4; 7], Vec::new(), TagType::Ntag213);
        let content = read_tag(&mut fake, &mut tag, &crate::tag::DEFAULT_KEY, &Presence::new()).unwrap();
        let TagContent::Type2 { pages, ndef, .. } = content else { panic!("not a Type 2 readout") };
        assert_eq!(pages.len(), 10);
        assert_eq!(ndef, Some(Ok(Vec::new())));
    }

    #[test]
    fn test_type2_without_ndef() {
        let mut fake = ntag213(&[]);
        let mut tag = NfcTag::with_type(vec![4; 7], Vec::new(), TagType::Ntag213);
        let content = read_tag(&mut fake, &mut tag, &crate::tag::DEFAULT_KEY, &Presence::new()).unwrap();
        let TagContent::Type2 { ndef, .. } = content else { panic!("not a Type 2 readout") };
        assert_eq!(ndef, None);
        assert_eq!(tag.ndef_records, None);
    }

    #[test]
    fn test_removal_aborts() {
        let presence = Presence::new();
        let mut fake = ntag213(&[]);
        fake.remove_after_reads = Some((3, presence.clone()));
        let mut tag = NfcTag::with_type(vec![4; 7], Vec::new(), TagType::Ntag213);
        let error = read_tag(&mut fake, &mut tag, &crate::tag::DEFAULT_KEY, &presence).unwrap_err();
        assert!(error.is_card_removed());
        assert_eq!(tag.blocks.len(), 3);
    }

    #[test]
    fn test_desfire() {
        let mut fake = FakeTag::default();
        fake.transmit_responses.push_back(hex!("9100").to_vec());
        fake.transmit_responses.push_back(hex!("04 01 01 01 00 18 05 91AF").to_vec());
        fake.transmit_responses.push_back(hex!("04 01 01 01 04 18 05 91AF").to_vec());
        fake.transmit_responses.push_back(hex!("04 56 78 9A BC DE F0 00 00 00 00 00 10 09 9100").to_vec());
        fake.transmit_responses.push_back(hex!("010203 A0B0C0 9100").to_vec());

        let mut tag = NfcTag::with_type(vec![4; 7], hex!("3B8180018044 03").to_vec(), TagType::Desfire);
        let content = read_tag(&mut fake, &mut tag, &crate::tag::DEFAULT_KEY, &Presence::new()).unwrap();
        let TagContent::Desfire(data) = content else { panic!("not a DESFire readout") };
        assert_eq!(data.error, None);
        let version = data.version.unwrap();
        assert_eq!(version.hardware.vendor, 0x04);
        assert_eq!(version.hardware.storage, 0x18);
        assert_eq!(version.software.minor, 0x04);
        assert_eq!(data.applications, vec![hex!("010203"), hex!("A0B0C0")]);

        assert_eq!(fake.transmitted[0], hex!("905A000003000000 00"));
        assert_eq!(fake.transmitted[1], hex!("90600000 00"));
        assert_eq!(fake.transmitted[2], hex!("90AF0000 00"));
        assert_eq!(fake.transmitted[4], hex!("906A0000 00"));
    }

    #[test]
    fn test_desfire_failure_is_recorded() {
        let mut fake = FakeTag::default();
        fake.transmit_responses.push_back(hex!("91A0").to_vec());
        let mut tag = NfcTag::with_type(vec![4; 7], Vec::new(), TagType::Desfire);
        let content = read_tag(&mut fake, &mut tag, &crate::tag::DEFAULT_KEY, &Presence::new()).unwrap();
        let TagContent::Desfire(data) = content else { panic!("not a DESFire readout") };
        assert!(data.error.is_some());
        assert_eq!(data.version, None);
    }

    #[test]
    fn test_generic() {
        let mut fake = FakeTag::default();
        for block in 0..5u16 {
            fake.memory.insert(block, b"0123456789ABCDEF".to_vec());
        }
        let mut tag = NfcTag::with_type(vec![1; 4], Vec::new(), TagType::Generic);
        let content = read_tag(&mut fake, &mut tag, &crate::tag::DEFAULT_KEY, &Presence::new()).unwrap();
        let TagContent::Generic { blocks } = content else { panic!("not a generic readout") };
        assert_eq!(blocks.len(), 5);
        assert_eq!(blocks[0].ascii().as_deref(), Some("0123456789ABCDEF"));
    }

    #[test]
    fn test_apdu_channel() {
        use crate::iso7816::apdu::ResponseTrailer;

        struct Card(Vec<Vec<u8>>);
        impl SmartCard for Card {
            fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
                self.0.push(request.to_bytes()?);
                Ok(Response::new(vec![0xAB; 16], ResponseTrailer::SUCCESS))
            }
        }

        let mut channel = ApduTagChannel::new(Card(Vec::new()));
        channel.authenticate(0x81, KeyType::B, &[0xA0; 6]).unwrap();
        assert_eq!(channel.read_block(5, 4).unwrap(), vec![0xAB; 4]);
        channel.write_block(7, &hex!("01020304")).unwrap();

        let card = channel.into_inner();
        assert_eq!(card.0[0], hex!("FF82000006 A0A0A0A0A0A0"));
        assert_eq!(card.0[1], hex!("FF86000005 01 0081 61 00"));
        assert_eq!(card.0[2], hex!("FFB0000504"));
        assert_eq!(card.0[3], hex!("FFD6000704 01020304"));
    }
}

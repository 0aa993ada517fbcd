//! Writing, formatting and locking contactless tags.


use tracing::{debug, info, instrument};

use crate::error::Error;
use crate::presence::Presence;
use crate::tag::{
    CLASSIC_BLOCK_SIZE, FIRST_USER_PAGE, NfcTag, PAGE_SIZE, Technology, is_sector_trailer,
    sector_block_count, sector_first_block, sector_of_block,
};
use crate::tag::ndef::{self, Record};
use crate::tag::reader::{KeyType, TagChannel};


/// Access bits written to MIFARE Classic sector trailers (the transport configuration).
pub const DEFAULT_ACCESS_BITS: [u8; 4] = [0xFF, 0x07, 0x80, 0x69];

/// Static lock bytes (page 2, bytes 2 and 3) of a Type 2 tag, all set.
pub const DEFAULT_LOCK_BYTES: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

const TYPE2_LOCK_PAGE: u16 = 2;


/// What to put on a tag.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WriteRequest {
    /// Raw blocks (or pages), each exactly one block long.
    Blocks(Vec<(u16, Vec<u8>)>),

    /// An NDEF message.
    Ndef(Vec<Record>),
}


#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct LockOptions {
    pub key_a: [u8; 6],
    pub key_b: [u8; 6],
    pub access_bits: [u8; 4],
    pub lock_bytes: [u8; 4],
}
impl Default for LockOptions {
    fn default() -> Self {
        Self {
            key_a: crate::tag::DEFAULT_KEY,
            key_b: crate::tag::DEFAULT_KEY,
            access_bits: DEFAULT_ACCESS_BITS,
            lock_bytes: DEFAULT_LOCK_BYTES,
        }
    }
}


fn block_size(tag: &NfcTag) -> Result<usize, Error> {
    match tag.technology() {
        Technology::MifareClassic|Technology::Generic => Ok(CLASSIC_BLOCK_SIZE),
        Technology::Type2 => Ok(PAGE_SIZE),
        _ => Err(Error::Unsupported(format!("block writes to {} tags", tag.tag_type))),
    }
}

pub(crate) fn ensure_writable(tag: &NfcTag) -> Result<(), Error> {
    if tag.is_writable && !tag.is_locked {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!("tag {} is read-only", tag.uid_hex())))
    }
}

/// Checks a raw block write before anything is sent to the tag.
fn check_block(tag: &NfcTag, block: u16, data: &[u8], block_size: usize) -> Result<(), Error> {
    if data.len() != block_size {
        return Err(Error::InvalidRequest(format!(
            "block {} needs {} bytes, got {}", block, block_size, data.len(),
        )));
    }
    if block == 0 {
        return Err(Error::InvalidRequest("block 0 holds the manufacturer data".to_owned()));
    }
    match tag.technology() {
        Technology::MifareClassic => {
            let sector_count = tag.tag_type.sector_count().unwrap_or(16);
            if sector_of_block(block) >= sector_count {
                return Err(Error::InvalidRequest(format!("block {} is beyond the end of the tag", block)));
            }
            if is_sector_trailer(block) {
                return Err(Error::InvalidRequest(format!(
                    "block {} is a sector trailer; use locking to change keys", block,
                )));
            }
        },
        Technology::Type2 => {
            if block < FIRST_USER_PAGE {
                return Err(Error::InvalidRequest(format!(
                    "page {} holds the UID, lock bytes or capability container", block,
                )));
            }
            let page_count = tag.tag_type.page_count().unwrap_or(0);
            if block >= page_count {
                return Err(Error::InvalidRequest(format!("page {} is beyond the end of the tag", block)));
            }
        },
        _ => {},
    }
    Ok(())
}


/// Writes blocks, authenticating to each MIFARE Classic sector before its first block.
fn write_blocks<C: TagChannel + ?Sized>(
    channel: &mut C,
    tag: &mut NfcTag,
    blocks: &[(u16, Vec<u8>)],
    key_a: &[u8; 6],
    presence: &Presence,
) -> Result<(), Error> {
    let classic = tag.technology() == Technology::MifareClassic;
    let mut authenticated_sector = None;
    for (block, data) in blocks {
        presence.ensure_present()?;
        if classic {
            let sector = sector_of_block(*block);
            if authenticated_sector != Some(sector) {
                channel.authenticate(sector_first_block(sector), KeyType::A, key_a)?;
                authenticated_sector = Some(sector);
            }
        }
        channel.write_block(*block, data)?;
        tag.blocks.insert(*block, data.clone());
    }
    Ok(())
}


/// Writes raw blocks or an NDEF message to a tag.
#[instrument(skip_all, fields(uid = %tag.uid_hex()))]
pub fn write_tag<C: TagChannel + ?Sized>(
    channel: &mut C,
    tag: &mut NfcTag,
    request: &WriteRequest,
    key_a: &[u8; 6],
    presence: &Presence,
) -> Result<(), Error> {
    ensure_writable(tag)?;
    match request {
        WriteRequest::Blocks(blocks) => {
            let size = block_size(tag)?;
            for (block, data) in blocks {
                check_block(tag, *block, data, size)?;
            }
            write_blocks(channel, tag, blocks, key_a, presence)?;
            debug!("wrote {} blocks", blocks.len());
            Ok(())
        },
        WriteRequest::Ndef(records) => write_ndef(channel, tag, records, presence),
    }
}


/// Writes an NDEF message TLV to the data area of a Type 2 tag.
fn write_ndef<C: TagChannel + ?Sized>(
    channel: &mut C,
    tag: &mut NfcTag,
    records: &[Record],
    presence: &Presence,
) -> Result<(), Error> {
    let Some((first_page, last_page)) = tag.tag_type.ndef_pages() else {
        return Err(Error::Unsupported(format!("NDEF writes to {} tags", tag.tag_type)));
    };
    let tlv = ndef::wrap_tlv(&ndef::encode_message(records)?)?;

    let area_size = usize::from(last_page - first_page + 1) * PAGE_SIZE;
    if tlv.len() > area_size {
        return Err(Error::InvalidRequest(format!(
            "NDEF message needs {} bytes, tag holds {}", tlv.len(), area_size,
        )));
    }

    let pages: Vec<(u16, Vec<u8>)> = tlv.chunks(PAGE_SIZE)
        .zip(first_page..)
        .map(|(chunk, page)| {
            let mut data = chunk.to_vec();
            data.resize(PAGE_SIZE, 0x00);
            (page, data)
        })
        .collect();
    write_blocks(channel, tag, &pages, &crate::tag::DEFAULT_KEY, presence)?;

    tag.ndef_records = Some(records.to_vec());
    info!("wrote NDEF message with {} records ({} pages)", records.len(), pages.len());
    Ok(())
}


/// Erases user memory: Type 2 tags get an empty NDEF message, MIFARE Classic data blocks are
/// zeroed.
#[instrument(skip_all, fields(uid = %tag.uid_hex()))]
pub fn format_tag<C: TagChannel + ?Sized>(
    channel: &mut C,
    tag: &mut NfcTag,
    key_a: &[u8; 6],
    presence: &Presence,
) -> Result<(), Error> {
    ensure_writable(tag)?;
    let blocks: Vec<(u16, Vec<u8>)> = match tag.technology() {
        Technology::Type2 => {
            let Some((first_page, last_page)) = tag.tag_type.ndef_pages() else {
                return Err(Error::Unsupported(format!("formatting {} tags", tag.tag_type)));
            };
            let mut area = ndef::wrap_tlv(&[])?;
            area.resize(usize::from(last_page - first_page + 1) * PAGE_SIZE, 0x00);
            area.chunks(PAGE_SIZE)
                .zip(first_page..)
                .map(|(chunk, page)| (page, chunk.to_vec()))
                .collect()
        },
        Technology::MifareClassic => {
            let sector_count = tag.tag_type.sector_count().unwrap_or(16);
            (0..sector_count)
                .flat_map(|sector| {
                    let first = sector_first_block(sector);
                    first..first + sector_block_count(sector)
                })
                .filter(|&block| block != 0 && !is_sector_trailer(block))
                .map(|block| (block, vec![0x00; CLASSIC_BLOCK_SIZE]))
                .collect()
        },
        _ => return Err(Error::Unsupported(format!("formatting {} tags", tag.tag_type))),
    };

    write_blocks(channel, tag, &blocks, key_a, presence)?;
    tag.ndef_records = if tag.technology() == Technology::Type2 { Some(Vec::new()) } else { None };
    info!("formatted {} blocks", blocks.len());
    Ok(())
}


/// Makes a tag permanently read-only.
///
/// MIFARE Classic sector trailers are rewritten with the given keys and access bits; Type 2 tags
/// get their static lock bytes set.
#[instrument(skip_all, fields(uid = %tag.uid_hex()))]
pub fn lock_tag<C: TagChannel + ?Sized>(
    channel: &mut C,
    tag: &mut NfcTag,
    current_key_a: &[u8; 6],
    options: &LockOptions,
    presence: &Presence,
) -> Result<(), Error> {
    match tag.technology() {
        Technology::MifareClassic => {
            let mut trailer = Vec::with_capacity(CLASSIC_BLOCK_SIZE);
            trailer.extend_from_slice(&options.key_a);
            trailer.extend_from_slice(&options.access_bits);
            trailer.extend_from_slice(&options.key_b);

            let sector_count = tag.tag_type.sector_count().unwrap_or(16);
            let mut written = 0usize;
            for sector in 0..sector_count {
                presence.ensure_present()?;
                let first = sector_first_block(sector);
                let trailer_block = first + sector_block_count(sector) - 1;
                channel.authenticate(first, KeyType::A, current_key_a)?;
                channel.write_block(trailer_block, &trailer)?;
                written += 1;
            }
            debug!("rewrote {} sector trailers", written);
        },
        Technology::Type2 => {
            presence.ensure_present()?;
            channel.write_block(TYPE2_LOCK_PAGE, &options.lock_bytes)?;
        },
        _ => return Err(Error::Unsupported(format!("locking {} tags", tag.tag_type))),
    }

    tag.is_locked = true;
    tag.is_writable = false;
    info!("tag locked");
    Ok(())
}

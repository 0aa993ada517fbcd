//! Readers behind a serial port speaking a small length-prefixed protocol.
//!
//! Every frame is a big-endian `u16` length followed by that many bytes. Requests carry a command
//! byte and its arguments; byte strings are sent as a length byte followed by the bytes. Frames
//! from the device carry a command byte, a status byte and data. The device reports tags on its
//! own (`01` when a tag arrives, `02` when it leaves) and answers a request with the request's
//! command byte with the high bit set.
//!
//! A background thread reads the port and hands notifications and responses to the adapter
//! through channels.


use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use crate::adapter::{
    emit, AdapterEvent, AdapterKind, Capability, PresentCard, ReaderAdapter, ReaderInfo,
    TagDescriptor,
};
use crate::config::EngineConfig;
use crate::error::{Error, UnitError};
use crate::iso7816::apdu::{Apdu, Response};
use crate::iso7816::card::{transmit_raw, CommunicationError, SmartCard};
use crate::presence::Presence;
use crate::tag::{NfcTag, TagType, Technology};
use crate::tag::reader::{read_tag, KeyType, TagChannel, TagContent};
use crate::tag::writer::{ensure_writable, write_tag, LockOptions, WriteRequest};


pub const CMD_SCAN: u8 = 0x01;
pub const CMD_READ: u8 = 0x02;
pub const CMD_WRITE: u8 = 0x03;
pub const CMD_FORMAT: u8 = 0x04;
pub const CMD_LOCK: u8 = 0x05;
pub const CMD_RAW: u8 = 0x06;
pub const CMD_VERSION: u8 = 0x07;

/// Unsolicited frame announcing a tag.
pub const NOTIFY_TAG_DISCOVERED: u8 = 0x01;

/// Unsolicited frame announcing that a tag left the field.
pub const NOTIFY_TAG_REMOVED: u8 = 0x02;

/// Set in the command byte of a response.
pub const RESPONSE_FLAG: u8 = 0x80;

pub const STATUS_OK: u8 = 0x00;

const READ_CHUNK_SIZE: usize = 256;


fn command_name(command: u8) -> &'static str {
    match command {
        CMD_SCAN => "SCAN",
        CMD_READ => "READ",
        CMD_WRITE => "WRITE",
        CMD_FORMAT => "FORMAT",
        CMD_LOCK => "LOCK",
        CMD_RAW => "RAW",
        CMD_VERSION => "VERSION",
        _ => "serial command",
    }
}

/// Maps the tag type code of a discovery notification.
pub fn tag_type_from_code(code: u8) -> TagType {
    match code {
        0x08 => TagType::MifareClassic1K,
        0x18 => TagType::MifareClassic4K,
        0x00 => TagType::MifareUltralight,
        0x44 => TagType::Ntag213,
        0x45 => TagType::Ntag215,
        0x46 => TagType::Ntag216,
        _ => TagType::Unknown,
    }
}


#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum FrameError {
    #[error("argument of {length} bytes does not fit its length byte")]
    ArgumentTooLong { length: usize },

    #[error("frame body of {length} bytes does not fit its length field")]
    FrameTooLong { length: usize },
}
impl From<FrameError> for Error {
    fn from(value: FrameError) -> Self {
        Error::InvalidRequest(value.to_string())
    }
}


/// An argument of a request.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Arg<'a> {
    Byte(u8),

    /// Sent as a length byte followed by the bytes.
    Bytes(&'a [u8]),
}


pub fn encode_frame(command: u8, args: &[Arg<'_>]) -> Result<Vec<u8>, FrameError> {
    let mut body = vec![command];
    for arg in args {
        match arg {
            Arg::Byte(b) => body.push(*b),
            Arg::Bytes(bytes) => {
                let length = u8::try_from(bytes.len())
                    .map_err(|_| FrameError::ArgumentTooLong { length: bytes.len() })?;
                body.push(length);
                body.extend_from_slice(bytes);
            },
        }
    }
    let length = u16::try_from(body.len())
        .map_err(|_| FrameError::FrameTooLong { length: body.len() })?;

    let mut frame = Vec::with_capacity(2 + body.len());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}


/// Reassembles frames from the byte stream of the port.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}
impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Takes the body of the next complete frame off the buffer.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let &[high, low, ..] = self.buffer.as_slice() else {
            return None;
        };
        let end = 2 + usize::from(u16::from_be_bytes([high, low]));
        if self.buffer.len() < end {
            return None;
        }
        let frame = self.buffer[2..end].to_vec();
        self.buffer.drain(..end);
        Some(frame)
    }
}


#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Packet {
    pub command: u8,
    pub status: u8,
    pub data: Vec<u8>,
}
impl Packet {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let (&command, rest) = bytes.split_first()?;
        let (&status, data) = rest.split_first()?;
        Some(Self {
            command,
            status,
            data: data.to_vec(),
        })
    }
}


/// A frame received from the device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Inbound {
    TagDiscovered { uid: Vec<u8>, tag_type: TagType },
    TagRemoved { uid: Vec<u8> },
    Response(Packet),
}
impl Inbound {
    /// Interprets a frame body; `None` for frames that mean nothing to the host.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let packet = Packet::from_bytes(frame)?;
        match packet.command {
            NOTIFY_TAG_DISCOVERED => {
                if packet.status != STATUS_OK {
                    return None;
                }
                let (&uid_length, rest) = packet.data.split_first()?;
                let uid = rest.get(..usize::from(uid_length))?.to_vec();
                let tag_type = rest.get(usize::from(uid_length))
                    .map_or(TagType::Unknown, |&code| tag_type_from_code(code));
                Some(Self::TagDiscovered { uid, tag_type })
            },
            NOTIFY_TAG_REMOVED => Some(Self::TagRemoved { uid: packet.data }),
            command if command & RESPONSE_FLAG != 0 => Some(Self::Response(packet)),
            _ => None,
        }
    }
}


/// Splits the payload of a READ response into blocks, each preceded by its length.
pub fn parse_blocks(data: &[u8]) -> Result<Vec<Vec<u8>>, CommunicationError> {
    let mut blocks = Vec::new();
    let mut rest = data;
    while let Some((&length, tail)) = rest.split_first() {
        let length = usize::from(length);
        let block = tail.get(..length)
            .ok_or(CommunicationError::ShortResponse)?;
        blocks.push(block.to_vec());
        rest = &tail[length..];
    }
    Ok(blocks)
}


/// Groups block writes into runs of consecutive blocks, one WRITE request each.
fn contiguous_runs(writes: Vec<(u16, Vec<u8>)>) -> Vec<(u16, Vec<Vec<u8>>)> {
    let mut runs: Vec<(u16, Vec<Vec<u8>>)> = Vec::new();
    for (block, data) in writes {
        match runs.last_mut() {
            Some((start, blocks)) if usize::from(*start) + blocks.len() == usize::from(block) => {
                blocks.push(data);
            },
            _ => runs.push((block, vec![data])),
        }
    }
    runs
}


fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}


/// State the adapter shares with the thread reading the port.
struct Shared {
    reader_name: String,
    events: Mutex<Option<Sender<AdapterEvent>>>,
    presences: Mutex<BTreeMap<Vec<u8>, Presence>>,
}
impl Shared {
    fn emit(&self, event: AdapterEvent) {
        emit(&mut lock(&self.events), event);
    }

    fn tag_discovered(&self, uid: Vec<u8>, tag_type: TagType) {
        let presence = {
            let mut presences = lock(&self.presences);
            if presences.get(&uid).is_some_and(Presence::is_present) {
                // the device repeats itself on every scan
                return;
            }
            let presence = Presence::new();
            presences.insert(uid.clone(), presence.clone());
            presence
        };
        info!("{} tag {} entered the field", tag_type, hex::encode_upper(&uid));
        self.emit(AdapterEvent::TagDiscovered(TagDescriptor {
            uid,
            atr: Vec::new(),
            tag_type: Some(tag_type),
            reader: self.reader_name.clone(),
            presence,
        }));
    }

    fn tag_removed(&self, uid: Vec<u8>) {
        let Some(presence) = lock(&self.presences).remove(&uid) else {
            debug!("removal of unknown tag {}", hex::encode_upper(&uid));
            return;
        };
        presence.mark_removed();
        info!("tag {} left the field", hex::encode_upper(&uid));
        self.emit(AdapterEvent::TagRemoved { uid });
    }

    fn forget_tags(&self) {
        let presences = std::mem::take(&mut *lock(&self.presences));
        for presence in presences.values() {
            presence.mark_removed();
        }
    }

    fn presence_of(&self, uid: &[u8]) -> Option<Presence> {
        lock(&self.presences).get(uid).cloned()
    }
}


fn read_port(
    mut port: Box<dyn Read + Send>,
    shared: Arc<Shared>,
    closing: Arc<AtomicBool>,
    responses: Sender<Packet>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        let count = match port.read(&mut buf) {
            Ok(0) => break,
            Ok(count) => count,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if !closing.load(Ordering::Acquire) {
                    warn!("reading from {} failed: {}", shared.reader_name, e);
                    let error = Error::from(CommunicationError::Io(e));
                    shared.emit(AdapterEvent::Error(UnitError::from(&error)));
                }
                break;
            },
        };
        if closing.load(Ordering::Acquire) {
            return;
        }

        decoder.push(&buf[..count]);
        while let Some(frame) = decoder.next_frame() {
            trace!("received from {}:\n{}", shared.reader_name, crate::hexdump(&frame));
            match Inbound::parse(&frame) {
                Some(Inbound::TagDiscovered { uid, tag_type }) => shared.tag_discovered(uid, tag_type),
                Some(Inbound::TagRemoved { uid }) => shared.tag_removed(uid),
                Some(Inbound::Response(packet)) => {
                    if responses.send(packet).is_err() {
                        debug!("response arrived after the adapter went away");
                    }
                },
                None => debug!("ignoring frame {}", hex::encode_upper(&frame)),
            }
        }
    }

    if !closing.load(Ordering::Acquire) {
        info!("{} went away", shared.reader_name);
        shared.forget_tags();
        shared.emit(AdapterEvent::ReaderDisconnected { reader: shared.reader_name.clone() });
    }
}


/// Both directions of an opened serial port.
pub struct SerialPort {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}
impl SerialPort {
    /// Opens a character device for reading and writing.
    ///
    /// Line settings (baud rate, raw mode) are left to the operating system, e.g. `stty`.
    pub fn open_device<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        let reader = file.try_clone()?;
        Ok(Self {
            reader: Box::new(reader),
            writer: Box::new(file),
        })
    }
}


pub type PortOpener = Box<dyn FnMut() -> io::Result<SerialPort> + Send>;


struct Connection {
    writer: Box<dyn Write + Send>,
    responses: Receiver<Packet>,

    /// Tells the reading thread to stop reporting once it wakes up.
    closing: Arc<AtomicBool>,

    _reader_thread: JoinHandle<()>,
}


/// A reader attached through a serial port.
///
/// The device performs authentication, reading and writing on its own; the adapter validates
/// writes against the tag model before sending them. Disconnecting leaves the reading thread
/// blocked on the port until the device sends something or the port closes.
pub struct SerialAdapter {
    port_name: String,
    baud_rate: u32,
    command_timeout: Duration,
    poll_interval: Duration,
    opener: PortOpener,
    shared: Arc<Shared>,
    connection: Option<Connection>,
    scanning: bool,
    last_scan: Option<Instant>,
}
impl SerialAdapter {
    pub fn new(config: &EngineConfig, opener: PortOpener) -> Self {
        Self {
            port_name: config.serial.port.clone(),
            baud_rate: config.serial.baud_rate,
            command_timeout: config.command_timeout(),
            poll_interval: config.poll_interval(),
            opener,
            shared: Arc::new(Shared {
                reader_name: config.serial.port.clone(),
                events: Mutex::new(None),
                presences: Mutex::new(BTreeMap::new()),
            }),
            connection: None,
            scanning: false,
            last_scan: None,
        }
    }

    /// An adapter for the device named in the configuration.
    pub fn open(config: &EngineConfig) -> Self {
        let path = config.serial.port.clone();
        Self::new(config, Box::new(move || SerialPort::open_device(&path)))
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.command_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), CommunicationError> {
        let connection = self.connection.as_mut()
            .ok_or(CommunicationError::NotConnected)?;
        trace!("sending to {}:\n{}", self.port_name, crate::hexdump(frame));
        connection.writer.write_all(frame)?;
        connection.writer.flush()?;
        Ok(())
    }

    /// Sends a request frame and waits for the response to it.
    fn exchange(&mut self, command: u8, frame: &[u8]) -> Result<Packet, CommunicationError> {
        if let Some(connection) = &self.connection {
            // answers to requests that timed out earlier
            while let Ok(stale) = connection.responses.try_recv() {
                debug!("dropping late response to command 0x{:02X}", stale.command & !RESPONSE_FLAG);
            }
        }
        self.send(frame)?;

        let timeout_ms = self.timeout_ms();
        let deadline = Instant::now() + self.command_timeout;
        let connection = self.connection.as_ref()
            .ok_or(CommunicationError::NotConnected)?;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match connection.responses.recv_timeout(remaining) {
                Ok(packet) if packet.command == command | RESPONSE_FLAG => return Ok(packet),
                Ok(packet) => warn!(
                    "expected a response to command 0x{:02X}, got one to 0x{:02X}",
                    command, packet.command & !RESPONSE_FLAG,
                ),
                Err(RecvTimeoutError::Timeout) => return Err(CommunicationError::Timeout { timeout_ms }),
                Err(RecvTimeoutError::Disconnected) => return Err(CommunicationError::NotConnected),
            }
        }
    }

    /// Performs a request, treating any status but success as failure.
    fn command(&mut self, command: u8, args: &[Arg<'_>]) -> Result<Vec<u8>, Error> {
        let frame = encode_frame(command, args)?;
        let packet = self.exchange(command, &frame)?;
        if packet.status != STATUS_OK {
            return Err(Error::Status {
                operation: command_name(command),
                status: u16::from(packet.status),
            });
        }
        Ok(packet.data)
    }
}
impl ReaderAdapter for SerialAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Serial
    }

    fn subscribe(&mut self) -> Receiver<AdapterEvent> {
        let (sender, receiver) = mpsc::channel();
        *lock(&self.shared.events) = Some(sender);
        receiver
    }

    #[instrument(skip(self), fields(port = %self.port_name))]
    fn connect(&mut self) -> Result<(), Error> {
        if self.connection.is_some() {
            return Ok(());
        }
        let port = (self.opener)()
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => Error::Permission(format!("cannot open {}: {}", self.port_name, e)),
                _ => Error::from(CommunicationError::Io(e)),
            })?;

        let (sender, responses) = mpsc::channel();
        let closing = Arc::new(AtomicBool::new(false));
        let reader = port.reader;
        let thread_shared = Arc::clone(&self.shared);
        let thread_closing = Arc::clone(&closing);
        let reader_thread = thread::Builder::new()
            .name(format!("serial {}", self.port_name))
            .spawn(move || read_port(reader, thread_shared, thread_closing, sender))
            .map_err(CommunicationError::from)?;

        self.connection = Some(Connection {
            writer: port.writer,
            responses,
            closing,
            _reader_thread: reader_thread,
        });
        info!("connected at {} baud", self.baud_rate);
        self.shared.emit(AdapterEvent::ReaderConnected { reader: self.port_name.clone() });
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        if let Some(connection) = self.connection.take() {
            connection.closing.store(true, Ordering::Release);
            self.scanning = false;
            self.shared.forget_tags();
            info!("disconnected from {}", self.port_name);
            self.shared.emit(AdapterEvent::ReaderDisconnected { reader: self.port_name.clone() });
        }
        Ok(())
    }

    fn start_scanning(&mut self) -> Result<(), Error> {
        if self.connection.is_none() {
            return Err(Error::from(CommunicationError::NotConnected));
        }
        self.scanning = true;
        self.last_scan = None;
        self.poll()
    }

    fn stop_scanning(&mut self) -> Result<(), Error> {
        self.scanning = false;
        Ok(())
    }

    /// Asks the device to scan once the poll interval has passed.
    fn poll(&mut self) -> Result<(), Error> {
        if !self.scanning {
            return Ok(());
        }
        let due = self.last_scan
            .map_or(true, |last| last.elapsed() >= self.poll_interval);
        if due {
            self.last_scan = Some(Instant::now());
            let frame = encode_frame(CMD_SCAN, &[])?;
            self.send(&frame)?;
        }
        Ok(())
    }

    fn get_info(&mut self) -> Result<ReaderInfo, Error> {
        let version = if self.connection.is_some() {
            let data = self.command(CMD_VERSION, &[])?;
            String::from_utf8_lossy(&data).trim().to_owned()
        } else {
            "unknown".to_owned()
        };
        Ok(ReaderInfo {
            adapter: AdapterKind::Serial,
            version,
            readers: vec![self.port_name.clone()],
            capabilities: vec![
                Capability::Read, Capability::Write, Capability::Format, Capability::Lock,
                Capability::RawCommands, Capability::SmartCard,
            ],
            available: self.connection.is_some() || Path::new(&self.port_name).exists(),
            details: BTreeMap::from([
                ("port".to_owned(), self.port_name.clone()),
                ("baud_rate".to_owned(), self.baud_rate.to_string()),
            ]),
        })
    }

    fn tag_channel(&mut self, _uid: &[u8]) -> Result<Box<dyn TagChannel + '_>, Error> {
        Err(Error::Unsupported("block-level access over the serial protocol".to_owned()))
    }

    fn card_channel(&mut self, uid: &[u8]) -> Result<Box<dyn SmartCard + '_>, Error> {
        let presence = self.shared.presence_of(uid)
            .ok_or(Error::from(CommunicationError::CardRemoved))?;
        let card = SerialCard { adapter: self, uid: uid.to_vec() };
        Ok(Box::new(PresentCard::new(card, presence)))
    }

    #[instrument(skip_all, fields(uid = %tag.uid_hex()))]
    fn read(&mut self, tag: &mut NfcTag, key_a: &[u8; 6], presence: &Presence) -> Result<TagContent, Error> {
        presence.ensure_present()?;
        let data = self.command(CMD_READ, &[Arg::Bytes(&tag.uid)])?;
        let blocks = parse_blocks(&data)?;
        debug!("device returned {} blocks", blocks.len());
        read_tag(&mut BlockImage { blocks }, tag, key_a, presence)
    }

    #[instrument(skip_all, fields(uid = %tag.uid_hex()))]
    fn write(
        &mut self,
        tag: &mut NfcTag,
        request: &WriteRequest,
        key_a: &[u8; 6],
        presence: &Presence,
    ) -> Result<(), Error> {
        presence.ensure_present()?;
        let mut staged = tag.clone();
        let mut recorder = WriteRecorder::default();
        write_tag(&mut recorder, &mut staged, request, key_a, presence)?;

        for (start, blocks) in contiguous_runs(recorder.writes) {
            presence.ensure_present()?;
            let start = u8::try_from(start)
                .map_err(|_| Error::InvalidRequest(format!("block {} is out of reach of the device", start)))?;
            let mut args = vec![Arg::Bytes(&tag.uid), Arg::Byte(start)];
            args.extend(blocks.iter().map(|block| Arg::Bytes(block.as_slice())));
            self.command(CMD_WRITE, &args)?;
        }
        *tag = staged;
        Ok(())
    }

    fn format(&mut self, tag: &mut NfcTag, _key_a: &[u8; 6], presence: &Presence) -> Result<(), Error> {
        ensure_writable(tag)?;
        presence.ensure_present()?;
        self.command(CMD_FORMAT, &[Arg::Bytes(&tag.uid)])?;
        tag.blocks.clear();
        tag.ndef_records = if tag.technology() == Technology::Type2 { Some(Vec::new()) } else { None };
        info!("formatted tag {}", tag.uid_hex());
        Ok(())
    }

    /// Locks the tag with the configuration built into the device; keys and lock bytes in
    /// `options` are not transmitted.
    fn lock(
        &mut self,
        tag: &mut NfcTag,
        _key_a: &[u8; 6],
        _options: &LockOptions,
        presence: &Presence,
    ) -> Result<(), Error> {
        presence.ensure_present()?;
        self.command(CMD_LOCK, &[Arg::Bytes(&tag.uid)])?;
        tag.is_locked = true;
        tag.is_writable = false;
        info!("locked tag {}", tag.uid_hex());
        Ok(())
    }

    fn send_command(&mut self, tag: &NfcTag, command: &[u8]) -> Result<Vec<u8>, Error> {
        if let Some(presence) = self.shared.presence_of(&tag.uid) {
            presence.ensure_present()?;
        }
        self.command(CMD_RAW, &[Arg::Bytes(&tag.uid), Arg::Bytes(command)])
    }
}


/// The blocks returned by a READ request, served to the technology-specific readers.
struct BlockImage {
    blocks: Vec<Vec<u8>>,
}
impl TagChannel for BlockImage {
    fn authenticate(&mut self, _block: u16, _key_type: KeyType, _key: &[u8; 6]) -> Result<(), Error> {
        // the device authenticated before reading
        Ok(())
    }

    fn read_block(&mut self, block: u16, length: u8) -> Result<Vec<u8>, Error> {
        let data = self.blocks.get(usize::from(block))
            .ok_or_else(|| CommunicationError::Reader(format!("block {} was not returned", block)))?;
        if data.is_empty() {
            return Err(Error::from(CommunicationError::Reader(format!("block {} could not be read", block))));
        }
        Ok(data.iter().copied().take(usize::from(length)).collect())
    }

    fn write_block(&mut self, _block: u16, _data: &[u8]) -> Result<(), Error> {
        Err(Error::Unsupported("writes to a read image".to_owned()))
    }

    fn transmit(&mut self, _command: &[u8]) -> Result<Vec<u8>, Error> {
        Err(Error::Unsupported("raw commands to a read image".to_owned()))
    }
}


/// Collects the block writes of a validated write without touching the tag.
#[derive(Default)]
struct WriteRecorder {
    writes: Vec<(u16, Vec<u8>)>,
}
impl TagChannel for WriteRecorder {
    fn authenticate(&mut self, _block: u16, _key_type: KeyType, _key: &[u8; 6]) -> Result<(), Error> {
        Ok(())
    }

    fn read_block(&mut self, _block: u16, _length: u8) -> Result<Vec<u8>, Error> {
        Err(Error::Unsupported("reads while writing over the serial protocol".to_owned()))
    }

    fn write_block(&mut self, block: u16, data: &[u8]) -> Result<(), Error> {
        self.writes.push((block, data.to_vec()));
        Ok(())
    }

    fn transmit(&mut self, _command: &[u8]) -> Result<Vec<u8>, Error> {
        Err(Error::Unsupported("raw commands while writing over the serial protocol".to_owned()))
    }
}


/// A card in the field of a serial reader, reached through RAW requests.
struct SerialCard<'a> {
    adapter: &'a mut SerialAdapter,
    uid: Vec<u8>,
}
impl<'a> SmartCard for SerialCard<'a> {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        transmit_raw(request, |bytes| {
            let frame = encode_frame(CMD_RAW, &[Arg::Bytes(&self.uid), Arg::Bytes(bytes)])
                .map_err(|e| CommunicationError::Backend(Box::new(e)))?;
            let packet = self.adapter.exchange(CMD_RAW, &frame)?;
            if packet.status != STATUS_OK {
                return Err(CommunicationError::Reader(format!("RAW failed with status 0x{:02X}", packet.status)));
            }
            Ok(packet.data)
        })
    }
}


#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use hex_literal::hex;
    use super::*;
    use crate::iso7816::apdu::{CommandHeader, Data};
    use crate::tag::ndef::{self, Record};

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut ret = (body.len() as u16).to_be_bytes().to_vec();
        ret.extend_from_slice(body);
        ret
    }

    /// The receiving half of a port; reports end of file once every sender is gone.
    struct ChannelReader {
        incoming: Receiver<Vec<u8>>,
        pending: VecDeque<u8>,
    }
    impl Read for ChannelReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                match self.incoming.recv() {
                    Ok(bytes) => self.pending.extend(bytes),
                    Err(_) => return Ok(0),
                }
            }
            let count = buf.len().min(self.pending.len());
            for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..count)) {
                *slot = byte;
            }
            Ok(count)
        }
    }

    /// The device side: every request but SCAN is answered with the next scripted reply.
    struct ScriptedDevice {
        replies: VecDeque<Vec<u8>>,
        to_host: Sender<Vec<u8>>,
        written: Arc<Mutex<Vec<Vec<u8>>>>,
    }
    impl Write for ScriptedDevice {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().push(buf.to_vec());
            if buf.get(2) != Some(&CMD_SCAN) {
                if let Some(reply) = self.replies.pop_front() {
                    let _ = self.to_host.send(reply);
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Harness {
        adapter: SerialAdapter,
        events: Receiver<AdapterEvent>,
        to_host: Sender<Vec<u8>>,
        written: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    fn test_config(timeout_ms: u64) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.command_timeout_ms = timeout_ms;
        config.serial.port = "/dev/ttyTEST0".to_owned();
        config
    }

    fn harness(replies: Vec<Vec<u8>>, timeout_ms: u64) -> Harness {
        let (to_host, incoming) = mpsc::channel();
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut port = Some(SerialPort {
            reader: Box::new(ChannelReader { incoming, pending: VecDeque::new() }),
            writer: Box::new(ScriptedDevice {
                replies: replies.into(),
                to_host: to_host.clone(),
                written: Arc::clone(&written),
            }),
        });
        let mut adapter = SerialAdapter::new(
            &test_config(timeout_ms),
            Box::new(move || port.take().ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "gone"))),
        );
        let events = adapter.subscribe();
        adapter.connect().unwrap();
        Harness { adapter, events, to_host, written }
    }

    fn next_event(events: &Receiver<AdapterEvent>) -> AdapterEvent {
        events.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    fn discover(harness: &Harness, uid: &[u8], type_code: u8) -> TagDescriptor {
        let mut body = vec![NOTIFY_TAG_DISCOVERED, STATUS_OK, uid.len() as u8];
        body.extend_from_slice(uid);
        body.push(type_code);
        harness.to_host.send(frame(&body)).unwrap();
        loop {
            if let AdapterEvent::TagDiscovered(descriptor) = next_event(&harness.events) {
                return descriptor;
            }
        }
    }

    #[test]
    fn test_encode_frame() {
        assert_eq!(encode_frame(CMD_SCAN, &[]).unwrap(), hex!("0001 01"));
        assert_eq!(
            encode_frame(CMD_READ, &[Arg::Bytes(&hex!("04A1B2C3"))]).unwrap(),
            hex!("0006 02 04 04A1B2C3"),
        );
        assert_eq!(
            encode_frame(CMD_WRITE, &[Arg::Bytes(&hex!("01020304")), Arg::Byte(4), Arg::Bytes(&hex!("AABBCCDD"))]).unwrap(),
            hex!("000C 03 04 01020304 04 04 AABBCCDD"),
        );
        assert_eq!(
            encode_frame(CMD_RAW, &[Arg::Bytes(&[0u8; 256])]),
            Err(FrameError::ArgumentTooLong { length: 256 }),
        );
    }

    #[test]
    fn test_decoder_reassembles() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&hex!("00 04 82 00"));
        assert_eq!(decoder.next_frame(), None);
        decoder.push(&hex!("01 02 00 02 83 00 00"));
        assert_eq!(decoder.next_frame(), Some(hex!("82000102").to_vec()));
        assert_eq!(decoder.next_frame(), Some(hex!("8300").to_vec()));
        assert_eq!(decoder.next_frame(), None);
        decoder.push(&hex!("03 01 02"));
        assert_eq!(decoder.next_frame(), None);
    }

    #[test]
    fn test_inbound_parse() {
        assert_eq!(
            Inbound::parse(&hex!("01 00 04 DEADBEEF 08")),
            Some(Inbound::TagDiscovered { uid: hex!("DEADBEEF").to_vec(), tag_type: TagType::MifareClassic1K }),
        );
        assert_eq!(
            Inbound::parse(&hex!("01 00 07 04112233445566 45")),
            Some(Inbound::TagDiscovered { uid: hex!("04112233445566").to_vec(), tag_type: TagType::Ntag215 }),
        );
        assert_eq!(
            Inbound::parse(&hex!("01 00 04 DEADBEEF 99")),
            Some(Inbound::TagDiscovered { uid: hex!("DEADBEEF").to_vec(), tag_type: TagType::Unknown }),
        );
        assert_eq!(Inbound::parse(&hex!("01 01")), None);
        assert_eq!(Inbound::parse(&hex!("01 00 09 DEAD")), None);
        assert_eq!(
            Inbound::parse(&hex!("02 00 DEADBEEF")),
            Some(Inbound::TagRemoved { uid: hex!("DEADBEEF").to_vec() }),
        );
        assert_eq!(
            Inbound::parse(&hex!("87 00 312E30")),
            Some(Inbound::Response(Packet { command: 0x87, status: 0x00, data: b"1.0".to_vec() })),
        );
        assert_eq!(Inbound::parse(&hex!("42 00")), None);
        assert_eq!(Inbound::parse(&hex!("87")), None);
    }

    #[test]
    fn test_parse_blocks() {
        assert_eq!(
            parse_blocks(&hex!("04 01020304 00 02 AABB")).unwrap(),
            vec![hex!("01020304").to_vec(), Vec::new(), hex!("AABB").to_vec()],
        );
        assert!(parse_blocks(&[]).unwrap().is_empty());
        assert!(matches!(parse_blocks(&hex!("04 0102")), Err(CommunicationError::ShortResponse)));
    }

    #[test]
    fn test_contiguous_runs() {
        let runs = contiguous_runs(vec![
            (1, vec![1]), (2, vec![2]), (4, vec![4]), (5, vec![5]), (6, vec![6]), (8, vec![8]),
        ]);
        assert_eq!(runs, vec![
            (1, vec![vec![1], vec![2]]),
            (4, vec![vec![4], vec![5], vec![6]]),
            (8, vec![vec![8]]),
        ]);
    }

    #[test]
    fn test_discovery_and_removal() {
        let harness = harness(Vec::new(), 1000);
        assert!(matches!(
            next_event(&harness.events),
            AdapterEvent::ReaderConnected { reader } if reader == "/dev/ttyTEST0"
        ));

        let descriptor = discover(&harness, &hex!("04112233445566"), 0x44);
        assert_eq!(descriptor.uid, hex!("04112233445566"));
        assert_eq!(descriptor.tag_type, Some(TagType::Ntag213));
        assert_eq!(descriptor.reader, "/dev/ttyTEST0");
        assert!(descriptor.presence.is_present());

        // reported again by the next scan; no second discovery
        harness.to_host.send(frame(&hex!("01 00 07 04112233445566 44"))).unwrap();
        harness.to_host.send(frame(&hex!("02 00 04112233445566"))).unwrap();
        match next_event(&harness.events) {
            AdapterEvent::TagRemoved { uid } => assert_eq!(uid, hex!("04112233445566")),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!descriptor.presence.is_present());
    }

    #[test]
    fn test_scanning_sends_scan() {
        let mut harness = harness(Vec::new(), 1000);
        harness.adapter.start_scanning().unwrap();
        harness.adapter.poll().unwrap();
        assert_eq!(*harness.written.lock().unwrap(), vec![hex!("000101").to_vec()]);

        harness.adapter.stop_scanning().unwrap();
        harness.adapter.poll().unwrap();
        assert_eq!(harness.written.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_get_info() {
        let mut harness = harness(vec![frame(b"\x87\x00fw 1.2\r\n")], 1000);
        let info = harness.adapter.get_info().unwrap();
        assert_eq!(info.adapter, AdapterKind::Serial);
        assert_eq!(info.version, "fw 1.2");
        assert!(info.available);
        assert_eq!(info.details.get("baud_rate").map(String::as_str), Some("115200"));
        assert_eq!(*harness.written.lock().unwrap(), vec![hex!("000107").to_vec()]);
    }

    #[test]
    fn test_timeout() {
        let mut harness = harness(Vec::new(), 50);
        let error = harness.adapter.get_info().unwrap_err();
        assert!(matches!(error, Error::Communication(CommunicationError::Timeout { timeout_ms: 50 })));
        assert_eq!(error.kind(), crate::error::ErrorKind::Transport);
    }

    #[test]
    fn test_read_type2() {
        let uid = hex!("04112233445566");
        let uri = Record::uri("https://example.com");
        let tlv = ndef::wrap_tlv(&ndef::encode_message(&[uri.clone()]).unwrap()).unwrap();
        let mut memory = vec![0u8; 45 * 4];
        memory[12..16].copy_from_slice(&hex!("E1101200"));
        memory[16..16 + tlv.len()].copy_from_slice(&tlv);
        let mut body = vec![CMD_READ | RESPONSE_FLAG, STATUS_OK];
        for page in memory.chunks(4) {
            body.push(4);
            body.extend_from_slice(page);
        }

        let mut harness = harness(vec![frame(&body)], 1000);
        let mut tag = NfcTag::with_type(uid.to_vec(), Vec::new(), TagType::Ntag213);
        let content = harness.adapter.read(&mut tag, &crate::tag::DEFAULT_KEY, &Presence::new()).unwrap();
        let TagContent::Type2 { pages, capability_container, ndef } = content else {
            panic!("not a Type 2 readout");
        };
        assert_eq!(pages.len(), 45);
        assert_eq!(capability_container.map(|cc| cc.memory_size), Some(144));
        assert_eq!(ndef, Some(Ok(vec![uri.clone()])));
        assert_eq!(tag.ndef_records, Some(vec![uri]));
        assert_eq!(*harness.written.lock().unwrap(), vec![hex!("0009 02 07 04112233445566").to_vec()]);
    }

    #[test]
    fn test_write_ndef() {
        let uid = hex!("04112233445566");
        let uri = Record::uri("https://example.com");
        let mut harness = harness(vec![frame(&hex!("83 00"))], 1000);
        let mut tag = NfcTag::with_type(uid.to_vec(), Vec::new(), TagType::Ntag213);
        harness.adapter.write(
            &mut tag,
            &WriteRequest::Ndef(vec![uri.clone()]),
            &crate::tag::DEFAULT_KEY,
            &Presence::new(),
        ).unwrap();

        let mut tlv = ndef::wrap_tlv(&ndef::encode_message(&[uri.clone()]).unwrap()).unwrap();
        tlv.resize(20, 0x00);
        let mut body = vec![CMD_WRITE, 7];
        body.extend_from_slice(&uid);
        body.push(4);
        for page in tlv.chunks(4) {
            body.push(4);
            body.extend_from_slice(page);
        }
        assert_eq!(*harness.written.lock().unwrap(), vec![frame(&body)]);
        assert_eq!(tag.ndef_records, Some(vec![uri]));
        assert_eq!(tag.blocks.len(), 5);
    }

    #[test]
    fn test_refused_write_keeps_model() {
        let mut harness = harness(vec![frame(&hex!("83 01"))], 1000);
        let mut tag = NfcTag::with_type(hex!("01020304").to_vec(), Vec::new(), TagType::MifareClassic1K);
        let error = harness.adapter.write(
            &mut tag,
            &WriteRequest::Blocks(vec![(4, vec![0xAA; 16])]),
            &crate::tag::DEFAULT_KEY,
            &Presence::new(),
        ).unwrap_err();
        assert!(matches!(error, Error::Status { operation: "WRITE", status: 0x01 }));
        assert!(tag.blocks.is_empty());

        // invalid writes never reach the device
        let error = harness.adapter.write(
            &mut tag,
            &WriteRequest::Blocks(vec![(3, vec![0xAA; 16])]),
            &crate::tag::DEFAULT_KEY,
            &Presence::new(),
        ).unwrap_err();
        assert!(matches!(error, Error::InvalidRequest(_)));
        assert_eq!(harness.written.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_format_and_lock() {
        let mut harness = harness(vec![frame(&hex!("84 00")), frame(&hex!("85 00"))], 1000);
        let mut tag = NfcTag::with_type(hex!("04112233445566").to_vec(), Vec::new(), TagType::Ntag215);
        let presence = Presence::new();
        harness.adapter.format(&mut tag, &crate::tag::DEFAULT_KEY, &presence).unwrap();
        assert_eq!(tag.ndef_records, Some(Vec::new()));
        harness.adapter.lock(&mut tag, &crate::tag::DEFAULT_KEY, &LockOptions::default(), &presence).unwrap();
        assert!(tag.is_locked);
        assert!(!tag.is_writable);
        assert_eq!(*harness.written.lock().unwrap(), vec![
            hex!("0009 04 07 04112233445566").to_vec(),
            hex!("0009 05 07 04112233445566").to_vec(),
        ]);

        // a locked tag cannot be formatted
        assert!(matches!(
            harness.adapter.format(&mut tag, &crate::tag::DEFAULT_KEY, &presence),
            Err(Error::InvalidRequest(_)),
        ));
    }

    #[test]
    fn test_card_channel() {
        let mut harness = harness(vec![frame(&hex!("86 00 0102030405060708 9000"))], 1000);
        let uid = hex!("08A1B2C3");
        discover(&harness, &uid, 0x20);

        let mut card = harness.adapter.card_channel(&uid).unwrap();
        let response = card.communicate(&Apdu::new(
            CommandHeader::new(0x00, 0x84, 0x00, 0x00),
            Data::ResponseDataShort { response_data_length: 8 },
        )).unwrap();
        drop(card);
        assert!(response.is_success());
        assert_eq!(response.data, hex!("0102030405060708"));
        assert_eq!(
            *harness.written.lock().unwrap(),
            vec![hex!("000C 06 04 08A1B2C3 05 0084000008").to_vec()],
        );

        let error = harness.adapter.card_channel(&hex!("99999999")).err().unwrap();
        assert!(error.is_card_removed());
    }

    #[test]
    fn test_port_closed() {
        let (to_host, incoming) = mpsc::channel();
        let mut port = Some(SerialPort {
            reader: Box::new(ChannelReader { incoming, pending: VecDeque::new() }),
            writer: Box::new(io::sink()),
        });
        let mut adapter = SerialAdapter::new(
            &test_config(1000),
            Box::new(move || port.take().ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "gone"))),
        );
        let events = adapter.subscribe();
        adapter.connect().unwrap();
        assert!(matches!(next_event(&events), AdapterEvent::ReaderConnected { .. }));

        to_host.send(frame(&hex!("01 00 04 DEADBEEF 08"))).unwrap();
        let AdapterEvent::TagDiscovered(descriptor) = next_event(&events) else {
            panic!("no discovery");
        };
        drop(to_host);
        assert!(matches!(next_event(&events), AdapterEvent::ReaderDisconnected { .. }));
        assert!(!descriptor.presence.is_present());
        assert!(matches!(
            adapter.get_info(),
            Err(Error::Communication(CommunicationError::NotConnected)),
        ));
    }

    #[test]
    fn test_open_failures() {
        let mut adapter = SerialAdapter::new(
            &test_config(1000),
            Box::new(|| Err(io::Error::new(io::ErrorKind::PermissionDenied, "dialout group"))),
        );
        assert!(matches!(adapter.connect(), Err(Error::Permission(_))));
        assert!(matches!(
            adapter.start_scanning(),
            Err(Error::Communication(CommunicationError::NotConnected)),
        ));

        let mut adapter = SerialAdapter::new(
            &test_config(1000),
            Box::new(|| Err(io::Error::new(io::ErrorKind::NotFound, "no such device"))),
        );
        let error = adapter.connect().unwrap_err();
        assert_eq!(error.kind(), crate::error::ErrorKind::Transport);
        assert!(!adapter.get_info().unwrap().available);
    }
}

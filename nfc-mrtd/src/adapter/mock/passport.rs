//! An in-memory eMRTD chip answering BAC, PACE, secure messaging and file commands.


use std::collections::{BTreeMap, BTreeSet};

use hmac::{Hmac, Mac};
use rand::{RngCore, SeedableRng};
use rand::rngs::StdRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::crypt::{DES_BLOCK_SIZE, padded_iso9797_m2};
use crate::crypt::tdes::{decrypt_cbc, encrypt_cbc, retail_mac, verify_retail_mac};
use crate::der_util::encode_tlv;
use crate::iso7816::apdu::{Apdu, Response, ResponseTrailer};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::iso7816::file::MRTD_APPLICATION_ID;
use crate::kdf::{bac_key_seed, Kdf, Kdf3Des};
use crate::lds::{self, EF_COM};
use crate::mrz::MrzInfo;
use crate::pace::chip::PaceChip;
use crate::secure_messaging::{SecureMessagingSession, SessionKeys};


const SW_END_OF_FILE: u16 = 0x6282;
const SW_VERIFICATION_FAILED: u16 = 0x63C0;
const SW_WRONG_LENGTH: u16 = 0x6700;
const SW_SM_DATA_OBJECTS_INCORRECT: u16 = 0x6988;
const SW_SECURITY_STATUS_NOT_SATISFIED: u16 = 0x6982;
const SW_AUTHENTICATION_BLOCKED: u16 = 0x6983;
const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
const SW_NO_CURRENT_EF: u16 = 0x6986;
const SW_WRONG_PARAMETERS: u16 = 0x6A86;
const SW_FILE_NOT_FOUND: u16 = 0x6A82;
const SW_REFERENCE_NOT_FOUND: u16 = 0x6A88;
const SW_WRONG_OFFSET: u16 = 0x6B00;
const SW_INS_NOT_SUPPORTED: u16 = 0x6D00;
const SW_AUTHENTICATION_FAILED: u16 = 0x6300;

const PIN_TRIES: u8 = 3;


struct BacKeys {
    k_enc: Zeroizing<[u8; 24]>,
    k_mac: Zeroizing<[u8; 24]>,
}


/// A passport chip living in memory.
///
/// Without BAC or PACE configured, the files are readable in plain. Once access control is
/// configured, files can only be read inside a secure messaging session, and a plain command
/// arriving during a session ends it.
pub struct EmulatedPassport {
    files: BTreeMap<u16, Vec<u8>>,
    unreadable: BTreeSet<u16>,
    bac: Option<BacKeys>,
    pace: Option<PaceChip>,
    pin: Option<Zeroizing<Vec<u8>>>,
    pin_tries: u8,
    aa_key: Option<Zeroizing<Vec<u8>>>,
    max_response_length: usize,
    rng: StdRng,

    application_selected: bool,
    selected_file: Option<u16>,
    challenge: Option<[u8; 8]>,
    session: Option<SecureMessagingSession>,
}
impl EmulatedPassport {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// A chip whose challenges, nonces and keys are reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            files: BTreeMap::new(),
            unreadable: BTreeSet::new(),
            bac: None,
            pace: None,
            pin: None,
            pin_tries: PIN_TRIES,
            aa_key: None,
            max_response_length: 0x100,
            rng,
            application_selected: false,
            selected_file: None,
            challenge: None,
            session: None,
        }
    }

    /// Requires BAC with keys derived from the given MRZ information.
    pub fn with_bac(mut self, mrz_info: &MrzInfo) -> Self {
        let seed = bac_key_seed(mrz_info);
        self.bac = Some(BacKeys {
            k_enc: Kdf3Des::derive_encryption_key(seed.as_slice()),
            k_mac: Kdf3Des::derive_mac_key(seed.as_slice()),
        });
        self
    }

    /// Accepts PACE with the given card access number.
    pub fn with_pace_can(self, can: &str) -> Self {
        self.with_pace(None, Some(can.as_bytes()))
    }

    /// Accepts PACE with the given MRZ information as the password.
    pub fn with_pace_mrz(self, mrz_info: &MrzInfo) -> Self {
        let password = Zeroizing::new(mrz_info.mrz_information());
        self.with_pace(Some(password.as_bytes()), None)
    }

    fn with_pace(mut self, mrz_password: Option<&[u8]>, can: Option<&[u8]>) -> Self {
        self.pace = Some(PaceChip::new(mrz_password, can));
        self
    }

    pub fn with_file(mut self, file_id: u16, content: Vec<u8>) -> Self {
        self.files.insert(file_id, content);
        self
    }

    /// Stores a data group under its file identifier; numbers outside 1..=16 are ignored.
    pub fn with_data_group(self, number: u8, content: Vec<u8>) -> Self {
        match lds::file_id(number) {
            Some(file_id) => self.with_file(file_id, content),
            None => self,
        }
    }

    /// Stores an EF.COM listing the given data groups.
    pub fn with_com(self, data_groups: &[u8]) -> Self {
        let tags: Vec<u8> = data_groups.iter()
            .filter_map(|number| lds::data_group_tag(*number))
            .collect();
        let mut body = Vec::new();
        encode_tlv(&mut body, &[0x5F, 0x01], b"0107");
        encode_tlv(&mut body, &[0x5F, 0x36], b"040000");
        encode_tlv(&mut body, &[0x5C], &tags);
        let mut com = Vec::new();
        encode_tlv(&mut com, &[0x60], &body);
        self.with_file(EF_COM, com)
    }

    /// A file that can be selected but whose reads are refused.
    pub fn with_unreadable_file(mut self, file_id: u16) -> Self {
        self.files.entry(file_id).or_default();
        self.unreadable.insert(file_id);
        self
    }

    pub fn with_pin(mut self, pin: &[u8]) -> Self {
        self.pin = Some(Zeroizing::new(pin.to_vec()));
        self
    }

    /// Answers INTERNAL AUTHENTICATE with an HMAC-SHA256 of the challenge under the given key.
    pub fn with_active_authentication(mut self, key: &[u8]) -> Self {
        self.aa_key = Some(Zeroizing::new(key.to_vec()));
        self
    }

    /// Caps the data returned by a single READ BINARY, as chips that leave room for secure
    /// messaging overhead do.
    pub fn with_max_response_length(mut self, length: usize) -> Self {
        self.max_response_length = length;
        self
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    fn access_controlled(&self) -> bool {
        self.bac.is_some() || self.pace.is_some()
    }

    fn access_granted(&self) -> bool {
        !self.access_controlled() || self.session.is_some()
    }

    fn process(&mut self, request: &Apdu) -> Response {
        match request.header.ins {
            0xA4 => self.select(request),
            0xB0 => self.read_binary(request),
            0x84 => self.get_challenge(),
            0x82 => self.mutual_authenticate(request),
            0x20 => self.verify(request),
            0x88 => self.internal_authenticate(request),
            _ => Response::status(SW_INS_NOT_SUPPORTED),
        }
    }

    fn select(&mut self, request: &Apdu) -> Response {
        let data = request.data.request_data().unwrap_or(&[]);
        match request.header.p1 {
            0x04 => {
                if data != &MRTD_APPLICATION_ID[..] {
                    return Response::status(SW_FILE_NOT_FOUND);
                }
                self.application_selected = true;
                self.selected_file = None;
                Response::status(0x9000)
            },
            0x02 => {
                let &[high, low] = data else {
                    return Response::status(SW_WRONG_LENGTH);
                };
                let file_id = u16::from_be_bytes([high, low]);
                if !self.application_selected || !self.files.contains_key(&file_id) {
                    return Response::status(SW_FILE_NOT_FOUND);
                }
                self.selected_file = Some(file_id);
                Response::status(0x9000)
            },
            _ => Response::status(SW_WRONG_PARAMETERS),
        }
    }

    fn read_binary(&mut self, request: &Apdu) -> Response {
        if !self.access_granted() {
            return Response::status(SW_SECURITY_STATUS_NOT_SATISFIED);
        }
        let Some(file_id) = self.selected_file else {
            return Response::status(SW_NO_CURRENT_EF);
        };
        if self.unreadable.contains(&file_id) {
            return Response::status(SW_SECURITY_STATUS_NOT_SATISFIED);
        }
        if request.header.p1 & 0x80 != 0 {
            return Response::status(SW_WRONG_PARAMETERS);
        }
        let Some(content) = self.files.get(&file_id) else {
            return Response::status(SW_NO_CURRENT_EF);
        };

        let offset = usize::from(u16::from_be_bytes([request.header.p1, request.header.p2]));
        let length = request.data.response_data_length()
            .unwrap_or(0x100)
            .min(self.max_response_length);
        if offset > content.len() {
            return Response::status(SW_WRONG_OFFSET);
        }
        if offset == content.len() && offset > 0 {
            return Response::status(SW_END_OF_FILE);
        }
        let end = content.len().min(offset + length);
        Response::new(content[offset..end].to_vec(), ResponseTrailer::SUCCESS)
    }

    fn get_challenge(&mut self) -> Response {
        if self.bac.is_none() {
            return Response::status(SW_INS_NOT_SUPPORTED);
        }
        let mut challenge = [0u8; 8];
        self.rng.fill_bytes(&mut challenge);
        self.challenge = Some(challenge);
        Response::new(challenge.to_vec(), ResponseTrailer::SUCCESS)
    }

    fn mutual_authenticate(&mut self, request: &Apdu) -> Response {
        let (Some(keys), Some(rnd_icc)) = (&self.bac, self.challenge.take()) else {
            return Response::status(SW_CONDITIONS_NOT_SATISFIED);
        };
        let data = request.data.request_data().unwrap_or(&[]);
        if data.len() != 40 {
            return Response::status(SW_WRONG_LENGTH);
        }

        let (encrypted, mac) = data.split_at(32);
        let mac_valid = verify_retail_mac(&keys.k_mac, &padded_iso9797_m2(encrypted, DES_BLOCK_SIZE), mac);
        if !matches!(mac_valid, Ok(true)) {
            debug!("emulated BAC: terminal MAC wrong");
            return Response::status(SW_AUTHENTICATION_FAILED);
        }
        let mut plain = Zeroizing::new(encrypted.to_vec());
        if decrypt_cbc(&keys.k_enc, &mut plain).is_err() {
            return Response::status(SW_AUTHENTICATION_FAILED);
        }
        if plain[8..16] != rnd_icc[..] {
            debug!("emulated BAC: terminal did not echo the challenge");
            return Response::status(SW_AUTHENTICATION_FAILED);
        }
        let rnd_ifd = &plain[0..8];
        let k_ifd = &plain[16..32];

        let mut k_icc = Zeroizing::new([0u8; 16]);
        self.rng.fill_bytes(k_icc.as_mut_slice());

        let mut response_data = Zeroizing::new(Vec::with_capacity(40));
        response_data.extend_from_slice(&rnd_icc);
        response_data.extend_from_slice(rnd_ifd);
        response_data.extend_from_slice(k_icc.as_slice());
        if encrypt_cbc(&keys.k_enc, &mut response_data).is_err() {
            return Response::status(SW_AUTHENTICATION_FAILED);
        }
        let Ok(response_mac) = retail_mac(&keys.k_mac, &padded_iso9797_m2(&response_data, DES_BLOCK_SIZE)) else {
            return Response::status(SW_AUTHENTICATION_FAILED);
        };
        response_data.extend_from_slice(&response_mac);

        let mut seed = Zeroizing::new([0u8; 16]);
        for ((s, ifd), icc) in seed.iter_mut().zip(k_ifd.iter()).zip(k_icc.iter()) {
            *s = *ifd ^ *icc;
        }
        let mut ssc = [0u8; 8];
        ssc[0..4].copy_from_slice(&rnd_icc[4..8]);
        ssc[4..8].copy_from_slice(&rnd_ifd[4..8]);
        self.session = Some(SecureMessagingSession::new(SessionKeys::from_seed(seed.as_slice()), ssc));
        debug!("emulated BAC established");

        Response::new(response_data.to_vec(), ResponseTrailer::SUCCESS)
    }

    fn verify(&mut self, request: &Apdu) -> Response {
        let Some(pin) = &self.pin else {
            return Response::status(SW_REFERENCE_NOT_FOUND);
        };
        if self.pin_tries == 0 {
            return Response::status(SW_AUTHENTICATION_BLOCKED);
        }
        let offered = request.data.request_data().unwrap_or(&[]);
        if bool::from(pin.as_slice().ct_eq(offered)) {
            self.pin_tries = PIN_TRIES;
            Response::status(0x9000)
        } else {
            self.pin_tries -= 1;
            Response::status(SW_VERIFICATION_FAILED | u16::from(self.pin_tries))
        }
    }

    fn internal_authenticate(&mut self, request: &Apdu) -> Response {
        let Some(key) = &self.aa_key else {
            return Response::status(SW_INS_NOT_SUPPORTED);
        };
        if !self.access_granted() {
            return Response::status(SW_SECURITY_STATUS_NOT_SATISFIED);
        }
        let challenge = request.data.request_data().unwrap_or(&[]);
        if challenge.len() != 8 {
            return Response::status(SW_WRONG_LENGTH);
        }
        let Ok(mut mac) = <Hmac<Sha256> as Mac>::new_from_slice(key) else {
            return Response::status(SW_CONDITIONS_NOT_SATISFIED);
        };
        mac.update(challenge);
        Response::new(mac.finalize().into_bytes().to_vec(), ResponseTrailer::SUCCESS)
    }
}
impl Default for EmulatedPassport {
    fn default() -> Self {
        Self::new()
    }
}
impl SmartCard for EmulatedPassport {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        trace!("emulated passport received {:?}", request.header);

        if request.header.cla & 0x0C == 0x0C {
            let Some(session) = self.session.as_mut() else {
                return Ok(Response::status(SW_SM_DATA_OBJECTS_INCORRECT));
            };
            let plain_request = match session.unprotect_command(request) {
                Ok(plain) => plain,
                Err(e) => {
                    debug!("emulated passport dropping session: {}", e);
                    self.session = None;
                    return Ok(Response::status(SW_SM_DATA_OBJECTS_INCORRECT));
                },
            };
            let plain_response = self.process(&plain_request);
            let Some(session) = self.session.as_mut() else {
                return Ok(plain_response);
            };
            return match session.protect_response(&plain_response) {
                Ok(protected) => Ok(protected),
                Err(e) => {
                    debug!("emulated passport failed to protect response: {}", e);
                    self.session = None;
                    Ok(Response::status(SW_SM_DATA_OBJECTS_INCORRECT))
                },
            };
        }

        if self.session.take().is_some() {
            debug!("plain command ends the emulated secure messaging session");
        }

        if PaceChip::handles(request) {
            let Some(pace) = self.pace.as_mut() else {
                return Ok(Response::status(SW_INS_NOT_SUPPORTED));
            };
            let (response, session) = pace.process(request, &mut self.rng);
            if session.is_some() {
                debug!("emulated PACE established");
                self.session = session;
            }
            return Ok(response);
        }

        Ok(self.process(request))
    }
}

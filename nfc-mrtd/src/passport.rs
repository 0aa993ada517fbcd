//! Reading an electronic passport from start to finish.


use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rand::{CryptoRng, RngCore};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::bac::BacProtocol;
use crate::error::{Error, ErrorKind, UnitError};
use crate::iso7816::apdu::{Apdu, CommandHeader, Data};
use crate::iso7816::card::SmartCard;
use crate::iso7816::file::{read_file, select_application, MRTD_APPLICATION_ID};
use crate::lds::{self, Com, DataGroup, SecurityObject, EF_COM, EF_SOD, MAX_DATA_GROUP};
use crate::mrz::{MrzData, MrzInfo};
use crate::pace::{validate_can, PaceProtocol};
use crate::presence::Presence;
use crate::secure_messaging::{SecureChannel, SecureMessagingSession};


/// Length of the Active Authentication challenge.
pub const ACTIVE_AUTHENTICATION_CHALLENGE_LENGTH: usize = 8;


/// What the holder supplied to unlock the chip.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum AccessKey {
    Mrz(MrzInfo),
    Can(String),
}
impl AccessKey {
    /// Builds an access key from a card access number.
    pub fn can(can: &str) -> Result<Self, Error> {
        validate_can(can)?;
        Ok(Self::Can(can.to_owned()))
    }

    /// Builds an access key from the complete text of a machine-readable zone.
    pub fn from_mrz_text(text: &str) -> Result<Self, Error> {
        let mrz = MrzData::parse(text)?;
        Ok(Self::Mrz(MrzInfo::from_mrz(&mrz)))
    }
}
impl From<MrzInfo> for AccessKey {
    fn from(value: MrzInfo) -> Self {
        Self::Mrz(value)
    }
}


/// Which protocol to unlock the chip with.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Bac,
    Pace,

    /// PACE for a card access number, BAC for MRZ information.
    #[default]
    Auto,
}
impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bac => write!(f, "bac"),
            Self::Pace => write!(f, "pace"),
            Self::Auto => write!(f, "auto"),
        }
    }
}
impl FromStr for AuthMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bac" => Ok(Self::Bac),
            "pace" => Ok(Self::Pace),
            "auto" => Ok(Self::Auto),
            other => Err(Error::InvalidRequest(format!("unknown authentication method {:?}", other))),
        }
    }
}


/// The protocol that actually established the session.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Authenticated {
    Bac,
    Pace,
}


/// Everything read from a passport.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PassportData {
    pub authenticated: Option<Authenticated>,
    pub com: Option<Com>,
    pub com_error: Option<UnitError>,
    pub sod: Option<SecurityObject>,
    pub sod_error: Option<UnitError>,

    /// Every data group that was present, with its decoded contents or the reason it could not
    /// be read or decoded.
    pub data_groups: BTreeMap<u8, Result<DataGroup, UnitError>>,
}
impl PassportData {
    /// The machine-readable zone from DG1, if it was read and is valid.
    pub fn mrz(&self) -> Option<&MrzData> {
        match self.data_groups.get(&1) {
            Some(Ok(DataGroup { content: lds::DataGroupContent::Mrz(mrz), .. })) => Some(mrz),
            _ => None,
        }
    }
}


/// Runs BAC or PACE, whichever the method and the access key call for.
#[instrument(skip_all, fields(method = %method))]
pub fn authenticate<SC: SmartCard + ?Sized, R: RngCore + CryptoRng>(
    card: &mut SC,
    access_key: &AccessKey,
    method: AuthMethod,
    rng: &mut R,
) -> Result<(Authenticated, SecureMessagingSession), Error> {
    let established = match (method, access_key) {
        (AuthMethod::Bac|AuthMethod::Auto, AccessKey::Mrz(mrz_info)) => {
            let session = BacProtocol::new(mrz_info).authenticate(card, rng)?;
            (Authenticated::Bac, session)
        },
        (AuthMethod::Bac, AccessKey::Can(_)) => {
            return Err(Error::InvalidRequest("BAC requires MRZ information, not a card access number".to_owned()));
        },
        (AuthMethod::Pace, AccessKey::Mrz(mrz_info)) => {
            let session = PaceProtocol::from_mrz(mrz_info).authenticate(card, rng)?;
            (Authenticated::Pace, session)
        },
        (AuthMethod::Pace|AuthMethod::Auto, AccessKey::Can(can)) => {
            let can = Zeroizing::new(can.clone());
            let session = PaceProtocol::from_can(&can)?.authenticate(card, rng)?;
            (Authenticated::Pace, session)
        },
    };
    info!("authenticated using {:?}", established.0);
    Ok(established)
}


/// Reads a passport: selects the eMRTD application, authenticates if an access key is given, then
/// reads EF.COM, EF.SOD and every data group present on the chip.
pub fn read_passport<SC: SmartCard + ?Sized>(
    card: &mut SC,
    access_key: Option<&AccessKey>,
    method: AuthMethod,
    presence: &Presence,
) -> Result<PassportData, Error> {
    read_passport_with_rng(card, access_key, method, presence, &mut OsRng)
}


/// [`read_passport`] with a caller-supplied random number generator.
#[instrument(skip_all)]
pub fn read_passport_with_rng<SC: SmartCard + ?Sized, R: RngCore + CryptoRng>(
    card: &mut SC,
    access_key: Option<&AccessKey>,
    method: AuthMethod,
    presence: &Presence,
    rng: &mut R,
) -> Result<PassportData, Error> {
    presence.ensure_present()?;
    select_application(card, &MRTD_APPLICATION_ID)?;

    match access_key {
        Some(key) => {
            let (authenticated, session) = authenticate(card, key, method, rng)?;
            let mut channel = SecureChannel::new(card, session);
            let mut data = read_files(&mut channel, presence)?;
            data.authenticated = Some(authenticated);
            Ok(data)
        },
        None => read_files(card, presence),
    }
}


/// Reads EF.COM, EF.SOD and the data groups over an already prepared channel.
///
/// Every data group from 1 to 16 is tried, the ones EF.COM lists first. Groups the chip does not
/// have are left out of the result; groups that fail are recorded one by one.
pub fn read_files<SC: SmartCard + ?Sized>(card: &mut SC, presence: &Presence) -> Result<PassportData, Error> {
    let mut data = PassportData::default();

    let com = read_unit(card, EF_COM, presence)?
        .and_then(|raw| lds::parse_com(&raw).map_err(|e| Unit::Failed(UnitError::from(&Error::from(e)))));
    let listed_groups: Vec<u8> = match com {
        Ok(com) => {
            let groups = com.data_groups.clone();
            data.com = Some(com);
            groups
        },
        Err(unit) => {
            warn!("EF.COM not usable, reading every data group");
            data.com_error = Some(unit.into_error(EF_COM));
            Vec::new()
        },
    };

    let sod = read_unit(card, EF_SOD, presence)?
        .and_then(|raw| lds::parse_sod(&raw).map_err(|e| Unit::Failed(UnitError::from(&Error::from(e)))));
    match sod {
        Ok(sod) => data.sod = Some(sod),
        Err(unit) => data.sod_error = Some(unit.into_error(EF_SOD)),
    }

    for number in read_order(&listed_groups) {
        let Some(file_id) = lds::file_id(number) else {
            continue;
        };
        let raw = match read_unit(card, file_id, presence)? {
            Ok(raw) => raw,
            Err(Unit::Missing) => {
                debug!("DG{} not present", number);
                continue;
            },
            Err(Unit::Failed(e)) => {
                data.data_groups.insert(number, Err(e));
                continue;
            },
        };
        if data.com.is_some() && !listed_groups.contains(&number) {
            warn!("DG{} is present but not listed in EF.COM", number);
        }
        let parsed = lds::parse_data_group(number, &raw)
            .map_err(|e| UnitError::from(&Error::from(e)));
        data.data_groups.insert(number, parsed);
    }
    Ok(data)
}


/// Every data group number, those listed in EF.COM first.
fn read_order(listed_groups: &[u8]) -> Vec<u8> {
    let mut order = Vec::with_capacity(usize::from(MAX_DATA_GROUP));
    for number in listed_groups.iter().copied().chain(1..=MAX_DATA_GROUP) {
        if (1..=MAX_DATA_GROUP).contains(&number) && !order.contains(&number) {
            order.push(number);
        }
    }
    order
}


/// Why a single file yielded nothing.
enum Unit {
    Missing,
    Failed(UnitError),
}
impl Unit {
    fn into_error(self, file_id: u16) -> UnitError {
        match self {
            Self::Missing => UnitError::new(ErrorKind::Transport, format!("file {:04X} not found", file_id)),
            Self::Failed(e) => e,
        }
    }
}


/// Reads one file, separating failures that end the whole read from those that only concern
/// this file.
fn read_unit<SC: SmartCard + ?Sized>(card: &mut SC, file_id: u16, presence: &Presence) -> Result<Result<Vec<u8>, Unit>, Error> {
    match read_file(card, file_id, presence) {
        Ok(raw) => Ok(Ok(raw)),
        Err(e) if e.is_not_found() => Ok(Err(Unit::Missing)),
        Err(e) => {
            let error = Error::from(e);
            if error.aborts_session() {
                Err(error)
            } else {
                Ok(Err(Unit::Failed(UnitError::from(&error))))
            }
        },
    }
}


/// Verifies a PIN (`00 20 00 80`).
///
/// A wrong PIN yields [`Error::Status`] with `63 Cx`, where `x` is the number of remaining tries.
#[instrument(skip_all)]
pub fn verify_pin<SC: SmartCard + ?Sized>(card: &mut SC, pin: &[u8]) -> Result<(), Error> {
    if pin.is_empty() || pin.len() > usize::from(u8::MAX) {
        return Err(Error::InvalidRequest(format!("PIN length {} out of range", pin.len())));
    }
    let request = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0x20, // VERIFY
            p1: 0x00,
            p2: 0x80, // specific reference data
        },
        data: Data::RequestDataShort {
            request_data: pin.to_vec(),
        },
    };
    let response = card.communicate(&request)?;
    if response.is_success() {
        Ok(())
    } else {
        Err(Error::Status { operation: "VERIFY", status: response.trailer.to_word() })
    }
}


/// Sends an Active Authentication challenge (`00 88 00 00`) and returns the chip's signature.
///
/// The signature is not verified against the DG15 public key.
#[instrument(skip_all)]
pub fn active_authentication<SC: SmartCard + ?Sized>(card: &mut SC, challenge: &[u8]) -> Result<Vec<u8>, Error> {
    if challenge.len() != ACTIVE_AUTHENTICATION_CHALLENGE_LENGTH {
        return Err(Error::InvalidRequest(format!(
            "challenge must be {} bytes long, not {}",
            ACTIVE_AUTHENTICATION_CHALLENGE_LENGTH, challenge.len(),
        )));
    }
    let request = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0x88, // INTERNAL AUTHENTICATE
            p1: 0x00,
            p2: 0x00,
        },
        data: Data::BothDataShort {
            request_data: challenge.to_vec(),
            response_data_length: 0,
        },
    };
    let response = card.communicate(&request)?;
    if response.is_success() {
        Ok(response.data)
    } else {
        Err(Error::Status { operation: "INTERNAL AUTHENTICATE", status: response.trailer.to_word() })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::iso7816::apdu::{Response, ResponseTrailer};
    use crate::iso7816::card::CommunicationError;

    struct Recorder {
        sent: Vec<Vec<u8>>,
        response: Response,
    }
    impl SmartCard for Recorder {
        fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
            self.sent.push(request.to_bytes()?);
            Ok(self.response.clone())
        }
    }

    #[test]
    fn test_auth_method_parsing() {
        assert_eq!("PACE".parse::<AuthMethod>().unwrap(), AuthMethod::Pace);
        assert_eq!("auto".parse::<AuthMethod>().unwrap(), AuthMethod::Auto);
        assert!("ca".parse::<AuthMethod>().is_err());
        assert_eq!(AuthMethod::default(), AuthMethod::Auto);
    }

    #[test]
    fn test_read_order_starts_with_listed_groups() {
        let order = read_order(&[2, 1, 14, 2, 0, 17]);
        assert_eq!(&order[..3], &[2, 1, 14]);
        assert_eq!(order.len(), 16);
        assert_eq!(&order[3..6], &[3, 4, 5]);

        assert_eq!(read_order(&[]), (1..=16).collect::<Vec<u8>>());
    }

    #[test]
    fn test_can_access_key() {
        assert_eq!(AccessKey::can("123456").unwrap(), AccessKey::Can("123456".to_owned()));
        assert!(AccessKey::can("12 34").is_err());
    }

    #[test]
    fn test_bac_with_can_refused() {
        let mut card = Recorder { sent: Vec::new(), response: Response::status(0x9000) };
        let err = authenticate(&mut card, &AccessKey::Can("123456".to_owned()), AuthMethod::Bac, &mut OsRng)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(card.sent.is_empty());
    }

    #[test]
    fn test_verify_pin() {
        let mut card = Recorder { sent: Vec::new(), response: Response::status(0x9000) };
        verify_pin(&mut card, b"1234").unwrap();
        assert_eq!(card.sent[0], b"\x00\x20\x00\x80\x041234");

        card.response = Response::status(0x63C2);
        match verify_pin(&mut card, b"1234") {
            Err(Error::Status { status, .. }) => assert_eq!(status, 0x63C2),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_active_authentication() {
        let mut card = Recorder {
            sent: Vec::new(),
            response: Response::new(vec![0xAB; 128], ResponseTrailer::SUCCESS),
        };
        let signature = active_authentication(&mut card, b"\x01\x02\x03\x04\x05\x06\x07\x08").unwrap();
        assert_eq!(signature.len(), 128);
        assert_eq!(card.sent[0], b"\x00\x88\x00\x00\x08\x01\x02\x03\x04\x05\x06\x07\x08\x00");
        assert!(active_authentication(&mut card, b"short").is_err());
    }
}

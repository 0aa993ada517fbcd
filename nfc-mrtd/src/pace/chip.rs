//! The chip's side of PACE, for emulated cards.


use p256::{NonZeroScalar, ProjectivePoint};
use rand::{CryptoRng, RngCore};
use tracing::debug;
use zeroize::Zeroizing;

use crate::der_util::{encode_tlv, parse_tlv, parse_tlv_sequence};
use crate::iso7816::apdu::{Apdu, Response, ResponseTrailer};
use crate::kdf::{pace_password_key, Kdf, KdfSha256};
use crate::pace::{Error, PACE_ECDH_GM_AES_CBC_CMAC_128, PasswordSource};
use crate::pace::mapping::{
    authentication_token, decode_point, encode_point, encrypt_nonce, map_generator, nonce_scalar,
    shared_secret, verify_token, NONCE_LENGTH,
};
use crate::secure_messaging::{SecureMessagingSession, SessionKeys};


const SW_WRONG_DATA: u16 = 0x6A80;
const SW_REFERENCE_NOT_FOUND: u16 = 0x6A88;
const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
const SW_AUTHENTICATION_FAILED: u16 = 0x6300;


enum Step {
    Idle,
    AwaitingNonceRequest { k_pi: Zeroizing<[u8; 16]> },
    AwaitingMappingKey { nonce: Zeroizing<[u8; NONCE_LENGTH]> },
    AwaitingEphemeralKey { generator: ProjectivePoint },
    AwaitingToken {
        k_enc: Zeroizing<[u8; 16]>,
        k_mac: Zeroizing<[u8; 16]>,
        terminal_public_key: Zeroizing<Vec<u8>>,
        chip_public_key: Zeroizing<Vec<u8>>,
    },
}


/// Answers MSE:SET AT and GENERAL AUTHENTICATE commands like an eMRTD chip would.
pub struct PaceChip {
    mrz_password: Option<Zeroizing<Vec<u8>>>,
    can: Option<Zeroizing<Vec<u8>>>,
    step: Step,
}
impl PaceChip {
    /// Creates a chip accepting the given passwords. A password that is `None` cannot be used.
    pub fn new(mrz_password: Option<&[u8]>, can: Option<&[u8]>) -> Self {
        Self {
            mrz_password: mrz_password.map(|p| Zeroizing::new(p.to_vec())),
            can: can.map(|c| Zeroizing::new(c.to_vec())),
            step: Step::Idle,
        }
    }

    /// Whether the command is part of PACE.
    pub fn handles(request: &Apdu) -> bool {
        let cla = request.header.cla & 0b1110_1111;
        cla == 0x00 && (request.header.ins == 0x22 || request.header.ins == 0x86)
    }

    /// Processes one command.
    ///
    /// Returns the response and, once the terminal has authenticated itself, the chip's
    /// secure messaging session. Any failure resets the chip to its initial state.
    pub fn process<R: RngCore + CryptoRng>(&mut self, request: &Apdu, rng: &mut R) -> (Response, Option<SecureMessagingSession>) {
        let step = std::mem::replace(&mut self.step, Step::Idle);
        let data = request.data.request_data().unwrap_or(&[]);
        let outcome = match (request.header.ins, step) {
            (0x22, _) => self.set_authentication_template(data),
            (0x86, Step::AwaitingNonceRequest { k_pi }) => Self::send_nonce(data, &k_pi, rng),
            (0x86, Step::AwaitingMappingKey { nonce }) => Self::map(data, &nonce, rng),
            (0x86, Step::AwaitingEphemeralKey { generator }) => Self::agree(data, &generator, rng),
            (0x86, Step::AwaitingToken { k_enc, k_mac, terminal_public_key, chip_public_key }) =>
                Self::authenticate(data, &k_enc, &k_mac, &terminal_public_key, &chip_public_key),
            _ => Err(SW_CONDITIONS_NOT_SATISFIED),
        };
        match outcome {
            Ok((response_data, next_step, session)) => {
                self.step = next_step;
                (Response::new(response_data, ResponseTrailer::SUCCESS), session)
            },
            Err(status) => {
                debug!("emulated PACE step failed with 0x{:04X}", status);
                self.step = Step::Idle;
                (Response::status(status), None)
            },
        }
    }

    fn set_authentication_template(&self, data: &[u8]) -> StepResult {
        let objects = parse_tlv_sequence(data)
            .ok_or(SW_WRONG_DATA)?;
        let mechanism = objects.iter()
            .find(|tlv| tlv.tag == [0x80])
            .ok_or(SW_WRONG_DATA)?;
        if mechanism.value != PACE_ECDH_GM_AES_CBC_CMAC_128 {
            return Err(SW_REFERENCE_NOT_FOUND);
        }
        let reference = objects.iter()
            .find(|tlv| tlv.tag == [0x83] && tlv.value.len() == 1)
            .and_then(|tlv| PasswordSource::from_reference(tlv.value[0]))
            .ok_or(SW_WRONG_DATA)?;
        let password = match reference {
            PasswordSource::Mrz => self.mrz_password.as_ref(),
            PasswordSource::Can => self.can.as_ref(),
        }.ok_or(SW_REFERENCE_NOT_FOUND)?;
        let k_pi = pace_password_key(password);
        Ok((Vec::new(), Step::AwaitingNonceRequest { k_pi }, None))
    }

    fn send_nonce<R: RngCore + CryptoRng>(data: &[u8], k_pi: &[u8; 16], rng: &mut R) -> StepResult {
        if data != [0x7C, 0x00] {
            return Err(SW_WRONG_DATA);
        }
        let mut nonce = Zeroizing::new([0u8; NONCE_LENGTH]);
        rng.fill_bytes(nonce.as_mut_slice());
        let encrypted = encrypt_nonce(k_pi, &nonce).map_err(internal)?;
        Ok((wrap(0x80, &encrypted), Step::AwaitingMappingKey { nonce }, None))
    }

    fn map<R: RngCore + CryptoRng>(data: &[u8], nonce: &[u8; NONCE_LENGTH], rng: &mut R) -> StepResult {
        let terminal_key = decode_point(&unwrap(data, 0x81)?).map_err(internal)?;
        let private_key = NonZeroScalar::random(&mut *rng);
        let public_key = encode_point(&(ProjectivePoint::GENERATOR * *private_key)).map_err(internal)?;
        let nonce = nonce_scalar(nonce).map_err(internal)?;
        let generator = map_generator(&nonce, &private_key, &terminal_key).map_err(internal)?;
        Ok((wrap(0x82, &public_key), Step::AwaitingEphemeralKey { generator }, None))
    }

    fn agree<R: RngCore + CryptoRng>(data: &[u8], generator: &ProjectivePoint, rng: &mut R) -> StepResult {
        let terminal_public_key = unwrap(data, 0x83)?;
        let terminal_point = decode_point(&terminal_public_key).map_err(internal)?;
        let private_key = NonZeroScalar::random(&mut *rng);
        let chip_point = *generator * *private_key;
        if chip_point == terminal_point {
            return Err(SW_WRONG_DATA);
        }
        let chip_public_key = Zeroizing::new(encode_point(&chip_point).map_err(internal)?);
        let secret = shared_secret(&private_key, &terminal_point).map_err(internal)?;
        let k_enc = KdfSha256::derive_encryption_key(&secret);
        let k_mac = KdfSha256::derive_mac_key(&secret);
        let response = wrap(0x84, &chip_public_key);
        Ok((response, Step::AwaitingToken { k_enc, k_mac, terminal_public_key, chip_public_key }, None))
    }

    fn authenticate(
        data: &[u8],
        k_enc: &[u8; 16],
        k_mac: &[u8; 16],
        terminal_public_key: &[u8],
        chip_public_key: &[u8],
    ) -> StepResult {
        let terminal_token = unwrap(data, 0x85)?;
        if !verify_token(k_mac, chip_public_key, &terminal_token).map_err(internal)? {
            return Err(SW_AUTHENTICATION_FAILED);
        }
        let chip_token = authentication_token(k_mac, terminal_public_key).map_err(internal)?;
        let session = SecureMessagingSession::new(SessionKeys::from_two_key(k_enc, k_mac), [0u8; 8]);
        Ok((wrap(0x86, &chip_token), Step::Idle, Some(session)))
    }
}


type StepResult = Result<(Vec<u8>, Step, Option<SecureMessagingSession>), u16>;


fn internal(e: Error) -> u16 {
    debug!("emulated PACE rejected input: {}", e);
    SW_WRONG_DATA
}


fn wrap(tag: u8, value: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(value.len() + 3);
    encode_tlv(&mut inner, &[tag], value);
    let mut outer = Vec::with_capacity(inner.len() + 3);
    encode_tlv(&mut outer, &[0x7C], &inner);
    outer
}


fn unwrap(data: &[u8], tag: u8) -> Result<Zeroizing<Vec<u8>>, u16> {
    let (outer, _) = parse_tlv(data).ok_or(SW_WRONG_DATA)?;
    if outer.tag != [0x7C] {
        return Err(SW_WRONG_DATA);
    }
    let (inner, _) = parse_tlv(outer.value).ok_or(SW_WRONG_DATA)?;
    if inner.tag != [tag] {
        return Err(SW_WRONG_DATA);
    }
    Ok(Zeroizing::new(inner.value.to_vec()))
}

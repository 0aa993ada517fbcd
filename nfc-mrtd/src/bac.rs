//! Basic Access Control.


use std::fmt;

use rand::{CryptoRng, RngCore};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use crate::crypt::{CryptError, DES_BLOCK_SIZE, padded_iso9797_m2};
use crate::crypt::tdes::{decrypt_cbc, encrypt_cbc, retail_mac, verify_retail_mac};
use crate::error::ErrorKind;
use crate::iso7816::apdu::{Apdu, CommandHeader, Data, Response};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::kdf::{bac_key_seed, Kdf, Kdf3Des};
use crate::mrz::MrzInfo;
use crate::secure_messaging::{SecureMessagingSession, SessionKeys};


/// Length of the encrypted authentication data plus its MAC.
const AUTHENTICATION_DATA_LENGTH: usize = 32 + 8;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    GetChallenge,
    MutualAuthenticate,
}
impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetChallenge => write!(f, "GET CHALLENGE"),
            Self::MutualAuthenticate => write!(f, "MUTUAL AUTHENTICATE"),
        }
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum BacState {
    Idle,
    ChallengeRequested,
    MutualAuthSent,
    Authenticated,
    Failed,
}


#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to communicate: {0}")]
    Communication(#[from] CommunicationError),

    #[error("{operation} failed with response code 0x{:04X}", .response.trailer.to_word())]
    OperationFailed { operation: Operation, response: Response },

    #[error("{operation} response has length {obtained}, expected {expected_length}")]
    LengthMismatch { operation: Operation, obtained: usize, expected_length: usize },

    #[error("response MAC incorrect")]
    ResponseMac,

    #[error("card did not echo its own challenge")]
    ChallengeMismatch,

    #[error("cryptographic operation failed: {0}")]
    Crypt(#[from] CryptError),

    #[error("authentication cannot start in state {state:?}")]
    InvalidState { state: BacState },
}
impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Communication(e) => e.kind(),
            _ => ErrorKind::Authentication,
        }
    }
}


#[instrument(skip(card))]
fn get_challenge<SC: SmartCard + ?Sized>(card: &mut SC) -> Result<[u8; 8], Error> {
    let get_challenge_apdu = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0x84, // GET CHALLENGE
            p1: 0x00,
            p2: 0x00,
        },
        data: Data::ResponseDataShort {
            response_data_length: 8,
        },
    };
    let response = card.communicate(&get_challenge_apdu)?;
    if !response.is_success() {
        return Err(Error::OperationFailed { operation: Operation::GetChallenge, response });
    }
    if response.data.len() != 8 {
        return Err(Error::LengthMismatch {
            operation: Operation::GetChallenge,
            obtained: response.data.len(),
            expected_length: 8,
        });
    }
    let mut ret = [0u8; 8];
    ret.copy_from_slice(response.data.as_slice());
    Ok(ret)
}


/// The Basic Access Control protocol for one card.
///
/// Runs at most once; a failed run leaves the protocol in [`BacState::Failed`].
pub struct BacProtocol {
    k_enc: Zeroizing<[u8; 24]>,
    k_mac: Zeroizing<[u8; 24]>,
    state: BacState,
}
impl BacProtocol {
    /// Prepares BAC with the keys derived from the MRZ information.
    pub fn new(mrz_info: &MrzInfo) -> Self {
        let k_seed = bac_key_seed(mrz_info);
        Self::from_seed(k_seed.as_slice())
    }

    /// Prepares BAC with the keys derived from an already computed key seed.
    pub fn from_seed(k_seed: &[u8]) -> Self {
        Self {
            k_enc: Kdf3Des::derive_encryption_key(k_seed),
            k_mac: Kdf3Des::derive_mac_key(k_seed),
            state: BacState::Idle,
        }
    }

    pub fn state(&self) -> BacState {
        self.state
    }

    /// Performs BAC, drawing RND.IFD and K.IFD from the given random number generator.
    #[instrument(skip_all)]
    pub fn authenticate<SC: SmartCard + ?Sized, R: RngCore + CryptoRng>(
        &mut self,
        card: &mut SC,
        rng: &mut R,
    ) -> Result<SecureMessagingSession, Error> {
        let mut rnd_ifd = [0u8; 8];
        let mut k_ifd = Zeroizing::new([0u8; 16]);
        rng.fill_bytes(&mut rnd_ifd);
        rng.fill_bytes(k_ifd.as_mut_slice());
        self.authenticate_with_values(card, &rnd_ifd, &k_ifd)
    }

    /// Performs BAC with fixed terminal values.
    #[instrument(skip_all)]
    pub fn authenticate_with_values<SC: SmartCard + ?Sized>(
        &mut self,
        card: &mut SC,
        rnd_ifd: &[u8; 8],
        k_ifd: &[u8; 16],
    ) -> Result<SecureMessagingSession, Error> {
        if self.state != BacState::Idle {
            return Err(Error::InvalidState { state: self.state });
        }
        match self.run(card, rnd_ifd, k_ifd) {
            Ok(session) => {
                self.state = BacState::Authenticated;
                debug!("BAC established");
                Ok(session)
            },
            Err(e) => {
                self.state = BacState::Failed;
                debug!("BAC failed: {}", e);
                Err(e)
            },
        }
    }

    fn run<SC: SmartCard + ?Sized>(
        &mut self,
        card: &mut SC,
        rnd_ifd: &[u8; 8],
        k_ifd: &[u8; 16],
    ) -> Result<SecureMessagingSession, Error> {
        // obtain the challenge
        let rnd_icc = get_challenge(card)?;
        self.state = BacState::ChallengeRequested;

        // concatenate the three values
        let mut ext_auth_data = Zeroizing::new([0u8; 32]);
        ext_auth_data[0..8].copy_from_slice(rnd_ifd);
        ext_auth_data[8..16].copy_from_slice(&rnd_icc);
        ext_auth_data[16..32].copy_from_slice(k_ifd);

        // encrypt with an all-zeroes IV and no padding
        let mut request_data = ext_auth_data.to_vec();
        encrypt_cbc(&self.k_enc, &mut request_data)?;

        // pad according to ISO 7816, then generate MAC
        let mac = retail_mac(&self.k_mac, &padded_iso9797_m2(&request_data, DES_BLOCK_SIZE))?;
        request_data.extend_from_slice(&mac);

        let mutual_auth_request = Apdu {
            header: CommandHeader {
                cla: 0x00,
                ins: 0x82, // EXTERNAL AUTHENTICATE (mutual)
                p1: 0x00,
                p2: 0x00,
            },
            data: Data::BothDataShort {
                request_data,
                response_data_length: AUTHENTICATION_DATA_LENGTH as u8,
            },
        };
        self.state = BacState::MutualAuthSent;
        let response = card.communicate(&mutual_auth_request)?;
        if !response.is_success() {
            return Err(Error::OperationFailed {
                operation: Operation::MutualAuthenticate,
                response,
            });
        }
        if response.data.len() < AUTHENTICATION_DATA_LENGTH {
            return Err(Error::LengthMismatch {
                operation: Operation::MutualAuthenticate,
                obtained: response.data.len(),
                expected_length: AUTHENTICATION_DATA_LENGTH,
            });
        }

        // verify MAC of what we obtained
        let encrypted = &response.data[0..32];
        let received_mac = &response.data[32..40];
        if !verify_retail_mac(&self.k_mac, &padded_iso9797_m2(encrypted, DES_BLOCK_SIZE), received_mac)? {
            return Err(Error::ResponseMac);
        }

        // decrypt
        let mut decrypted = Zeroizing::new(encrypted.to_vec());
        decrypt_cbc(&self.k_enc, &mut decrypted)?;
        let rnd_icc_echo = &decrypted[0..8];
        let rnd_ifd_echo = &decrypted[8..16];
        let k_icc = &decrypted[16..32];

        if rnd_icc_echo != &rnd_icc[..] {
            return Err(Error::ChallengeMismatch);
        }
        if rnd_ifd_echo != &rnd_ifd[..] {
            warn!("card did not echo RND.IFD correctly; continuing");
        }

        let mut k_session_seed = Zeroizing::new([0u8; 16]);
        for ((kss, kifd), kicc) in k_session_seed.iter_mut().zip(k_ifd.iter()).zip(k_icc.iter()) {
            *kss = *kifd ^ *kicc;
        }
        let keys = SessionKeys::from_seed(k_session_seed.as_slice());

        let mut send_sequence_counter = [0u8; 8];
        send_sequence_counter[0..4].copy_from_slice(&rnd_icc[4..8]);
        send_sequence_counter[4..8].copy_from_slice(&rnd_ifd[4..8]);

        Ok(SecureMessagingSession::new(keys, send_sequence_counter))
    }
}

use hex_literal::hex;
use nfc_mrtd::bac::{BacProtocol, BacState};
use nfc_mrtd::iso7816::apdu::{Apdu, Response, ResponseTrailer};
use nfc_mrtd::iso7816::card::{CommunicationError, SmartCard};
use nfc_mrtd::iso7816::file::{read_binary, select_file};
use nfc_mrtd::secure_messaging::SecureChannel;


/// A fake smart card that acts exactly like the card in ICAO Doc 9303 Part 11 Appendix D.
///
/// If any of its expectations are not met, it responds with 0x69 0x88.
struct AppendixDCard {
    state: u8,
}
impl AppendixDCard {
    const RND_IC: [u8; 8] = hex!("4608F91988702212");
    const EXPECTED_EXTERNAL_AUTHENTICATE_PAYLOAD: [u8; 40] = hex!("72C29C2371CC9BDB65B779B8E8D37B29ECC154AA56A8799FAE2F498F76ED92F25F1448EEA8AD90A7");
    const EXTERNAL_AUTHENTICATE_RESPONSE: [u8; 40] = hex!("46B9342A41396CD7386BF5803104D7CEDC122B9132139BAF2EEDC94EE178534F2F2D235D074D7449");
    const EXPECTED_SELECT_PAYLOAD: [u8; 21] = hex!("8709016375432908C044F68E08BF8B92D635FF24F8");
    const SELECT_RESPONSE: [u8; 14] = hex!("990290008E08FA855A5D4C50A8ED");
    const EXPECTED_READ_4_PAYLOAD: [u8; 13] = hex!("9701048E08ED6705417E96BA55");
    const READ_4_RESPONSE: [u8; 25] = hex!("8709019FF0EC34F9922651990290008E08AD55CC17140B2DED");
    const EXPECTED_READ_REST_PAYLOAD: [u8; 13] = hex!("9701128E082EA28A70F3C7B535");
    const READ_REST_RESPONSE: [u8; 41] = hex!("871901FB9235F4E4037F2327DCC8964F1F9B8C30F42C8E2FFF224A990290008E08C8B2787EAEA07D74");

    pub const fn new() -> Self {
        Self {
            state: 0,
        }
    }

    fn ok(data: &[u8]) -> Response {
        Response::new(data.to_vec(), ResponseTrailer::new(0x90, 0x00))
    }
}
impl SmartCard for AppendixDCard {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        let header = request.header.to_be_u32();
        let payload = request.data.request_data();
        let le = request.data.response_data_length();

        if header == 0x00_84_00_00 && payload.is_none() && le == Some(8) {
            self.state = 1;
            Ok(Self::ok(&Self::RND_IC))
        } else if self.state >= 1
                && header == 0x00_82_00_00
                && payload == Some(&Self::EXPECTED_EXTERNAL_AUTHENTICATE_PAYLOAD[..])
                && le == Some(0x28) {
            self.state = 2;
            Ok(Self::ok(&Self::EXTERNAL_AUTHENTICATE_RESPONSE))
        } else if self.state >= 2
                && header == 0x0C_A4_02_0C
                && payload == Some(&Self::EXPECTED_SELECT_PAYLOAD[..])
                && le == Some(0x100) {
            self.state = 3;
            Ok(Self::ok(&Self::SELECT_RESPONSE))
        } else if self.state >= 3
                && header == 0x0C_B0_00_00
                && payload == Some(&Self::EXPECTED_READ_4_PAYLOAD[..])
                && le == Some(0x100) {
            Ok(Self::ok(&Self::READ_4_RESPONSE))
        } else if self.state >= 3
                && header == 0x0C_B0_00_04
                && payload == Some(&Self::EXPECTED_READ_REST_PAYLOAD[..])
                && le == Some(0x100) {
            Ok(Self::ok(&Self::READ_REST_RESPONSE))
        } else {
            Ok(Response::status(0x6988))
        }
    }
}


const K_SEED: [u8; 16] = hex!("239AB9CB282DAF66231DC5A4DF6BFBAE");
const RND_IFD: [u8; 8] = hex!("781723860C06C226");
const K_IFD: [u8; 16] = hex!("0B795240CB7049B01C19B33E32804F0B");


#[test]
fn test_bac_setup_appd() {
    const DECRYPTED_READ_4: [u8; 4] = hex!("60145F01");
    const DECRYPTED_READ_REST: [u8; 18] = hex!("04303130365F36063034303030305C026175");

    let mut card = AppendixDCard::new();
    let mut bac = BacProtocol::from_seed(&K_SEED);
    let session = bac.authenticate_with_values(&mut card, &RND_IFD, &K_IFD)
        .expect("failed to establish BAC");
    assert_eq!(bac.state(), BacState::Authenticated);
    assert_eq!(session.send_sequence_counter(), hex!("887022120C06C226"));

    let mut channel = SecureChannel::new(&mut card, session);

    // select EF.COM
    select_file(&mut channel, 0x011E).expect("failed to select EF.COM");

    // read initial 4 bytes of EF.COM
    let read_four = read_binary(&mut channel, 0, 4).expect("failed to read 4 bytes of EF.COM");
    assert_eq!(read_four.trailer.to_word(), 0x9000);
    assert_eq!(read_four.data.as_slice(), &DECRYPTED_READ_4);

    // read rest of EF.COM
    let read_rest = read_binary(&mut channel, 4, 0x12).expect("failed to read rest of EF.COM");
    assert_eq!(read_rest.trailer.to_word(), 0x9000);
    assert_eq!(read_rest.data.as_slice(), &DECRYPTED_READ_REST);

    assert_eq!(channel.session().send_sequence_counter(), hex!("887022120C06C22C"));
}


#[test]
fn test_bac_wrong_seed_fails() {
    let mut card = AppendixDCard::new();
    let mut bac = BacProtocol::from_seed(&[0u8; 16]);
    let error = bac.authenticate_with_values(&mut card, &RND_IFD, &K_IFD).unwrap_err();
    assert_eq!(error.kind(), nfc_mrtd::ErrorKind::Authentication);
    assert_eq!(bac.state(), BacState::Failed);

    // a failed run is not repeated
    assert!(bac.authenticate_with_values(&mut card, &RND_IFD, &K_IFD).is_err());
}

//! Secure-messaging channel over a card transport.
//!
//! [`SecureChannel`] wraps a [`CardTransport`] and implements
//! [`CardTransport`] itself: while no session keys exist every command
//! passes straight through, and once established every command is
//! encrypted and MAC-protected per ISO 7816-4 secure messaging (3DES-CBC
//! payload in DO87, expected length in DO97, retail MAC in DO8E, status
//! word in DO99 on the way back).
//!
//! Establishment is delegated to an [`Authenticator`]; the
//! certificate-chain and shared-secret variants live in the submodules
//! and land in the same authenticated state.

use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::apdu::{Command, Response, StatusWord};
use crate::crypto::CryptoHelper;
use crate::tlv::{Tlv, TlvIter};
use crate::transport::CardTransport;
use crate::{Error, Result};

mod cwa14890;
mod pace;

pub use cwa14890::{CertChainAuth, ChannelConstants};
pub use pace::SharedSecretAuth;

/// Secure-messaging class bits added to every wrapped command.
const CLA_SECURE: u8 = 0x0C;
/// Transmitted MAC length in bytes.
const MAC_LEN: usize = 4;

const TAG_DO87: u32 = 0x87;
const TAG_DO97: u32 = 0x97;
const TAG_DO8E: u32 = 0x8E;
const TAG_DO99: u32 = 0x99;

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Closed,
    /// Session keys exist but mutual authentication has not finished.
    KeyEstablished,
    Authenticated,
}

/// Session keys and the send sequence counter.
///
/// Key material is wiped when the value is dropped or the channel is
/// torn down.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    enc: [u8; 16],
    mac: [u8; 16],
    ssc: [u8; 8],
}

impl SessionKeys {
    pub fn new(enc: [u8; 16], mac: [u8; 16], ssc: [u8; 8]) -> Self {
        Self { enc, mac, ssc }
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("ssc", &self.ssc)
            .finish_non_exhaustive()
    }
}

/// Runs one establishment handshake against the plain transport and, on
/// success, hands the derived keys to the channel.
///
/// Implementations must not retry internally: every non-success status
/// aborts the handshake and partial state is discarded.
pub trait Authenticator {
    fn establish(
        &mut self,
        transport: &mut dyn CardTransport,
        helper: &dyn CryptoHelper,
    ) -> Result<SessionKeys>;
}

/// Secure channel wrapping a transport.
pub struct SecureChannel<T: CardTransport> {
    transport: T,
    helper: Rc<dyn CryptoHelper>,
    keys: Option<SessionKeys>,
    phase: Phase,
}

impl<T: CardTransport> fmt::Debug for SecureChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannel")
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl<T: CardTransport> SecureChannel<T> {
    pub fn new(transport: T, helper: Rc<dyn CryptoHelper>) -> Self {
        Self {
            transport,
            helper,
            keys: None,
            phase: Phase::Closed,
        }
    }

    /// Install externally derived session keys. The channel starts
    /// protecting traffic immediately but stays [`Phase::KeyEstablished`]
    /// until mutual authentication is attested.
    pub fn install_keys(&mut self, keys: SessionKeys) {
        self.keys = Some(keys);
        self.phase = Phase::KeyEstablished;
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_established(&self) -> bool {
        self.phase != Phase::Closed
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Run the handshake on the plain transport. Opening an open channel
    /// is a no-op.
    pub fn establish(&mut self, authenticator: &mut dyn Authenticator) -> Result<()> {
        if self.phase != Phase::Closed {
            debug!(phase = ?self.phase, "secure channel already open");
            return Ok(());
        }
        let keys = authenticator.establish(&mut self.transport, self.helper.as_ref())?;
        self.install_keys(keys);
        // Both authenticator variants finish mutually authenticated.
        self.phase = Phase::Authenticated;
        debug!("secure channel established");
        Ok(())
    }

    /// Discard the session keys, keeping the underlying transport open.
    /// Closing a closed channel is a no-op.
    pub fn close_channel(&mut self) {
        if self.phase != Phase::Closed {
            debug!("closing secure channel");
        }
        self.tear_down();
    }

    fn tear_down(&mut self) {
        self.keys = None;
        self.phase = Phase::Closed;
    }

    pub(crate) fn wrap_command(&mut self, command: &Command) -> Result<Command> {
        let keys = self
            .keys
            .as_mut()
            .ok_or_else(|| Error::secure_channel("wrap without session keys"))?;
        bump_ssc(&mut keys.ssc);
        let (enc_key, mac_key, ssc) = (keys.enc, keys.mac, keys.ssc);

        let cla = command.cla() | CLA_SECURE;
        let mut objects = Vec::new();
        if let Some(data) = command.data() {
            let encrypted = self.helper.tdes_cbc_encrypt(&enc_key, &pad80(data))?;
            // Padding-indicator octet precedes the ciphertext.
            let mut content = Vec::with_capacity(1 + encrypted.len());
            content.push(0x01);
            content.extend_from_slice(&encrypted);
            objects.extend_from_slice(&Tlv::new(TAG_DO87, content).to_bytes());
        }
        if let Some(le) = command.le() {
            let le = if le >= 256 { 0 } else { le as u8 };
            objects.extend_from_slice(&Tlv::new(TAG_DO97, vec![le]).to_bytes());
        }

        // MAC over SSC, the padded header block and the data objects.
        let mut mac_input = ssc.to_vec();
        mac_input.extend_from_slice(&pad80(&[cla, command.ins(), command.p1(), command.p2()]));
        mac_input.extend_from_slice(&objects);
        let mac = self.helper.retail_mac(&mac_key, &pad80(&mac_input))?;
        objects.extend_from_slice(&Tlv::new(TAG_DO8E, mac[..MAC_LEN].to_vec()).to_bytes());

        trace!(ins = command.ins(), wrapped_len = objects.len(), "wrapped command");
        Ok(Command::new(cla, command.ins(), command.p1(), command.p2())
            .with_data(objects)
            .with_le(0))
    }

    pub(crate) fn unwrap_response(&mut self, response: Response) -> Result<Response> {
        if response.data().is_empty() {
            // A bare status word inside the channel means the card lost
            // the session state.
            self.tear_down();
            if response.sw() == StatusWord::LOST_CHANNEL {
                return Err(Error::LostChannel);
            }
            return Err(Error::secure_channel(format!(
                "unprotected response {} inside the channel",
                response.sw()
            )));
        }
        let keys = self
            .keys
            .as_mut()
            .ok_or_else(|| Error::secure_channel("unwrap without session keys"))?;
        bump_ssc(&mut keys.ssc);
        let (enc_key, mac_key, ssc) = (keys.enc, keys.mac, keys.ssc);

        let mut do87 = None;
        let mut do99 = None;
        let mut do8e = None;
        for tlv in TlvIter::new(response.data()) {
            let tlv = match tlv {
                Ok(tlv) => tlv,
                Err(e) => {
                    self.tear_down();
                    return Err(e);
                }
            };
            match tlv.tag() {
                TAG_DO87 => do87 = Some(tlv),
                TAG_DO99 => do99 = Some(tlv),
                TAG_DO8E => do8e = Some(tlv),
                tag => trace!(tag, "ignoring unknown secure-messaging object"),
            }
        }
        let (Some(do99), Some(do8e)) = (do99, do8e) else {
            self.tear_down();
            return Err(Error::secure_channel("missing status or MAC object"));
        };

        let mut mac_input = ssc.to_vec();
        if let Some(tlv) = &do87 {
            mac_input.extend_from_slice(&tlv.to_bytes());
        }
        mac_input.extend_from_slice(&do99.to_bytes());
        let expected = self.helper.retail_mac(&mac_key, &pad80(&mac_input))?;
        if do8e.value() != &expected[..MAC_LEN] {
            warn!("response MAC mismatch");
            self.tear_down();
            return Err(Error::secure_channel("response MAC mismatch"));
        }

        let sw = match do99.value() {
            &[sw1, sw2] => StatusWord::new(sw1, sw2),
            _ => {
                self.tear_down();
                return Err(Error::secure_channel("malformed status object"));
            }
        };
        let plain = match do87 {
            Some(tlv) => match tlv.value() {
                [0x01, ciphertext @ ..] => {
                    let decrypted = match self.helper.tdes_cbc_decrypt(&enc_key, ciphertext) {
                        Ok(decrypted) => decrypted,
                        Err(e) => {
                            self.tear_down();
                            return Err(e);
                        }
                    };
                    match unpad80(&decrypted) {
                        Ok(plain) => plain.to_vec(),
                        Err(e) => {
                            self.tear_down();
                            return Err(e);
                        }
                    }
                }
                _ => {
                    self.tear_down();
                    return Err(Error::secure_channel("unsupported padding indicator"));
                }
            },
            None => Vec::new(),
        };
        Ok(Response::new(plain, sw))
    }
}

impl<T: CardTransport> CardTransport for SecureChannel<T> {
    fn open(&mut self) -> Result<()> {
        self.transport.open()
    }

    fn close(&mut self) -> Result<()> {
        self.close_channel();
        self.transport.close()
    }

    fn reset(&mut self) -> Result<()> {
        self.close_channel();
        self.transport.reset()
    }

    fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    fn transmit(&mut self, command: &Command) -> Result<Response> {
        if self.keys.is_some() {
            let wrapped = self.wrap_command(command)?;
            let response = self.transport.transmit(&wrapped)?;
            self.unwrap_response(response)
        } else {
            self.transport.transmit(command)
        }
    }
}

/// ISO 7816-4 padding: one `0x80` then zeros to the block boundary.
pub(crate) fn pad80(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    out.push(0x80);
    while out.len() % 8 != 0 {
        out.push(0x00);
    }
    out
}

pub(crate) fn unpad80(data: &[u8]) -> Result<&[u8]> {
    for (i, byte) in data.iter().enumerate().rev() {
        match byte {
            0x00 => continue,
            0x80 => return Ok(&data[..i]),
            _ => break,
        }
    }
    Err(Error::secure_channel("malformed padding"))
}

/// Big-endian increment; the counter wraps rather than overflows.
fn bump_ssc(ssc: &mut [u8; 8]) {
    for byte in ssc.iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SoftCryptoHelper;

    #[derive(Debug, Default)]
    struct NullTransport;

    impl CardTransport for NullTransport {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
        fn reset(&mut self) -> Result<()> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            true
        }
        fn transmit(&mut self, _command: &Command) -> Result<Response> {
            unimplemented!()
        }
    }

    fn channel() -> SecureChannel<NullTransport> {
        let mut channel = SecureChannel::new(NullTransport, Rc::new(SoftCryptoHelper));
        channel.install_keys(SessionKeys::new([0x11; 16], [0x22; 16], [0u8; 8]));
        channel
    }

    #[test]
    fn padding_round_trip() {
        for len in 0..17 {
            let data = vec![0xAB; len];
            let padded = pad80(&data);
            assert_eq!(padded.len() % 8, 0);
            assert_eq!(unpad80(&padded).unwrap(), &data[..]);
        }
        assert!(unpad80(&[0x00; 8]).is_err());
    }

    #[test]
    fn ssc_increments_big_endian() {
        let mut ssc = [0, 0, 0, 0, 0, 0, 0, 0xFF];
        bump_ssc(&mut ssc);
        assert_eq!(ssc, [0, 0, 0, 0, 0, 0, 1, 0]);
    }

    #[test]
    fn wrapped_command_shape() {
        let mut channel = channel();
        let command = Command::new(0x00, 0xB0, 0x00, 0x00)
            .with_data(vec![0x01, 0x02, 0x03])
            .with_le(0x20);
        let wrapped = channel.wrap_command(&command).unwrap();

        assert_eq!(wrapped.cla(), 0x0C);
        assert_eq!(wrapped.ins(), 0xB0);
        assert_eq!(wrapped.le(), Some(0));
        let objects: Vec<Tlv> = TlvIter::new(wrapped.data().unwrap())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(objects.len(), 3);
        assert_eq!(objects[0].tag(), TAG_DO87);
        assert_eq!(objects[0].value()[0], 0x01);
        // Three data bytes pad to one 3DES block.
        assert_eq!(objects[0].value().len(), 9);
        assert_eq!(objects[1].tag(), TAG_DO97);
        assert_eq!(objects[1].value(), &[0x20]);
        assert_eq!(objects[2].tag(), TAG_DO8E);
        assert_eq!(objects[2].value().len(), MAC_LEN);
    }

    /// Build a card-side response for the channel's next expected SSC.
    fn secured_response(plain: &[u8], ssc: [u8; 8]) -> Response {
        let helper = SoftCryptoHelper;
        let mut objects = Vec::new();
        if !plain.is_empty() {
            let encrypted = helper.tdes_cbc_encrypt(&[0x11; 16], &pad80(plain)).unwrap();
            let mut content = vec![0x01];
            content.extend_from_slice(&encrypted);
            objects.extend_from_slice(&Tlv::new(TAG_DO87, content).to_bytes());
        }
        objects.extend_from_slice(&Tlv::new(TAG_DO99, vec![0x90, 0x00]).to_bytes());
        let mut mac_input = ssc.to_vec();
        mac_input.extend_from_slice(&objects);
        let mac = helper.retail_mac(&[0x22; 16], &pad80(&mac_input)).unwrap();
        objects.extend_from_slice(&Tlv::new(TAG_DO8E, mac[..MAC_LEN].to_vec()).to_bytes());
        Response::new(objects, StatusWord::OK)
    }

    #[test]
    fn unwrap_recovers_plaintext_and_status() {
        let mut channel = channel();
        let response = secured_response(b"hello", [0, 0, 0, 0, 0, 0, 0, 1]);
        let unwrapped = channel.unwrap_response(response).unwrap();
        assert_eq!(unwrapped.data(), b"hello");
        assert!(unwrapped.is_ok());
    }

    #[test]
    fn tampered_mac_tears_the_channel_down() {
        let mut channel = channel();
        let good = secured_response(b"hello", [0, 0, 0, 0, 0, 0, 0, 1]);
        let mut raw = good.data().to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let err = channel
            .unwrap_response(Response::new(raw, StatusWord::OK))
            .unwrap_err();
        assert!(matches!(err, Error::SecureChannel(_)));
        assert_eq!(channel.phase(), Phase::Closed);
    }

    #[test]
    fn stale_ssc_fails_verification() {
        let mut channel = channel();
        // Response generated for SSC 3 while the channel expects 1.
        let response = secured_response(b"hello", [0, 0, 0, 0, 0, 0, 0, 3]);
        assert!(channel.unwrap_response(response).is_err());
        assert_eq!(channel.phase(), Phase::Closed);
    }

    #[test]
    fn bare_status_word_is_a_lost_channel() {
        let mut channel = channel();
        let response = Response::new(Vec::new(), StatusWord::LOST_CHANNEL);
        assert!(matches!(
            channel.unwrap_response(response),
            Err(Error::LostChannel)
        ));
    }

    #[test]
    fn bad_inner_padding_tears_the_channel_down() {
        let mut channel = channel();
        // DO87 whose plaintext lacks the 0x80 terminator; the MAC is
        // honest, so only unpadding can reject it.
        let helper = SoftCryptoHelper;
        let encrypted = helper.tdes_cbc_encrypt(&[0x11; 16], &[0u8; 8]).unwrap();
        let mut content = vec![0x01];
        content.extend_from_slice(&encrypted);
        let mut objects = Tlv::new(TAG_DO87, content).to_bytes().to_vec();
        objects.extend_from_slice(&Tlv::new(TAG_DO99, vec![0x90, 0x00]).to_bytes());
        let mut mac_input = vec![0, 0, 0, 0, 0, 0, 0, 1];
        mac_input.extend_from_slice(&objects);
        let mac = helper.retail_mac(&[0x22; 16], &pad80(&mac_input)).unwrap();
        objects.extend_from_slice(&Tlv::new(TAG_DO8E, mac[..MAC_LEN].to_vec()).to_bytes());

        let err = channel
            .unwrap_response(Response::new(objects, StatusWord::OK))
            .unwrap_err();
        assert!(matches!(err, Error::SecureChannel(_)));
        assert_eq!(channel.phase(), Phase::Closed);
    }

    #[test]
    fn establishment_walks_through_key_establishment() {
        struct FixedKeys;
        impl Authenticator for FixedKeys {
            fn establish(
                &mut self,
                _transport: &mut dyn CardTransport,
                _helper: &dyn CryptoHelper,
            ) -> Result<SessionKeys> {
                Ok(SessionKeys::new([0x11; 16], [0x22; 16], [0u8; 8]))
            }
        }

        let mut channel = SecureChannel::new(NullTransport, Rc::new(SoftCryptoHelper));
        assert_eq!(channel.phase(), Phase::Closed);
        channel.install_keys(SessionKeys::new([0x11; 16], [0x22; 16], [0u8; 8]));
        assert_eq!(channel.phase(), Phase::KeyEstablished);
        channel.close_channel();

        channel.establish(&mut FixedKeys).unwrap();
        assert_eq!(channel.phase(), Phase::Authenticated);
        // Re-establishing an open channel is a no-op.
        channel.establish(&mut FixedKeys).unwrap();
        assert_eq!(channel.phase(), Phase::Authenticated);
    }

    #[test]
    fn closing_a_closed_channel_is_a_no_op() {
        let mut channel = channel();
        channel.close_channel();
        assert_eq!(channel.phase(), Phase::Closed);
        channel.close_channel();
        assert_eq!(channel.phase(), Phase::Closed);
    }
}

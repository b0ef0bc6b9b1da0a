//! Card session controller.
//!
//! [`EidCard`] owns the secure channel stack for one document and
//! sequences the protocols on top of it: directory discovery, PIN
//! verification with retry accounting, PIN-gated signing with bounded
//! lost-channel recovery, and PIN change.
//!
//! One session exclusively owns its transport; drive it from one thread
//! and wrap the whole session in external mutual exclusion if several
//! logical threads must share a physical card.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::apdu::StatusWord;
use crate::asn1::pkcs15::{CertDirectory, KeyDirectory};
use crate::commands::{auth, file, pin, sign};
use crate::crypto::{self, CryptoHelper, DigestAlgorithm, SoftCryptoHelper};
use crate::secure::{Authenticator, CertChainAuth, ChannelConstants, SecureChannel};
use crate::transport::CardTransport;
use crate::{Error, Result};

mod credentials;

pub use credentials::{PinPrompt, PinSource, SignConfirmation, StaticPin};

/// Name the root directory answers to.
const MASTER_FILE_NAME: &str = "Master.File";
/// Certificate directory (CDF).
const CDF_PATH: &[u8] = &[0x50, 0x15, 0x60, 0x04];
/// Private-key directory (PrKDF).
const PRKDF_PATH: &[u8] = &[0x50, 0x15, 0x60, 0x01];
/// Component certificate the card authenticates the channel with.
const CERT_ICC_PATH: &[u8] = &[0x60, 0x1F];
/// Support-number file.
const IDESP_PATH: &[u8] = &[0x3F, 0x00, 0x00, 0x06];
/// Main PIN file.
const PIN_FILE_ID: [u8; 2] = [0x00, 0x00];

/// Retry count assumed when the card reports the PIN as already verified
/// instead of a counter.
const DEFAULT_PIN_RETRIES: u8 = 3;
/// Largest chunk one READ BINARY may return.
const READ_CHUNK: u8 = 0xFF;

/// Root-relative file path, two bytes per component.
#[derive(Clone, PartialEq, Eq)]
pub struct Location(Vec<u8>);

impl Location {
    pub fn new(path: impl Into<Vec<u8>>) -> Result<Self> {
        let path = path.into();
        if path.is_empty() || path.len() % 2 != 0 {
            return Err(Error::MalformedEncoding("file path must be pairs of bytes"));
        }
        Ok(Self(path))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn file_ids(&self) -> impl Iterator<Item = [u8; 2]> + '_ {
        self.0.chunks_exact(2).map(|id| [id[0], id[1]])
    }

    /// Final two-byte component of the path.
    pub fn last_file_id(&self) -> [u8; 2] {
        let n = self.0.len();
        [self.0[n - 2], self.0[n - 1]]
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Location(")?;
        for byte in &self.0 {
            write!(f, "{byte:02X}")?;
        }
        write!(f, ")")
    }
}

/// Certificate roles a document carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertAlias {
    Authentication,
    Signing,
    Encryption,
    PseudonymSigning,
    IntermediateCa,
}

impl CertAlias {
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "CertAutenticacion" => Some(Self::Authentication),
            "CertFirmaDigital" => Some(Self::Signing),
            "CertCifrado" => Some(Self::Encryption),
            "CertFirmaSeudonimo" => Some(Self::PseudonymSigning),
            "CertCAIntermediaDGP" => Some(Self::IntermediateCa),
            _ => None,
        }
    }
}

/// What a discovered private key is good for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    Authentication,
    Signing,
    Encryption,
}

/// Handle to a key the card holds; never contains key material.
#[derive(Debug, Clone)]
pub struct PrivateKeyRef {
    pub label: String,
    pub id: Vec<u8>,
    pub location: Location,
    pub key_reference: u8,
    pub usage: KeyUsage,
    pub modulus_bits: Option<u32>,
}

/// One resolved certificate-directory record.
#[derive(Debug, Clone)]
pub struct CertRecord {
    pub alias: String,
    pub role: CertAlias,
    pub id: Vec<u8>,
    pub location: Location,
}

#[derive(Debug, Default)]
struct Directories {
    certificates: Vec<CertRecord>,
    keys: Vec<PrivateKeyRef>,
}

/// Session policy knobs.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Re-prompt and retry after a wrong PIN. Never applies to cached
    /// sources.
    pub pin_auto_retry: bool,
    /// Lost-channel recoveries allowed per signing call.
    pub channel_retry_budget: u8,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            pin_auto_retry: true,
            channel_retry_budget: 3,
        }
    }
}

/// A session with one identity document.
pub struct EidCard<T: CardTransport> {
    channel: SecureChannel<T>,
    helper: Rc<dyn CryptoHelper>,
    authenticator: Option<Box<dyn Authenticator>>,
    pin_source: Box<dyn PinSource>,
    confirmation: Option<Box<dyn SignConfirmation>>,
    options: SessionOptions,
    directories: Option<Directories>,
    certificate_cache: HashMap<CertAlias, Bytes>,
    pin_verified: bool,
}

impl<T: CardTransport> fmt::Debug for EidCard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EidCard")
            .field("channel", &self.channel)
            .field("pin_verified", &self.pin_verified)
            .finish_non_exhaustive()
    }
}

impl<T: CardTransport> EidCard<T> {
    pub fn new(transport: T, pin_source: Box<dyn PinSource>, options: SessionOptions) -> Self {
        let helper: Rc<dyn CryptoHelper> = Rc::new(SoftCryptoHelper);
        Self {
            channel: SecureChannel::new(transport, Rc::clone(&helper)),
            helper,
            authenticator: None,
            pin_source,
            confirmation: None,
            options,
            directories: None,
            certificate_cache: HashMap::new(),
            pin_verified: false,
        }
    }

    /// Secure the session with a channel authenticator. Without one the
    /// underlying transport is used as-is, which only suits transports
    /// that are trusted end to end (a local test harness, or an outer
    /// layer that already secures the link).
    pub fn with_authenticator(mut self, authenticator: Box<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_confirmation(mut self, confirmation: Box<dyn SignConfirmation>) -> Self {
        self.confirmation = Some(confirmation);
        self
    }

    pub fn connect(&mut self) -> Result<()> {
        self.channel.open()
    }

    /// Direct access to the physical transport, bypassing the channel.
    pub fn transport_mut(&mut self) -> &mut T {
        self.channel.transport_mut()
    }

    pub fn disconnect(&mut self) -> Result<()> {
        self.pin_verified = false;
        self.channel.close()
    }

    /// Build the certificate-chain authenticator for this card: its
    /// component certificate and serial number feed the handshake.
    pub fn certificate_chain_authenticator(
        &mut self,
        constants: ChannelConstants,
    ) -> Result<CertChainAuth> {
        let cert = self.read_file(&Location::new(CERT_ICC_PATH)?)?;
        let public_key = crypto::rsa_public_key_from_certificate(&cert)?;
        let serial = self.icc_serial()?;
        Ok(CertChainAuth::new(constants, public_key, serial))
    }

    /// Select and read a whole file, root first.
    pub fn read_file(&mut self, location: &Location) -> Result<Bytes> {
        self.channel
            .transmit(&file::select_by_name(MASTER_FILE_NAME))?
            .check("SELECT master file")?;
        let mut size = None;
        for id in location.file_ids() {
            let response = self
                .channel
                .transmit(&file::select_by_id(id))?
                .check("SELECT file")?;
            size = file_size_from_fci(response.data());
        }

        let mut image = BytesMut::new();
        loop {
            let remaining = match size {
                Some(size) => size.saturating_sub(image.len()),
                None => usize::from(READ_CHUNK),
            };
            if remaining == 0 {
                break;
            }
            let chunk = remaining.min(usize::from(READ_CHUNK)) as u8;
            let response = self
                .channel
                .transmit(&file::read_binary(image.len() as u16, chunk))?;
            if response.sw() == StatusWord::EOF_REACHED {
                image.extend_from_slice(response.data());
                break;
            }
            let response = response.check("READ BINARY")?;
            if response.data().is_empty() {
                break;
            }
            image.extend_from_slice(response.data());
            if size.is_none() && response.data().len() < usize::from(chunk) {
                break;
            }
        }
        debug!(location = ?location, len = image.len(), "read file");
        Ok(image.freeze())
    }

    /// Discovered certificate records, loading the directory on first use.
    pub fn certificates(&mut self) -> Result<&[CertRecord]> {
        Ok(&self.ensure_directories()?.certificates)
    }

    /// Discovered key handles, loading the directory on first use.
    pub fn private_keys(&mut self) -> Result<&[PrivateKeyRef]> {
        Ok(&self.ensure_directories()?.keys)
    }

    pub fn private_key(&mut self, usage: KeyUsage) -> Result<PrivateKeyRef> {
        self.ensure_directories()?
            .keys
            .iter()
            .find(|key| key.usage == usage)
            .cloned()
            .ok_or(Error::FileNotFound)
    }

    /// Certificate bytes for a role, read once and cached for the life of
    /// the session.
    pub fn certificate(&mut self, alias: CertAlias) -> Result<Bytes> {
        if let Some(cached) = self.certificate_cache.get(&alias) {
            return Ok(cached.clone());
        }
        let location = self
            .ensure_directories()?
            .certificates
            .iter()
            .find(|record| record.role == alias)
            .map(|record| record.location.clone())
            .ok_or(Error::FileNotFound)?;
        let image = self.read_file(&location)?;
        self.certificate_cache.insert(alias, image.clone());
        Ok(image)
    }

    fn ensure_directories(&mut self) -> Result<&Directories> {
        if self.directories.is_none() {
            let directories = self.load_directories()?;
            self.directories = Some(directories);
        }
        Ok(self.directories.as_ref().unwrap_or(&EMPTY_DIRECTORIES))
    }

    fn load_directories(&mut self) -> Result<Directories> {
        let cdf = self.read_file(&Location::new(CDF_PATH)?)?;
        let mut certificates = Vec::new();
        for entry in CertDirectory::parse(&cdf)?.entries {
            let Some(role) = CertAlias::from_label(&entry.alias) else {
                warn!(alias = %entry.alias, "ignoring certificate with unknown alias");
                continue;
            };
            certificates.push(CertRecord {
                alias: entry.alias,
                role,
                id: entry.id,
                location: Location::new(entry.path.path)?,
            });
        }

        let prkdf = self.read_file(&Location::new(PRKDF_PATH)?)?;
        let mut keys = Vec::new();
        for entry in KeyDirectory::parse(&prkdf)?.entries {
            let usage = match entry.label.as_str() {
                "KprivAutenticacion" => KeyUsage::Authentication,
                "KprivFirmaDigital" => KeyUsage::Signing,
                "KprivCifrado" => KeyUsage::Encryption,
                // A key the card exposes is usable even when its label is
                // unknown; assume the common case.
                other => {
                    warn!(label = %other, "unknown key label, exposing as a signing key");
                    KeyUsage::Signing
                }
            };
            keys.push(PrivateKeyRef {
                label: entry.label,
                id: entry.id,
                location: Location::new(entry.path.path)?,
                key_reference: entry.key_reference,
                usage,
                modulus_bits: entry.modulus_bits,
            });
        }
        debug!(
            certificates = certificates.len(),
            keys = keys.len(),
            "directories loaded"
        );
        Ok(Directories { certificates, keys })
    }

    /// Raw chip serial number.
    pub fn serial_number(&mut self) -> Result<Bytes> {
        let response = self
            .channel
            .transmit(&file::get_chip_info())?
            .check("GET CHIP INFO")?;
        Ok(response.into_data())
    }

    fn icc_serial(&mut self) -> Result<[u8; 8]> {
        let raw = self.serial_number()?;
        if raw.len() > 8 {
            return Err(Error::secure_channel("chip serial longer than eight bytes"));
        }
        let mut serial = [0u8; 8];
        serial[8 - raw.len()..].copy_from_slice(&raw);
        Ok(serial)
    }

    /// Printed support number from the IDESP file.
    pub fn support_number(&mut self) -> Result<String> {
        let image = self.read_file(&Location::new(IDESP_PATH)?)?;
        let printable: Vec<u8> = image
            .iter()
            .copied()
            .take_while(|byte| byte.is_ascii_graphic())
            .collect();
        String::from_utf8(printable).map_err(|_| Error::MalformedEncoding("support number"))
    }

    /// Open the secure channel if it is not already open. Without a
    /// configured authenticator the transport is used directly.
    pub fn open_secure_channel(&mut self) -> Result<()> {
        match &mut self.authenticator {
            Some(authenticator) => self.channel.establish(authenticator.as_mut()),
            None => {
                debug!("no channel authenticator configured, using the transport directly");
                Ok(())
            }
        }
    }

    /// Remaining PIN attempts as the card reports them.
    pub fn pin_retries_left(&mut self) -> Result<u8> {
        let response = self.channel.transmit(&pin::retries_left())?;
        if let Some(retries) = response.sw().retries_left() {
            return Ok(retries);
        }
        if response.sw() == StatusWord::AUTH_METHOD_LOCKED {
            return Ok(0);
        }
        if response.sw().is_ok() {
            // Card treats the PIN as verified already.
            return Ok(DEFAULT_PIN_RETRIES);
        }
        Err(Error::CardCommand {
            operation: "PIN retry inquiry",
            sw: response.sw(),
        })
    }

    /// Verify the PIN, prompting through the configured source.
    ///
    /// A locked counter fails before any VERIFY is transmitted. After a
    /// wrong PIN the source is reset and consulted again, once per
    /// failure, unless auto-retry is off or the source replays a cached
    /// value.
    pub fn verify_pin(&mut self) -> Result<()> {
        self.open_secure_channel()?;
        let mut retries = self.pin_retries_left()?;
        if retries == 0 {
            return Err(Error::AuthenticationLocked);
        }
        loop {
            let value = self.pin_source.request(Some(retries))?;
            let response = self.channel.transmit(&pin::verify_pin(value.as_bytes()))?;
            drop(value);
            match response.check("VERIFY") {
                Ok(_) => {
                    self.pin_verified = true;
                    debug!("PIN verified");
                    return Ok(());
                }
                Err(Error::BadPin { retries_left }) => {
                    warn!(retries_left, "wrong PIN");
                    if retries_left == 0 {
                        return Err(Error::AuthenticationLocked);
                    }
                    if !self.options.pin_auto_retry || self.pin_source.is_cached() {
                        return Err(Error::BadPin { retries_left });
                    }
                    self.pin_source.reset()?;
                    retries = retries_left;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Sign `data` with a discovered key.
    ///
    /// The digest and PKCS#1 DigestInfo are computed terminal-side; the
    /// card only applies the key. A lost channel closes the session
    /// keys, falls back to the plain transport and re-runs the protocol,
    /// at most [`SessionOptions::channel_retry_budget`] times.
    pub fn sign(
        &mut self,
        key: &PrivateKeyRef,
        data: &[u8],
        algorithm: DigestAlgorithm,
    ) -> Result<Vec<u8>> {
        match &mut self.confirmation {
            Some(confirmation) => {
                if !confirmation.confirm(&key.label)? {
                    return Err(Error::AuthorizationDenied);
                }
            }
            None => warn!("signing without a confirmation capability"),
        }

        let mut budget = self.options.channel_retry_budget;
        loop {
            match self.sign_once(key, data, algorithm) {
                Ok(signature) => {
                    // Leave a known-closed channel for unrelated callers.
                    self.drop_channel();
                    return Ok(signature);
                }
                Err(Error::LostChannel) if budget > 0 => {
                    budget -= 1;
                    warn!(budget, "channel lost while signing, re-establishing");
                    self.drop_channel();
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn sign_once(
        &mut self,
        key: &PrivateKeyRef,
        data: &[u8],
        algorithm: DigestAlgorithm,
    ) -> Result<Vec<u8>> {
        self.open_secure_channel()?;
        if !self.pin_verified {
            self.verify_pin()?;
        }
        // The card selects the key by the final component of its path.
        self.channel
            .transmit(&auth::mse_set_computation(&key.location.last_file_id()))?
            .check("MSE SET signing key")?;
        let digest_info = crypto::digest_info(self.helper.as_ref(), algorithm, data)?;
        let response = self
            .channel
            .transmit(&sign::pso_sign_hash(&digest_info))?
            .check("PSO COMPUTE DIGITAL SIGNATURE")?;
        Ok(response.into_data().to_vec())
    }

    /// Change the main PIN; recovers once from a lost channel.
    pub fn change_pin(&mut self, old_pin: &str, new_pin: &str) -> Result<()> {
        let mut recovered = false;
        loop {
            match self.change_pin_once(old_pin, new_pin) {
                Ok(()) => return Ok(()),
                Err(Error::LostChannel) if !recovered => {
                    recovered = true;
                    warn!("channel lost while changing the PIN, re-establishing");
                    self.drop_channel();
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn change_pin_once(&mut self, old_pin: &str, new_pin: &str) -> Result<()> {
        self.open_secure_channel()?;
        self.channel
            .transmit(&file::select_by_name(MASTER_FILE_NAME))?
            .check("SELECT master file")?;
        self.channel
            .transmit(&file::select_by_id(PIN_FILE_ID))?
            .check("SELECT PIN file")?;
        self.channel
            .transmit(&pin::change_pin(old_pin.as_bytes(), new_pin.as_bytes()))?
            .check("CHANGE PIN")?;
        debug!("PIN changed");
        Ok(())
    }

    /// Drop secure-channel state, leaving the transport connected.
    fn drop_channel(&mut self) {
        self.channel.close_channel();
        self.pin_verified = false;
    }
}

static EMPTY_DIRECTORIES: Directories = Directories {
    certificates: Vec::new(),
    keys: Vec::new(),
};

/// File size out of a SELECT response's FCI template, when present.
fn file_size_from_fci(fci: &[u8]) -> Option<usize> {
    let outer = crate::tlv::Tlv::parse_single(fci).ok()?;
    if outer.tag() != 0x6F {
        return None;
    }
    for tlv in crate::tlv::TlvIter::new(outer.value()) {
        let tlv = tlv.ok()?;
        if matches!(tlv.tag(), 0x80 | 0x81) {
            let mut size = 0usize;
            for byte in tlv.value() {
                size = size << 8 | usize::from(*byte);
            }
            return Some(size);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_rejects_odd_paths() {
        assert!(Location::new(vec![0x50]).is_err());
        assert!(Location::new(Vec::new()).is_err());
        let location = Location::new(vec![0x50, 0x15, 0x60, 0x04]).unwrap();
        let ids: Vec<[u8; 2]> = location.file_ids().collect();
        assert_eq!(ids, vec![[0x50, 0x15], [0x60, 0x04]]);
        assert_eq!(location.last_file_id(), [0x60, 0x04]);
    }

    #[test]
    fn alias_resolution() {
        assert_eq!(
            CertAlias::from_label("CertAutenticacion"),
            Some(CertAlias::Authentication)
        );
        assert_eq!(
            CertAlias::from_label("CertFirmaSeudonimo"),
            Some(CertAlias::PseudonymSigning)
        );
        assert_eq!(CertAlias::from_label("CertDesconocido"), None);
    }

    #[test]
    fn fci_size_extraction() {
        let fci = crate::tlv::Tlv::new(
            0x6F,
            crate::tlv::Tlv::new(0x81, vec![0x01, 0x90]).to_bytes(),
        );
        assert_eq!(file_size_from_fci(&fci.to_bytes()), Some(0x190));
        assert_eq!(file_size_from_fci(&[0x90, 0x00]), None);
    }
}

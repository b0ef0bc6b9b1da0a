//! CWA-14890 certificate-chain mutual authentication.
//!
//! The terminal proves its certificate chain to the card (root CA key,
//! intermediate CA certificate, terminal certificate), then both sides
//! exchange RSA-enveloped random key halves through INTERNAL and
//! EXTERNAL AUTHENTICATE. Session keys are SHA-1 derivations of the
//! XORed halves; the send sequence counter starts from the tails of the
//! two challenges.

use num_bigint_dig::BigUint;
use tracing::debug;
use zeroize::Zeroizing;

use crate::commands::auth;
use crate::crypto::{CryptoHelper, DigestAlgorithm, RsaPrivateKey, RsaPublicKey};
use crate::transport::CardTransport;
use crate::{Error, Result};

use super::{Authenticator, SessionKeys};

/// Envelope framing of the authentication payloads.
const ENVELOPE_HEADER: u8 = 0x6A;
const ENVELOPE_TRAILER: u8 = 0xBC;
/// Length of each exchanged key half.
const KEY_HALF_LEN: usize = 32;
const SHA1_LEN: usize = 20;
const CHALLENGE_LEN: usize = 8;

/// Terminal-side material for one card profile. Certificates are in the
/// card-verifiable format the card's PSO VERIFY CERTIFICATE expects.
#[derive(Debug, Clone)]
pub struct ChannelConstants {
    /// Reference of the trusted root CA public key held by the card.
    pub root_ca_key_reference: Vec<u8>,
    pub intermediate_ca_certificate: Vec<u8>,
    /// Holder reference of the intermediate CA key once verified.
    pub intermediate_chr: Vec<u8>,
    pub terminal_certificate: Vec<u8>,
    /// Reference of the card key used for its side of the handshake.
    pub card_key_reference: Vec<u8>,
    /// Terminal holder reference; its last eight bytes name the terminal
    /// inside the authentication hashes.
    pub terminal_chr: Vec<u8>,
    pub terminal_private_key: RsaPrivateKey,
}

impl ChannelConstants {
    fn terminal_serial(&self) -> Result<&[u8]> {
        if self.terminal_chr.len() < CHALLENGE_LEN {
            return Err(Error::secure_channel("terminal holder reference too short"));
        }
        Ok(&self.terminal_chr[self.terminal_chr.len() - CHALLENGE_LEN..])
    }
}

/// Certificate-chain authenticator.
///
/// The card's component public key and serial number are read over the
/// plain transport before the handshake starts and passed in here.
pub struct CertChainAuth {
    constants: ChannelConstants,
    icc_public_key: RsaPublicKey,
    icc_serial: [u8; 8],
}

impl CertChainAuth {
    pub fn new(
        constants: ChannelConstants,
        icc_public_key: RsaPublicKey,
        icc_serial: [u8; 8],
    ) -> Self {
        Self {
            constants,
            icc_public_key,
            icc_serial,
        }
    }

    /// Open the card-sent envelope: it is either the raw signature or its
    /// modulus complement, whichever the card found smaller.
    fn open_envelope(
        &self,
        helper: &dyn CryptoHelper,
        sig_min: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let direct = helper.rsa_public(&self.icc_public_key, sig_min)?;
        if envelope_framed(&direct) {
            return Ok(Zeroizing::new(direct));
        }
        let n = BigUint::from_bytes_be(&self.icc_public_key.modulus);
        let complement = (&n - BigUint::from_bytes_be(sig_min)).to_bytes_be();
        let alternate = helper.rsa_public(&self.icc_public_key, &left_pad(&complement, sig_min.len()))?;
        if envelope_framed(&alternate) {
            return Ok(Zeroizing::new(alternate));
        }
        Err(Error::secure_channel("card authentication envelope malformed"))
    }
}

impl Authenticator for CertChainAuth {
    fn establish(
        &mut self,
        transport: &mut dyn CardTransport,
        helper: &dyn CryptoHelper,
    ) -> Result<SessionKeys> {
        debug!("starting certificate-chain authentication");
        let constants = &self.constants;

        transport
            .transmit(&auth::mse_set_verification_key(&constants.root_ca_key_reference))?
            .check("MSE SET root CA key")?;
        transport
            .transmit(&auth::pso_verify_certificate(&constants.intermediate_ca_certificate))?
            .check("PSO VERIFY intermediate CA certificate")?;
        transport
            .transmit(&auth::mse_set_verification_key(&constants.intermediate_chr))?
            .check("MSE SET intermediate CA key")?;
        transport
            .transmit(&auth::pso_verify_certificate(&constants.terminal_certificate))?
            .check("PSO VERIFY terminal certificate")?;
        transport
            .transmit(&auth::mse_set_authentication_keys(
                &constants.card_key_reference,
                &constants.terminal_chr,
            ))?
            .check("MSE SET authentication keys")?;
        debug!("certificate chain accepted by the card");

        // Card proves itself: it envelopes a fresh key half over our
        // challenge, signed with its component key and enciphered to the
        // terminal key.
        let terminal_serial = constants.terminal_serial()?.to_vec();
        let rnd_ifd = helper.random(CHALLENGE_LEN)?;
        let internal = transport
            .transmit(&auth::internal_authenticate(&rnd_ifd, &terminal_serial))?
            .check("INTERNAL AUTHENTICATE")?;
        let sig_min = helper.rsa_private(&constants.terminal_private_key, internal.data())?;
        let envelope = self.open_envelope(helper, &sig_min)?;

        let n = envelope.len();
        if n < 2 + KEY_HALF_LEN + SHA1_LEN {
            return Err(Error::secure_channel("card authentication envelope too short"));
        }
        let prnd1 = &envelope[1..n - 1 - KEY_HALF_LEN - SHA1_LEN];
        let kicc = &envelope[n - 1 - KEY_HALF_LEN - SHA1_LEN..n - 1 - SHA1_LEN];
        let hash = &envelope[n - 1 - SHA1_LEN..n - 1];
        let mut check = prnd1.to_vec();
        check.extend_from_slice(kicc);
        check.extend_from_slice(&rnd_ifd);
        check.extend_from_slice(&terminal_serial);
        if helper.digest(DigestAlgorithm::Sha1, &check)? != hash {
            return Err(Error::secure_channel("card authentication hash mismatch"));
        }
        let kicc = Zeroizing::new(kicc.to_vec());
        debug!("card authenticated");

        // Terminal proves itself over the card's challenge.
        let rnd_icc = transport
            .transmit(&auth::get_challenge(CHALLENGE_LEN as u8))?
            .check("GET CHALLENGE")?
            .into_data();
        if rnd_icc.len() != CHALLENGE_LEN {
            return Err(Error::secure_channel("short card challenge"));
        }
        let kifd = Zeroizing::new(helper.random(KEY_HALF_LEN)?);
        let key_len = constants.terminal_private_key.byte_len();
        let prnd2 = helper.random(key_len - 2 - KEY_HALF_LEN - SHA1_LEN)?;
        let mut check = prnd2.clone();
        check.extend_from_slice(&kifd);
        check.extend_from_slice(&rnd_icc);
        check.extend_from_slice(&self.icc_serial);
        let hash = helper.digest(DigestAlgorithm::Sha1, &check)?;

        let mut payload = Zeroizing::new(Vec::with_capacity(key_len));
        payload.push(ENVELOPE_HEADER);
        payload.extend_from_slice(&prnd2);
        payload.extend_from_slice(&kifd);
        payload.extend_from_slice(&hash);
        payload.push(ENVELOPE_TRAILER);
        let signature = helper.rsa_private(&constants.terminal_private_key, &payload)?;
        let sig_min = minimal_signature(&constants.terminal_private_key.modulus, &signature);
        let enciphered = helper.rsa_public(&self.icc_public_key, &sig_min)?;
        transport
            .transmit(&auth::external_authenticate(&enciphered))?
            .check("EXTERNAL AUTHENTICATE")?;
        debug!("terminal authenticated");

        derive_session_keys(helper, &kifd, &kicc, &rnd_ifd, &rnd_icc)
    }
}

fn envelope_framed(data: &[u8]) -> bool {
    matches!((data.first(), data.last()), (Some(&ENVELOPE_HEADER), Some(&ENVELOPE_TRAILER)))
}

/// The smaller of the signature and its modulus complement; the card
/// resolves the ambiguity on its side.
fn minimal_signature(modulus: &[u8], signature: &[u8]) -> Vec<u8> {
    let n = BigUint::from_bytes_be(modulus);
    let sig = BigUint::from_bytes_be(signature);
    let complement = &n - &sig;
    let min = if sig <= complement { sig } else { complement };
    left_pad(&min.to_bytes_be(), modulus.len())
}

fn left_pad(value: &[u8], width: usize) -> Vec<u8> {
    let mut out = vec![0u8; width.saturating_sub(value.len())];
    out.extend_from_slice(value);
    out
}

/// Kenc and Kmac are SHA-1 over the XORed key halves with a derivation
/// counter; the send sequence counter seeds from the challenge tails.
fn derive_session_keys(
    helper: &dyn CryptoHelper,
    kifd: &[u8],
    kicc: &[u8],
    rnd_ifd: &[u8],
    rnd_icc: &[u8],
) -> Result<SessionKeys> {
    let mixed: Zeroizing<Vec<u8>> =
        Zeroizing::new(kifd.iter().zip(kicc).map(|(a, b)| a ^ b).collect());

    let mut derive = |counter: u8| -> Result<[u8; 16]> {
        let mut input = Zeroizing::new(mixed.to_vec());
        input.extend_from_slice(&[0x00, 0x00, 0x00, counter]);
        let digest = helper.digest(DigestAlgorithm::Sha1, &input)?;
        let mut key = [0u8; 16];
        key.copy_from_slice(&digest[..16]);
        Ok(key)
    };
    let enc = derive(1)?;
    let mac = derive(2)?;

    let mut ssc = [0u8; 8];
    ssc[..4].copy_from_slice(&rnd_icc[4..8]);
    ssc[4..].copy_from_slice(&rnd_ifd[4..8]);
    Ok(SessionKeys::new(enc, mac, ssc))
}

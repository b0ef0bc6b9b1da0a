//! Security-environment and authentication commands the secure-channel
//! handshake is built from.

use super::CLA_ISO;
use crate::apdu::Command;

/// MSE SET DST: select a public key, by reference, for the next
/// certificate verification.
pub fn mse_set_verification_key(key_ref: &[u8]) -> Command {
    let mut crt = vec![0x83, key_ref.len() as u8];
    crt.extend_from_slice(key_ref);
    Command::new(CLA_ISO, 0x22, 0x81, 0xB6).with_data(crt)
}

/// PSO VERIFY CERTIFICATE: submit a card-verifiable certificate for
/// verification against the currently selected public key.
pub fn pso_verify_certificate(certificate: &[u8]) -> Command {
    Command::new(CLA_ISO, 0x2A, 0x00, 0xAE).with_data(certificate.to_vec())
}

/// MSE SET for internal/external authentication: the card-side private key
/// reference and the terminal public key reference (its CHR).
pub fn mse_set_authentication_keys(private_ref: &[u8], public_ref: &[u8]) -> Command {
    let mut body = vec![0x84, private_ref.len() as u8];
    body.extend_from_slice(private_ref);
    body.push(0x83);
    body.push(public_ref.len() as u8);
    body.extend_from_slice(public_ref);
    Command::new(CLA_ISO, 0x22, 0xC1, 0xA4).with_data(body)
}

/// MSE SET DST for signing: select the private key file the PSO SIGN will
/// use.
pub fn mse_set_computation(key_path: &[u8]) -> Command {
    let mut crt = vec![0x84, key_path.len() as u8];
    crt.extend_from_slice(key_path);
    Command::new(CLA_ISO, 0x22, 0x41, 0xB6).with_data(crt)
}

/// GET CHALLENGE for `len` random bytes from the card.
pub fn get_challenge(len: u8) -> Command {
    Command::new(CLA_ISO, 0x84, 0x00, 0x00).with_le(u16::from(len))
}

/// INTERNAL AUTHENTICATE with the terminal challenge and key reference.
pub fn internal_authenticate(rnd_ifd: &[u8], terminal_ref: &[u8]) -> Command {
    let mut body = Vec::with_capacity(rnd_ifd.len() + terminal_ref.len());
    body.extend_from_slice(rnd_ifd);
    body.extend_from_slice(terminal_ref);
    Command::new(CLA_ISO, 0x88, 0x00, 0x00).with_data(body).with_le(0)
}

/// EXTERNAL AUTHENTICATE carrying the terminal's authentication cryptogram.
pub fn external_authenticate(data: &[u8]) -> Command {
    Command::new(CLA_ISO, 0x82, 0x00, 0x00).with_data(data.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mse_verification_wraps_reference_in_crt() {
        let cmd = mse_set_verification_key(&[0x02, 0x0F]);
        assert_eq!(
            cmd.to_bytes().as_ref(),
            &[0x00, 0x22, 0x81, 0xB6, 0x04, 0x83, 0x02, 0x02, 0x0F]
        );
    }

    #[test]
    fn authentication_keys_carry_both_references() {
        let cmd = mse_set_authentication_keys(&[0x01], &[0xAA, 0xBB]);
        assert_eq!(
            cmd.to_bytes().as_ref(),
            &[0x00, 0x22, 0xC1, 0xA4, 0x07, 0x84, 0x01, 0x01, 0x83, 0x02, 0xAA, 0xBB]
        );
    }
}

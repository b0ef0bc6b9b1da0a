//! Signature computation.

use super::CLA_ISO;
use crate::apdu::Command;

/// PSO COMPUTE DIGITAL SIGNATURE over a prebuilt DigestInfo structure.
/// Requires a prior [`super::auth::mse_set_computation`] naming the key.
pub fn pso_sign_hash(digest_info: &[u8]) -> Command {
    Command::new(CLA_ISO, 0x2A, 0x9E, 0x9A)
        .with_data(digest_info.to_vec())
        .with_le(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_frame_shape() {
        let cmd = pso_sign_hash(&[0x30, 0x02, 0x01, 0x00]);
        let bytes = cmd.to_bytes();
        assert_eq!(&bytes[..4], &[0x00, 0x2A, 0x9E, 0x9A]);
        assert_eq!(bytes[4], 4);
        assert_eq!(*bytes.last().unwrap(), 0x00);
    }
}

//! Shared-secret channel establishment.
//!
//! Contactless profiles open the channel from a low-entropy secret
//! printed on the document (CAN or MRZ-derived) instead of a certificate
//! chain. Both sides mix the secret with a challenge pair, prove key
//! possession with a MAC over the challenges, and land in the same
//! authenticated state the certificate chain produces.

use tracing::debug;
use zeroize::Zeroizing;

use crate::commands::auth;
use crate::crypto::{CryptoHelper, DigestAlgorithm};
use crate::transport::CardTransport;
use crate::{Error, Result};

use super::{pad80, Authenticator, SessionKeys};

const CHALLENGE_LEN: usize = 8;

/// Password-based authenticator.
pub struct SharedSecretAuth {
    secret: Zeroizing<Vec<u8>>,
}

impl SharedSecretAuth {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
        }
    }
}

impl Authenticator for SharedSecretAuth {
    fn establish(
        &mut self,
        transport: &mut dyn CardTransport,
        helper: &dyn CryptoHelper,
    ) -> Result<SessionKeys> {
        debug!("starting shared-secret authentication");

        let rnd_icc = transport
            .transmit(&auth::get_challenge(CHALLENGE_LEN as u8))?
            .check("GET CHALLENGE")?
            .into_data();
        if rnd_icc.len() != CHALLENGE_LEN {
            return Err(Error::secure_channel("short card challenge"));
        }
        let rnd_ifd = helper.random(CHALLENGE_LEN)?;

        // Seed binds the secret to both challenges; per-key derivation
        // appends a counter, matching the certificate-chain derivation.
        let mut seed_input = Zeroizing::new(self.secret.to_vec());
        seed_input.extend_from_slice(&rnd_icc);
        seed_input.extend_from_slice(&rnd_ifd);
        let seed = Zeroizing::new(helper.digest(DigestAlgorithm::Sha1, &seed_input)?);

        let mut derive = |counter: u8| -> Result<[u8; 16]> {
            let mut input = Zeroizing::new(seed.to_vec());
            input.extend_from_slice(&[0x00, 0x00, 0x00, counter]);
            let digest = helper.digest(DigestAlgorithm::Sha1, &input)?;
            let mut key = [0u8; 16];
            key.copy_from_slice(&digest[..16]);
            Ok(key)
        };
        let enc = derive(1)?;
        let mac = derive(2)?;

        // Prove key possession: MAC over both challenges with the
        // freshly derived MAC key, alongside our challenge so the card
        // can run the same derivation.
        let mut witness = rnd_icc.to_vec();
        witness.extend_from_slice(&rnd_ifd);
        let proof = helper.retail_mac(&mac, &pad80(&witness))?;
        let mut body = rnd_ifd.clone();
        body.extend_from_slice(&proof);
        transport
            .transmit(&auth::external_authenticate(&body))?
            .check("EXTERNAL AUTHENTICATE")?;
        debug!("shared-secret authentication complete");

        let mut ssc = [0u8; 8];
        ssc[..4].copy_from_slice(&rnd_icc[4..8]);
        ssc[4..].copy_from_slice(&rnd_ifd[4..8]);
        Ok(SessionKeys::new(enc, mac, ssc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apdu::{Command, Response, StatusWord};
    use crate::crypto::SoftCryptoHelper;

    struct ScriptedCard {
        challenge: [u8; 8],
        external_auth_seen: bool,
    }

    impl CardTransport for ScriptedCard {
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
        fn transmit(&mut self, command: &Command) -> Result<Response> {
            match command.ins() {
                0x84 => Ok(Response::new(self.challenge.to_vec(), StatusWord::OK)),
                0x82 => {
                    self.external_auth_seen = true;
                    // 8-byte challenge plus 8-byte proof.
                    assert_eq!(command.data().map(<[u8]>::len), Some(16));
                    Ok(Response::new(Vec::new(), StatusWord::OK))
                }
                ins => panic!("unexpected instruction {ins:02X}"),
            }
        }
    }

    #[test]
    fn derives_keys_and_counter_from_both_challenges() {
        let mut card = ScriptedCard {
            challenge: [1, 2, 3, 4, 5, 6, 7, 8],
            external_auth_seen: false,
        };
        let mut auth = SharedSecretAuth::new(b"123456".to_vec());
        let keys = auth.establish(&mut card, &SoftCryptoHelper).unwrap();
        assert!(card.external_auth_seen);
        assert_eq!(&keys.ssc[..4], &[5, 6, 7, 8]);
        assert_ne!(keys.enc, keys.mac);
    }

    #[test]
    fn refused_proof_aborts() {
        struct RefusingCard;
        impl CardTransport for RefusingCard {
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
            fn transmit(&mut self, command: &Command) -> Result<Response> {
                match command.ins() {
                    0x84 => Ok(Response::new(vec![0u8; 8], StatusWord::OK)),
                    _ => Ok(Response::new(Vec::new(), StatusWord::new(0x69, 0x82))),
                }
            }
        }
        let mut auth = SharedSecretAuth::new(b"wrong".to_vec());
        let err = auth.establish(&mut RefusingCard, &SoftCryptoHelper).unwrap_err();
        assert!(matches!(err, Error::CardCommand { .. }));
    }
}

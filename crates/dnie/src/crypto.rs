//! Cryptographic-helper capability.
//!
//! The protocol stack never implements primitives itself; everything it
//! needs, digests, the 3DES/MAC pair secure messaging is built on, raw RSA
//! for the authentication handshake, is requested through [`CryptoHelper`].
//! [`SoftCryptoHelper`] is the default pure-software implementation.

use cipher::block_padding::NoPadding;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use des::{Des, TdesEde3};
use num_bigint_dig::BigUint;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::asn1::{OctetString, SequenceReader, TAG_SEQUENCE};
use crate::tlv::Tlv;
use crate::{Error, Result};

/// Digest algorithms the signing path understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    /// Accepts plain names (`SHA-256`) and JCA-style signature names
    /// (`SHA256withRSA`).
    pub fn from_name(name: &str) -> Result<Self> {
        let upper = name.to_ascii_uppercase().replace('-', "");
        let digest = upper.split("WITH").next().unwrap_or(&upper);
        match digest {
            "SHA1" => Ok(Self::Sha1),
            "SHA256" => Ok(Self::Sha256),
            "SHA384" => Ok(Self::Sha384),
            "SHA512" => Ok(Self::Sha512),
            _ => Err(Error::crypto(format!("unsupported digest `{name}`"))),
        }
    }

    /// DER-encoded AlgorithmIdentifier OID content.
    fn oid(self) -> &'static [u8] {
        match self {
            Self::Sha1 => &[0x2B, 0x0E, 0x03, 0x02, 0x1A],
            Self::Sha256 => &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01],
            Self::Sha384 => &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02],
            Self::Sha512 => &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03],
        }
    }
}

/// RSA public key as raw modulus/exponent, from a card certificate or a
/// configuration value.
#[derive(Debug, Clone)]
pub struct RsaPublicKey {
    pub modulus: Vec<u8>,
    pub exponent: Vec<u8>,
}

impl RsaPublicKey {
    pub fn byte_len(&self) -> usize {
        self.modulus.len()
    }
}

/// RSA private key material for the terminal side of the handshake.
#[derive(Clone, zeroize::ZeroizeOnDrop)]
pub struct RsaPrivateKey {
    pub modulus: Vec<u8>,
    pub private_exponent: Vec<u8>,
}

impl std::fmt::Debug for RsaPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaPrivateKey").finish_non_exhaustive()
    }
}

impl RsaPrivateKey {
    pub fn byte_len(&self) -> usize {
        self.modulus.len()
    }
}

/// Cryptographic operations consumed by the protocol stack.
pub trait CryptoHelper {
    fn digest(&self, algorithm: DigestAlgorithm, data: &[u8]) -> Result<Vec<u8>>;

    fn random(&self, len: usize) -> Result<Vec<u8>>;

    /// 3DES-CBC, zero IV, no padding; `data` must be block-aligned.
    fn tdes_cbc_encrypt(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>>;

    fn tdes_cbc_decrypt(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>>;

    /// ISO 9797-1 MAC algorithm 3 (retail MAC) with single-DES rounds and
    /// a final 3DES transform; `data` must be block-aligned.
    fn retail_mac(&self, key: &[u8], data: &[u8]) -> Result<[u8; 8]>;

    /// Raw RSA with the private exponent.
    fn rsa_private(&self, key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>>;

    /// Raw RSA with the public exponent.
    fn rsa_public(&self, key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>>;
}

/// Build the PKCS#1 DigestInfo submitted to the card's sign command.
pub fn digest_info(
    helper: &dyn CryptoHelper,
    algorithm: DigestAlgorithm,
    data: &[u8],
) -> Result<Vec<u8>> {
    let digest = helper.digest(algorithm, data)?;
    let alg_id = {
        let mut inner = Tlv::new(0x06, algorithm.oid().to_vec()).to_bytes().to_vec();
        inner.extend_from_slice(&Tlv::new(0x05, Vec::new()).to_bytes());
        Tlv::new(TAG_SEQUENCE, inner)
    };
    let mut body = alg_id.to_bytes().to_vec();
    body.extend_from_slice(&Tlv::new(0x04, digest).to_bytes());
    Ok(Tlv::new(TAG_SEQUENCE, body).to_bytes().to_vec())
}

/// Walk an X.509 certificate just far enough to pull the RSA public key
/// out of its SubjectPublicKeyInfo.
pub fn rsa_public_key_from_certificate(der: &[u8]) -> Result<RsaPublicKey> {
    let (certificate, _) = Tlv::parse(der)?;
    let mut cert = SequenceReader::open(&certificate, TAG_SEQUENCE, "certificate")?;
    let tbs = cert.raw("tbsCertificate")?;
    let mut tbs = SequenceReader::open(&tbs, TAG_SEQUENCE, "tbsCertificate")?;

    // version [0] EXPLICIT is optional; serialNumber, signature, issuer,
    // validity and subject are skipped structurally.
    let _version: Option<OctetString> = tbs.optional_tagged(0xA0)?;
    for field in ["serialNumber", "signature", "issuer", "validity", "subject"] {
        tbs.raw(field)?;
    }
    let spki = tbs.raw("subjectPublicKeyInfo")?;
    let mut spki = SequenceReader::open(&spki, TAG_SEQUENCE, "subjectPublicKeyInfo")?;
    spki.raw("algorithm")?;
    let bits = spki.required_tagged::<OctetString>(0x03, "subjectPublicKey")?;
    let bits = bits.as_bytes();
    // First BIT STRING octet is the unused-bits count.
    let inner = bits
        .split_first()
        .map(|(_, rest)| rest)
        .ok_or(Error::MalformedEncoding("empty subjectPublicKey"))?;
    let rsa = Tlv::parse_single(inner)?;
    let mut rsa = SequenceReader::open(&rsa, TAG_SEQUENCE, "rsaPublicKey")?;
    let modulus = rsa.required_tagged::<OctetString>(0x02, "modulus")?;
    let exponent = rsa.required_tagged::<OctetString>(0x02, "publicExponent")?;

    // INTEGER may carry a sign-padding zero octet.
    let modulus = match modulus.as_bytes() {
        [0x00, rest @ ..] => rest.to_vec(),
        m => m.to_vec(),
    };
    Ok(RsaPublicKey {
        modulus,
        exponent: exponent.into_bytes(),
    })
}

/// Pure-software helper over the RustCrypto stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftCryptoHelper;

impl SoftCryptoHelper {
    /// Two-key 3DES keys expand to the k1‖k2‖k1 triple-length form.
    fn expand_tdes_key(key: &[u8]) -> Result<[u8; 24]> {
        let mut full = [0u8; 24];
        match key.len() {
            16 => {
                full[..16].copy_from_slice(key);
                full[16..].copy_from_slice(&key[..8]);
            }
            24 => full.copy_from_slice(key),
            n => return Err(Error::crypto(format!("bad 3DES key length {n}"))),
        }
        Ok(full)
    }
}

impl CryptoHelper for SoftCryptoHelper {
    fn digest(&self, algorithm: DigestAlgorithm, data: &[u8]) -> Result<Vec<u8>> {
        Ok(match algorithm {
            DigestAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            DigestAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            DigestAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        })
    }

    fn random(&self, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut out);
        Ok(out)
    }

    fn tdes_cbc_encrypt(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        if data.len() % 8 != 0 {
            return Err(Error::crypto("3DES input not block-aligned"));
        }
        let key = Self::expand_tdes_key(key)?;
        let cipher = cbc::Encryptor::<TdesEde3>::new((&key).into(), (&[0u8; 8]).into());
        Ok(cipher.encrypt_padded_vec_mut::<NoPadding>(data))
    }

    fn tdes_cbc_decrypt(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        if data.len() % 8 != 0 {
            return Err(Error::crypto("3DES input not block-aligned"));
        }
        let key = Self::expand_tdes_key(key)?;
        let cipher = cbc::Decryptor::<TdesEde3>::new((&key).into(), (&[0u8; 8]).into());
        cipher
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(|_| Error::crypto("3DES decrypt failed"))
    }

    fn retail_mac(&self, key: &[u8], data: &[u8]) -> Result<[u8; 8]> {
        if key.len() != 16 || data.len() % 8 != 0 {
            return Err(Error::crypto("retail MAC needs a 16-byte key and aligned data"));
        }
        let k1 = Des::new(GenericArray::from_slice(&key[..8]));
        let k2 = Des::new(GenericArray::from_slice(&key[8..]));

        let mut state = GenericArray::clone_from_slice(&[0u8; 8]);
        for block in data.chunks(8) {
            for (s, b) in state.iter_mut().zip(block) {
                *s ^= b;
            }
            k1.encrypt_block(&mut state);
        }
        // Final transform: D(k2) then E(k1).
        k2.decrypt_block(&mut state);
        k1.encrypt_block(&mut state);

        let mut mac = [0u8; 8];
        mac.copy_from_slice(&state);
        Ok(mac)
    }

    fn rsa_private(&self, key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>> {
        rsa_raw(&key.modulus, &key.private_exponent, data)
    }

    fn rsa_public(&self, key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>> {
        rsa_raw(&key.modulus, &key.exponent, data)
    }
}

fn rsa_raw(modulus: &[u8], exponent: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let n = BigUint::from_bytes_be(modulus);
    let e = BigUint::from_bytes_be(exponent);
    let m = BigUint::from_bytes_be(data);
    if m >= n {
        return Err(Error::crypto("RSA input larger than the modulus"));
    }
    let out = m.modpow(&e, &n).to_bytes_be();
    // Left-pad to the modulus width.
    let mut padded = vec![0u8; modulus.len().saturating_sub(out.len())];
    padded.extend_from_slice(&out);
    Ok(padded)
}

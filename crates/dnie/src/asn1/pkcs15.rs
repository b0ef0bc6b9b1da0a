//! PKCS#15 directory records: certificate directory (CDF), private-key
//! directory (PrKDF) and the `Path` type both reference files by.
//!
//! ```text
//!  Path ::= SEQUENCE {
//!    path    OCTET STRING,
//!    index   INTEGER OPTIONAL,
//!    length  [0] INTEGER OPTIONAL
//!  }
//! ```
//!
//! Directory files are a flat run of SEQUENCE records followed by `0xFF`
//! padding. Records decode greedily; bytes past the declared elements are
//! kept but not validated.

use tracing::warn;

use super::{tag_context, Asn1Decode, DerInteger, OctetString, SequenceReader, Utf8String, TAG_SEQUENCE};
use crate::tlv::{Tlv, TlvIter};
use crate::{Error, Result};

/// PKCS#15 `Path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRecord {
    pub path: Vec<u8>,
    pub index: Option<i64>,
    pub length: Option<i64>,
}

impl Asn1Decode for PathRecord {
    const TAG: u32 = TAG_SEQUENCE;

    fn decode(tlv: &Tlv) -> Result<Self> {
        let mut reader = SequenceReader::new(tlv.value());
        let path: OctetString = reader.required("path")?;
        let index: Option<DerInteger> = reader.optional()?;
        let length: Option<DerInteger> = reader.optional_tagged(0x80)?;
        Ok(Self {
            path: path.into_bytes(),
            index: index.map(|i| i.value()),
            length: length.map(|l| l.value()),
        })
    }
}

/// One certificate-directory entry: who the certificate is for (alias),
/// its identifier, and where its file lives.
#[derive(Debug, Clone)]
pub struct CertEntry {
    pub alias: String,
    pub id: Vec<u8>,
    pub path: PathRecord,
}

impl Asn1Decode for CertEntry {
    const TAG: u32 = TAG_SEQUENCE;

    fn decode(tlv: &Tlv) -> Result<Self> {
        let mut reader = SequenceReader::new(tlv.value());

        // CommonObjectAttributes ::= SEQUENCE { label UTF8String, ... }
        let common = reader.raw("commonObjectAttributes")?;
        let mut common = SequenceReader::open(&common, TAG_SEQUENCE, "commonObjectAttributes")?;
        let alias: Utf8String = common.required("label")?;

        // CommonCertificateAttributes ::= SEQUENCE { iD OCTET STRING, ... }
        let class = reader.raw("commonCertificateAttributes")?;
        let mut class = SequenceReader::open(&class, TAG_SEQUENCE, "commonCertificateAttributes")?;
        let id: OctetString = class.required("iD")?;

        // [1] X509CertificateAttributes ::= SEQUENCE { value Path, ... }
        let attrs = reader.raw("x509CertificateAttributes")?;
        let mut attrs = SequenceReader::open(&attrs, tag_context(1), "x509CertificateAttributes")?;
        let value = attrs.raw("value")?;
        let mut value = SequenceReader::open(&value, TAG_SEQUENCE, "value")?;
        let path: PathRecord = value.required("path")?;

        Ok(Self {
            alias: alias.into_string(),
            id: id.into_bytes(),
            path,
        })
    }
}

/// One private-key-directory entry. Never holds key material, only the
/// handle data the card needs to use the key internally.
#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub label: String,
    pub id: Vec<u8>,
    pub key_reference: u8,
    pub path: PathRecord,
    pub modulus_bits: Option<u32>,
}

impl Asn1Decode for KeyEntry {
    const TAG: u32 = TAG_SEQUENCE;

    fn decode(tlv: &Tlv) -> Result<Self> {
        let mut reader = SequenceReader::new(tlv.value());

        let common = reader.raw("commonObjectAttributes")?;
        let mut common = SequenceReader::open(&common, TAG_SEQUENCE, "commonObjectAttributes")?;
        let label: Utf8String = common.required("label")?;

        // CommonKeyAttributes ::= SEQUENCE {
        //   iD OCTET STRING, usage BIT STRING OPTIONAL,
        //   keyReference INTEGER OPTIONAL, ... }
        let class = reader.raw("commonKeyAttributes")?;
        let mut class = SequenceReader::open(&class, TAG_SEQUENCE, "commonKeyAttributes")?;
        let id: OctetString = class.required("iD")?;
        let _usage: Option<OctetString> = class.optional_tagged(0x03)?;
        let key_reference: Option<DerInteger> = class.optional()?;

        // [1] PrivateRSAKeyAttributes ::= SEQUENCE {
        //   value Path, modulusLength INTEGER OPTIONAL, ... }
        let attrs = reader.raw("privateRsaKeyAttributes")?;
        let mut attrs = SequenceReader::open(&attrs, tag_context(1), "privateRsaKeyAttributes")?;
        let value = attrs.raw("value")?;
        let mut value = SequenceReader::open(&value, TAG_SEQUENCE, "value")?;
        let path: PathRecord = value.required("path")?;
        let modulus_bits: Option<DerInteger> = value.optional()?;

        Ok(Self {
            label: label.into_string(),
            id: id.into_bytes(),
            key_reference: key_reference.map(|r| r.value() as u8).unwrap_or(0),
            path,
            modulus_bits: modulus_bits.map(|m| m.value() as u32),
        })
    }
}

/// Parse every record of a directory file image.
///
/// A record that fails to decode poisons the whole read (the file is DER,
/// not a stream), but trailing padding is fine.
fn parse_directory<T: Asn1Decode>(image: &[u8]) -> Result<Vec<T>> {
    let mut records = Vec::new();
    for tlv in TlvIter::new(image) {
        let tlv = tlv?;
        if tlv.tag() != T::TAG {
            warn!(tag = tlv.tag(), "skipping record with unexpected tag");
            continue;
        }
        records.push(T::decode(&tlv)?);
    }
    Ok(records)
}

/// Decoded certificate directory.
#[derive(Debug, Clone, Default)]
pub struct CertDirectory {
    pub entries: Vec<CertEntry>,
}

impl CertDirectory {
    pub fn parse(image: &[u8]) -> Result<Self> {
        Ok(Self {
            entries: parse_directory(image)?,
        })
    }
}

/// Decoded private-key directory.
#[derive(Debug, Clone, Default)]
pub struct KeyDirectory {
    pub entries: Vec<KeyEntry>,
}

impl KeyDirectory {
    pub fn parse(image: &[u8]) -> Result<Self> {
        Ok(Self {
            entries: parse_directory(image)?,
        })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use bytes::BytesMut;

    pub(crate) fn seq(tag: u32, children: &[Tlv]) -> Tlv {
        let mut buf = BytesMut::new();
        for c in children {
            buf.extend_from_slice(&c.to_bytes());
        }
        Tlv::new(tag, buf.freeze())
    }

    pub(crate) fn cert_entry(alias: &str, id: &[u8], path: &[u8]) -> Tlv {
        seq(
            TAG_SEQUENCE,
            &[
                seq(TAG_SEQUENCE, &[Tlv::new(0x0C, alias.as_bytes().to_vec())]),
                seq(TAG_SEQUENCE, &[Tlv::new(0x04, id.to_vec())]),
                seq(
                    tag_context(1),
                    &[seq(
                        TAG_SEQUENCE,
                        &[seq(TAG_SEQUENCE, &[Tlv::new(0x04, path.to_vec())])],
                    )],
                ),
            ],
        )
    }

    pub(crate) fn key_entry(label: &str, id: &[u8], key_ref: u8, path: &[u8]) -> Tlv {
        seq(
            TAG_SEQUENCE,
            &[
                seq(TAG_SEQUENCE, &[Tlv::new(0x0C, label.as_bytes().to_vec())]),
                seq(
                    TAG_SEQUENCE,
                    &[
                        Tlv::new(0x04, id.to_vec()),
                        Tlv::new(0x03, vec![0x07, 0x20, 0x40]),
                        Tlv::new(0x02, vec![key_ref]),
                    ],
                ),
                seq(
                    tag_context(1),
                    &[seq(
                        TAG_SEQUENCE,
                        &[
                            seq(TAG_SEQUENCE, &[Tlv::new(0x04, path.to_vec())]),
                            Tlv::new(0x02, vec![0x08, 0x00]),
                        ],
                    )],
                ),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn cdf_with_n_entries_yields_n_records() {
        let mut image = Vec::new();
        for (alias, id, path) in [
            ("CertAutenticacion", &[0x01][..], &[0x50, 0x15, 0x60, 0x05][..]),
            ("CertFirmaDigital", &[0x02], &[0x50, 0x15, 0x60, 0x06]),
            ("CertCAIntermediaDGP", &[0x03], &[0x50, 0x15, 0x60, 0x07]),
        ] {
            image.extend_from_slice(&cert_entry(alias, id, path).to_bytes());
        }
        image.extend_from_slice(&[0xFF; 8]);

        let cdf = CertDirectory::parse(&image).unwrap();
        assert_eq!(cdf.entries.len(), 3);
        for entry in &cdf.entries {
            assert!(!entry.alias.is_empty());
            assert!(!entry.id.is_empty());
            assert!(!entry.path.path.is_empty());
        }
        assert_eq!(cdf.entries[1].alias, "CertFirmaDigital");
        assert_eq!(cdf.entries[1].path.path, vec![0x50, 0x15, 0x60, 0x06]);
    }

    #[test]
    fn record_missing_mandatory_id_fails() {
        // CommonCertificateAttributes without its iD.
        let broken = seq(
            TAG_SEQUENCE,
            &[
                seq(TAG_SEQUENCE, &[Tlv::new(0x0C, b"CertAutenticacion".to_vec())]),
                seq(TAG_SEQUENCE, &[]),
                seq(
                    tag_context(1),
                    &[seq(
                        TAG_SEQUENCE,
                        &[seq(TAG_SEQUENCE, &[Tlv::new(0x04, vec![0x50, 0x15])])],
                    )],
                ),
            ],
        );
        let err = CertDirectory::parse(&broken.to_bytes()).unwrap_err();
        assert!(matches!(err, Error::StructureMismatch { field: "iD" }));
    }

    #[test]
    fn key_entry_with_optionals_absent_still_decodes() {
        let minimal = seq(
            TAG_SEQUENCE,
            &[
                seq(TAG_SEQUENCE, &[Tlv::new(0x0C, b"KprivAutenticacion".to_vec())]),
                seq(TAG_SEQUENCE, &[Tlv::new(0x04, vec![0x01])]),
                seq(
                    tag_context(1),
                    &[seq(
                        TAG_SEQUENCE,
                        &[seq(TAG_SEQUENCE, &[Tlv::new(0x04, vec![0x3F, 0x00, 0x01])])],
                    )],
                ),
            ],
        );
        let entry = KeyEntry::decode(&minimal).unwrap();
        assert_eq!(entry.label, "KprivAutenticacion");
        assert_eq!(entry.key_reference, 0);
        assert_eq!(entry.modulus_bits, None);
    }

    #[test]
    fn key_directory_round() {
        let mut image = Vec::new();
        image.extend_from_slice(
            &key_entry("KprivFirmaDigital", &[0x02], 0x02, &[0x3F, 0x00, 0x02]).to_bytes(),
        );
        let prkdf = KeyDirectory::parse(&image).unwrap();
        assert_eq!(prkdf.entries.len(), 1);
        let k = &prkdf.entries[0];
        assert_eq!(k.key_reference, 0x02);
        assert_eq!(k.modulus_bits, Some(2048));
        assert_eq!(k.path.path, vec![0x3F, 0x00, 0x02]);
    }
}

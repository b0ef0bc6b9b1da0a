//! ICAO Visible Digital Seal for Non-Electronic Documents (VDS-NED).
//!
//! A VDS-NED is a compact binary seal printed on paper documents: a
//! fixed header (magic, version, C40-coded issuing country, certificate
//! reference, two packed dates, feature reference, type category)
//! followed by TLV message fields.

use time::Date;
use tracing::warn;

use crate::asn1::decode_c40;
use crate::tlv::{Tlv, TlvIter};
use crate::{Error, Result};

const MAGIC: u8 = 0xDC;
/// Header length past the magic and version bytes.
const FIXED_FIELDS_LEN: usize = 2 + 6 + 3 + 3 + 1 + 1;

const TAG_MRZ_B: u32 = 0x02;
const TAG_ENTRIES: u32 = 0x03;
const TAG_DURATION: u32 = 0x04;
const TAG_PASSPORT_NUMBER: u32 = 0x05;

/// Decoded seal.
#[derive(Debug, Clone)]
pub struct Vds {
    pub version: u8,
    pub issuing_country: String,
    /// Certificate-authority and certificate reference, format-opaque.
    pub ca_cr: [u8; 6],
    pub document_issue_date: Date,
    pub signature_creation_date: Date,
    pub feature_definition_reference: u8,
    pub type_category: u8,
    pub mrz_b: Option<String>,
    pub entries: Option<u32>,
    pub duration_of_stay: Option<u32>,
    pub passport_number: Option<String>,
}

impl Vds {
    pub fn parse(encoded: &[u8]) -> Result<Self> {
        let [magic, version, rest @ ..] = encoded else {
            return Err(Error::MalformedEncoding("seal shorter than its header"));
        };
        if *magic != MAGIC {
            return Err(Error::MalformedEncoding("bad seal magic byte"));
        }
        // The version byte is stored off by one.
        let version = version.wrapping_add(1);
        if version != 3 && version != 4 {
            return Err(Error::MalformedEncoding("unsupported seal version"));
        }
        if rest.len() < FIXED_FIELDS_LEN {
            return Err(Error::MalformedEncoding("seal header truncated"));
        }

        let issuing_country = decode_c40(&rest[..2])?;
        let mut ca_cr = [0u8; 6];
        ca_cr.copy_from_slice(&rest[2..8]);
        let document_issue_date = packed_date(&rest[8..11])?;
        let signature_creation_date = packed_date(&rest[11..14])?;
        let feature_definition_reference = rest[14];
        let type_category = rest[15];
        if type_category % 2 == 0 {
            return Err(Error::MalformedEncoding("seal type category must be odd"));
        }

        let mut seal = Self {
            version,
            issuing_country,
            ca_cr,
            document_issue_date,
            signature_creation_date,
            feature_definition_reference,
            type_category,
            mrz_b: None,
            entries: None,
            duration_of_stay: None,
            passport_number: None,
        };
        for tlv in TlvIter::new(&rest[FIXED_FIELDS_LEN..]) {
            seal.apply_field(&tlv?)?;
        }
        Ok(seal)
    }

    fn apply_field(&mut self, tlv: &Tlv) -> Result<()> {
        match tlv.tag() {
            TAG_MRZ_B => self.mrz_b = Some(decode_c40(tlv.value())?),
            TAG_ENTRIES => self.entries = Some(be_uint(tlv.value())?),
            TAG_DURATION => self.duration_of_stay = Some(duration_of_stay(tlv.value())?),
            TAG_PASSPORT_NUMBER => self.passport_number = Some(decode_c40(tlv.value())?),
            tag => warn!(tag, "ignoring unknown seal field"),
        }
        Ok(())
    }
}

/// Three bytes whose big-endian value reads as decimal `MMDDYYYY` (the
/// month loses its leading zero below eight digits).
fn packed_date(bytes: &[u8]) -> Result<Date> {
    let packed = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
    let year = packed % 10_000;
    let day = packed / 10_000 % 100;
    let month = packed / 1_000_000;
    let month = u8::try_from(month)
        .ok()
        .and_then(|m| time::Month::try_from(m).ok())
        .ok_or_else(|| Error::DateFormat(format!("bad packed month in {packed}")))?;
    Date::from_calendar_date(year as i32, month, day as u8)
        .map_err(|e| Error::DateFormat(format!("bad packed date {packed}: {e}")))
}

fn be_uint(bytes: &[u8]) -> Result<u32> {
    if bytes.is_empty() || bytes.len() > 4 {
        return Err(Error::MalformedEncoding("integer field must be 1-4 bytes"));
    }
    Ok(bytes.iter().fold(0u32, |acc, b| acc << 8 | u32::from(*b)))
}

/// The duration field's byte order depends on its width: one and two
/// byte values are big-endian, three-byte values little-endian. Longer
/// values take their first four bytes big-endian.
fn duration_of_stay(bytes: &[u8]) -> Result<u32> {
    match bytes.len() {
        1 | 2 => be_uint(bytes),
        3 => Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0])),
        n if n >= 4 => be_uint(&bytes[..4]),
        _ => Err(Error::MalformedEncoding("empty duration field")),
    }
}

//! Primitive leaf decoders. Each owns exactly one invariant.

use time::{Date, Month};

use super::Asn1Decode;
use crate::tlv::Tlv;
use crate::{Error, Result};

/// OCTET STRING: bytes pass through unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OctetString(Vec<u8>);

impl OctetString {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl Asn1Decode for OctetString {
    const TAG: u32 = 0x04;

    fn decode(tlv: &Tlv) -> Result<Self> {
        Ok(Self(tlv.value().to_vec()))
    }
}

/// INTEGER, restricted to the magnitudes card directories actually use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerInteger(i64);

impl DerInteger {
    pub fn value(&self) -> i64 {
        self.0
    }
}

impl Asn1Decode for DerInteger {
    const TAG: u32 = 0x02;

    fn decode(tlv: &Tlv) -> Result<Self> {
        let bytes = tlv.value();
        if bytes.is_empty() || bytes.len() > 8 {
            return Err(Error::MalformedEncoding("integer of unsupported width"));
        }
        // Sign-extend from the first content octet.
        let mut v: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
        for &b in bytes {
            v = v << 8 | i64::from(b);
        }
        Ok(Self(v))
    }
}

/// UTF8String. Also accepts PrintableString content since some card
/// profiles mix the two for labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utf8String(String);

impl Utf8String {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Asn1Decode for Utf8String {
    const TAG: u32 = 0x0C;

    fn decode(tlv: &Tlv) -> Result<Self> {
        let s = std::str::from_utf8(tlv.value())
            .map_err(|_| Error::MalformedEncoding("string is not valid UTF-8"))?;
        Ok(Self(s.trim_end().to_owned()))
    }
}

/// GeneralizedTime restricted to its `YYYYMMDD` prefix, validated against
/// the real calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Asn1Date(Date);

impl Asn1Date {
    pub fn date(&self) -> Date {
        self.0
    }

    /// Parse an 8-digit `YYYYMMDD` ASCII string.
    pub fn from_ascii(text: &[u8]) -> Result<Self> {
        let digits = text.get(..8).ok_or_else(|| {
            Error::DateFormat(format!("expected 8 digits, got {} bytes", text.len()))
        })?;
        if !digits.iter().all(u8::is_ascii_digit) {
            return Err(Error::DateFormat(
                String::from_utf8_lossy(digits).into_owned(),
            ));
        }
        let num = |r: std::ops::Range<usize>| -> i32 {
            digits[r].iter().fold(0, |acc, d| acc * 10 + i32::from(d - b'0'))
        };
        let month = Month::try_from(num(4..6) as u8)
            .map_err(|_| Error::DateFormat(String::from_utf8_lossy(digits).into_owned()))?;
        let date = Date::from_calendar_date(num(0..4), month, num(6..8) as u8)
            .map_err(|_| Error::DateFormat(String::from_utf8_lossy(digits).into_owned()))?;
        Ok(Self(date))
    }
}

impl Asn1Decode for Asn1Date {
    const TAG: u32 = 0x18;

    fn decode(tlv: &Tlv) -> Result<Self> {
        Self::from_ascii(tlv.value())
    }
}

/// Decode a C40-packed byte string (the five-bit ternary alphabet used by
/// MRZ and visible-digital-seal fields) into ASCII.
///
/// Each big-endian 16-bit word packs three code points as
/// `c1*1600 + c2*40 + c3 + 1`; codes 3..=39 map onto space, digits and
/// capital letters. A `0xFE` marker byte carries one trailing ASCII
/// character as `value + 1`.
pub fn decode_c40(data: &[u8]) -> Result<String> {
    let mut out = String::with_capacity(data.len() / 2 * 3);
    for pair in data.chunks(2) {
        if pair[0] == 0xFE {
            let ascii = pair
                .get(1)
                .ok_or(Error::MalformedEncoding("dangling C40 marker byte"))?
                .checked_sub(1)
                .ok_or(Error::MalformedEncoding("invalid C40 trailing character"))?;
            out.push(char::from(ascii));
            continue;
        }
        if pair.len() != 2 {
            return Err(Error::MalformedEncoding("odd C40 byte string"));
        }
        let word = u16::from_be_bytes([pair[0], pair[1]]);
        let v = word
            .checked_sub(1)
            .ok_or(Error::MalformedEncoding("C40 word out of range"))?;
        for code in [v / 1600, v / 40 % 40, v % 40] {
            out.push(c40_char(code as u8)?);
        }
    }
    Ok(out)
}

fn c40_char(code: u8) -> Result<char> {
    match code {
        3 => Ok(' '),
        4..=13 => Ok(char::from(b'0' + code - 4)),
        14..=39 => Ok(char::from(b'A' + code - 14)),
        // 0..=2 are DataMatrix shift codes, unused by MRZ/VDS fields.
        _ => Err(Error::MalformedEncoding("C40 code outside alphabet")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_leaf_accepts_valid_calendar_date() {
        let d = Asn1Date::from_ascii(b"20230615").unwrap();
        assert_eq!(
            d.date(),
            Date::from_calendar_date(2023, Month::June, 15).unwrap()
        );
    }

    #[test]
    fn date_leaf_rejects_non_digits() {
        let err = Asn1Date::from_ascii(b"2023AB15").unwrap_err();
        assert!(matches!(err, Error::DateFormat(_)));
    }

    #[test]
    fn date_leaf_rejects_impossible_date() {
        let err = Asn1Date::from_ascii(b"20230230").unwrap_err();
        assert!(matches!(err, Error::DateFormat(_)));
    }

    #[test]
    fn c40_decodes_country_code() {
        // "UTO": U=34, T=33, O=28 -> (34*1600 + 33*40 + 28) + 1 = 55749
        let word = (34u16 * 1600 + 33 * 40 + 28) + 1;
        let decoded = decode_c40(&word.to_be_bytes()).unwrap();
        assert_eq!(decoded, "UTO");
    }

    #[test]
    fn c40_rejects_shift_codes() {
        // c1 = 0 (a shift code) must fail.
        let word = (0u16 * 1600 + 4 * 40 + 4) + 1;
        assert!(decode_c40(&word.to_be_bytes()).is_err());
    }

    #[test]
    fn negative_integer_sign_extends() {
        let tlv = Tlv::new(0x02, vec![0xFF, 0x7F]);
        assert_eq!(DerInteger::decode(&tlv).unwrap().value(), -129);
    }
}

//! BER-TLV codec.
//!
//! Everything the card returns, directories, certificates, secure-messaging
//! data objects, is tag-length-value encoded. The codec treats the tag as an
//! opaque integer; BER classing bits are only interpreted by the structure
//! engine on top.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Bit marking a constructed (as opposed to primitive) tag in the first
/// tag octet.
const CONSTRUCTED_BIT: u8 = 0x20;

/// A single tag-length-value triple. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    tag: u32,
    value: Bytes,
}

impl Tlv {
    /// Build a TLV from its components.
    pub fn new(tag: u32, value: impl Into<Bytes>) -> Self {
        Self {
            tag,
            value: value.into(),
        }
    }

    /// Parse one TLV from the start of `input`, returning it together with
    /// the number of bytes consumed.
    pub fn parse(input: &[u8]) -> Result<(Self, usize)> {
        let (tag, tag_len) = parse_tag(input)?;
        let (len, len_len) = parse_length(&input[tag_len..])?;
        let header = tag_len + len_len;
        if input.len() - header < len {
            return Err(Error::MalformedEncoding(
                "declared length exceeds remaining buffer",
            ));
        }
        let value = Bytes::copy_from_slice(&input[header..header + len]);
        Ok((Self { tag, value }, header + len))
    }

    /// Parse a buffer that must contain exactly one TLV.
    pub fn parse_single(input: &[u8]) -> Result<Self> {
        let (tlv, used) = Self::parse(input)?;
        if used != input.len() {
            return Err(Error::MalformedEncoding("trailing bytes after TLV"));
        }
        Ok(tlv)
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn into_value(self) -> Bytes {
        self.value
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Whether the first tag octet carries the constructed bit.
    pub fn is_constructed(&self) -> bool {
        first_tag_octet(self.tag) & CONSTRUCTED_BIT != 0
    }

    /// Serialize as `tag || length || value`. Exact inverse of [`Tlv::parse`]
    /// for any value shorter than 2^32 bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(6 + self.value.len());
        put_tag(&mut out, self.tag);
        put_length(&mut out, self.value.len());
        out.put_slice(&self.value);
        out.freeze()
    }
}

fn first_tag_octet(tag: u32) -> u8 {
    let mut t = tag;
    while t > 0xFF {
        t >>= 8;
    }
    t as u8
}

fn parse_tag(input: &[u8]) -> Result<(u32, usize)> {
    let first = *input
        .first()
        .ok_or(Error::MalformedEncoding("empty buffer"))?;
    // Low five bits all set means the tag number continues in later octets.
    if first & 0x1F != 0x1F {
        return Ok((u32::from(first), 1));
    }
    let mut tag = u32::from(first);
    for (i, &b) in input[1..].iter().enumerate() {
        if i >= 3 {
            return Err(Error::MalformedEncoding("tag longer than four octets"));
        }
        tag = tag << 8 | u32::from(b);
        if b & 0x80 == 0 {
            return Ok((tag, i + 2));
        }
    }
    Err(Error::MalformedEncoding("truncated multi-octet tag"))
}

fn parse_length(input: &[u8]) -> Result<(usize, usize)> {
    let first = *input
        .first()
        .ok_or(Error::MalformedEncoding("missing length octet"))?;
    if first < 0x80 {
        return Ok((usize::from(first), 1));
    }
    let count = usize::from(first & 0x7F);
    if count == 0 || count > 4 {
        // 0x80 is the indefinite form, which DER forbids.
        return Err(Error::MalformedEncoding("invalid length prefix"));
    }
    if input.len() < 1 + count {
        return Err(Error::MalformedEncoding("truncated long-form length"));
    }
    let mut len = 0usize;
    for &b in &input[1..=count] {
        len = len << 8 | usize::from(b);
    }
    Ok((len, 1 + count))
}

fn put_tag(out: &mut BytesMut, tag: u32) {
    match tag {
        0..=0xFF => out.put_u8(tag as u8),
        0x100..=0xFF_FF => out.put_u16(tag as u16),
        0x1_00_00..=0xFF_FF_FF => {
            out.put_u8((tag >> 16) as u8);
            out.put_u16(tag as u16);
        }
        _ => out.put_u32(tag),
    }
}

fn put_length(out: &mut BytesMut, len: usize) {
    match len {
        0..=0x7F => out.put_u8(len as u8),
        0x80..=0xFF => {
            out.put_u8(0x81);
            out.put_u8(len as u8);
        }
        0x100..=0xFF_FF => {
            out.put_u8(0x82);
            out.put_u16(len as u16);
        }
        0x1_00_00..=0xFF_FF_FF => {
            out.put_u8(0x83);
            out.put_u8((len >> 16) as u8);
            out.put_u16(len as u16);
        }
        _ => {
            out.put_u8(0x84);
            out.put_u32(len as u32);
        }
    }
}

/// Iterator over a flat buffer of sibling TLVs.
///
/// On-card files are padded with `0x00` or `0xFF`; a padding byte in tag
/// position ends the iteration instead of failing it.
pub struct TlvIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> TlvIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

impl Iterator for TlvIter<'_> {
    type Item = Result<Tlv>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.buf[self.pos..];
        match rest.first() {
            None | Some(0x00) | Some(0xFF) => return None,
            _ => {}
        }
        match Tlv::parse(rest) {
            Ok((tlv, used)) => {
                self.pos += used;
                Some(Ok(tlv))
            }
            Err(e) => {
                self.pos = self.buf.len();
                Some(Err(e))
            }
        }
    }
}

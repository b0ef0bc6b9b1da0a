//! Generic ASN.1 structure engine.
//!
//! Card directory files are DER SEQUENCEs whose elements are partly
//! optional. Each record type walks its outer value with a
//! [`SequenceReader`], declaring elements in order as required or optional;
//! an optional element is consumed only when the next TLV carries its
//! expected tag, otherwise the same TLV is retried against the following
//! element. Leftover bytes are preserved for forward compatibility but not
//! validated.

mod primitives;
pub mod pkcs15;

pub use primitives::{decode_c40, Asn1Date, DerInteger, OctetString, Utf8String};

use crate::tlv::Tlv;
use crate::{Error, Result};

/// A leaf or record type that decodes from one TLV.
pub trait Asn1Decode: Sized {
    /// Default tag this type expects when no override is given.
    const TAG: u32;

    /// Decode from a TLV whose tag has already been matched.
    fn decode(tlv: &Tlv) -> Result<Self>;
}

/// Ordered reader over the flat value buffer of an outer SEQUENCE.
pub struct SequenceReader<'a> {
    buf: &'a [u8],
    pos: usize,
    /// TLV parsed but not yet consumed by any element.
    pending: Option<(Tlv, usize)>,
}

impl<'a> SequenceReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            pending: None,
        }
    }

    /// Open the value of `outer`, checking its tag first.
    pub fn open(outer: &'a Tlv, tag: u32, field: &'static str) -> Result<Self> {
        if outer.tag() != tag {
            return Err(Error::StructureMismatch { field });
        }
        Ok(Self::new(outer.value()))
    }

    fn peek(&mut self) -> Result<Option<&Tlv>> {
        if self.pending.is_none() {
            if self.pos >= self.buf.len() {
                return Ok(None);
            }
            let (tlv, used) = Tlv::parse(&self.buf[self.pos..])?;
            self.pending = Some((tlv, used));
        }
        Ok(self.pending.as_ref().map(|(tlv, _)| tlv))
    }

    /// Consume the pending TLV when `pred` accepts it.
    fn take_if(&mut self, pred: impl FnOnce(&Tlv) -> bool) -> Result<Option<Tlv>> {
        match self.peek()? {
            Some(tlv) if pred(tlv) => {}
            _ => return Ok(None),
        }
        Ok(self.pending.take().map(|(tlv, used)| {
            self.pos += used;
            tlv
        }))
    }

    /// Decode the next element as `T`, failing when the buffer is exhausted
    /// or the tag does not match.
    pub fn required<T: Asn1Decode>(&mut self, field: &'static str) -> Result<T> {
        self.required_tagged(T::TAG, field)
    }

    /// Like [`SequenceReader::required`] with the expected tag overridden,
    /// for context-specific renumbering.
    pub fn required_tagged<T: Asn1Decode>(&mut self, tag: u32, field: &'static str) -> Result<T> {
        match self.take_if(|tlv| tlv.tag() == tag)? {
            Some(tlv) => T::decode(&tlv),
            None => Err(Error::StructureMismatch { field }),
        }
    }

    /// Decode the next element as `T` if its tag matches, recording it
    /// absent otherwise.
    pub fn optional<T: Asn1Decode>(&mut self) -> Result<Option<T>> {
        self.optional_tagged(T::TAG)
    }

    /// Like [`SequenceReader::optional`] with the expected tag overridden.
    pub fn optional_tagged<T: Asn1Decode>(&mut self, tag: u32) -> Result<Option<T>> {
        match self.take_if(|tlv| tlv.tag() == tag)? {
            Some(tlv) => T::decode(&tlv).map(Some),
            None => Ok(None),
        }
    }

    /// Take the raw TLV of the next element regardless of type.
    pub fn raw(&mut self, field: &'static str) -> Result<Tlv> {
        match self.take_if(|_| true)? {
            Some(tlv) => Ok(tlv),
            None => Err(Error::StructureMismatch { field }),
        }
    }

    /// Bytes after the last consumed element.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn is_exhausted(&mut self) -> bool {
        self.pending.is_none() && self.pos >= self.buf.len()
    }
}

/// Universal SEQUENCE tag (constructed).
pub const TAG_SEQUENCE: u32 = 0x30;
/// Context-specific constructed tag `[n]`.
pub const fn tag_context(n: u32) -> u32 {
    0xA0 | n
}

//! Command and response APDU frames.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Command frame: class, instruction, two parameters, optional data and
/// optional expected length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Option<Bytes>,
    le: Option<u16>,
}

impl Command {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Expected response length; `0` encodes "up to 256 bytes".
    pub fn with_le(mut self, le: u16) -> Self {
        self.le = Some(le);
        self
    }

    pub fn cla(&self) -> u8 {
        self.cla
    }

    pub fn ins(&self) -> u8 {
        self.ins
    }

    pub fn p1(&self) -> u8 {
        self.p1
    }

    pub fn p2(&self) -> u8 {
        self.p2
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn le(&self) -> Option<u16> {
        self.le
    }

    /// Header and body as sent on the wire (short APDU forms).
    pub fn to_bytes(&self) -> Bytes {
        let data_len = self.data.as_ref().map_or(0, |d| d.len());
        let mut out = BytesMut::with_capacity(6 + data_len);
        out.put_u8(self.cla);
        out.put_u8(self.ins);
        out.put_u8(self.p1);
        out.put_u8(self.p2);
        if let Some(data) = &self.data {
            debug_assert!(data.len() <= 255, "extended-length APDUs not used");
            out.put_u8(data.len() as u8);
            out.put_slice(data);
        }
        if let Some(le) = self.le {
            out.put_u8(if le >= 256 { 0 } else { le as u8 });
        }
        out.freeze()
    }
}

/// Two-byte status word trailing every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusWord {
    pub sw1: u8,
    pub sw2: u8,
}

impl StatusWord {
    pub const OK: Self = Self::new(0x90, 0x00);
    /// A wireless (NFC) channel that has gone away answers with an
    /// all-zero status word.
    pub const LOST_CHANNEL: Self = Self::new(0x00, 0x00);
    pub const AUTH_METHOD_LOCKED: Self = Self::new(0x69, 0x83);
    pub const FILE_NOT_FOUND: Self = Self::new(0x6A, 0x82);
    pub const EOF_REACHED: Self = Self::new(0x62, 0x82);

    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    pub const fn is_ok(self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }

    /// `0x63Cn`: wrong PIN with `n` verification attempts remaining.
    pub fn retries_left(self) -> Option<u8> {
        (self.sw1 == 0x63 && self.sw2 & 0xF0 == 0xC0).then_some(self.sw2 & 0x0F)
    }

    pub fn as_u16(self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.sw1, self.sw2)
    }
}

/// Response frame: payload plus status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    data: Bytes,
    sw: StatusWord,
}

impl Response {
    pub fn new(data: impl Into<Bytes>, sw: StatusWord) -> Self {
        Self {
            data: data.into(),
            sw,
        }
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < 2 {
            return Err(Error::transport("response shorter than a status word"));
        }
        let (data, sw) = raw.split_at(raw.len() - 2);
        Ok(Self {
            data: Bytes::copy_from_slice(data),
            sw: StatusWord::new(sw[0], sw[1]),
        })
    }

    pub fn is_ok(&self) -> bool {
        self.sw.is_ok()
    }

    pub fn sw(&self) -> StatusWord {
        self.sw
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.data.len() + 2);
        out.put_slice(&self.data);
        out.put_u8(self.sw.sw1);
        out.put_u8(self.sw.sw2);
        out.freeze()
    }

    /// Map the known status words onto the error taxonomy; `operation`
    /// labels the failure for diagnosis.
    pub fn check(self, operation: &'static str) -> Result<Self> {
        if self.sw.is_ok() {
            return Ok(self);
        }
        if self.sw == StatusWord::LOST_CHANNEL {
            return Err(Error::LostChannel);
        }
        if self.sw == StatusWord::AUTH_METHOD_LOCKED {
            return Err(Error::AuthenticationLocked);
        }
        if self.sw == StatusWord::FILE_NOT_FOUND {
            return Err(Error::FileNotFound);
        }
        if let Some(retries_left) = self.sw.retries_left() {
            return Err(Error::BadPin { retries_left });
        }
        Err(Error::CardCommand {
            operation,
            sw: self.sw,
        })
    }
}

//! File selection and reading.

use super::{CLA_ISO, CLA_PROPRIETARY};
use crate::apdu::Command;

/// SELECT by two-byte file identifier.
pub fn select_by_id(id: [u8; 2]) -> Command {
    Command::new(CLA_ISO, 0xA4, 0x00, 0x00).with_data(id.to_vec())
}

/// SELECT by DF name (used for the master file, selected by the literal
/// name `Master.File` on this card family).
pub fn select_by_name(name: &str) -> Command {
    Command::new(CLA_ISO, 0xA4, 0x04, 0x00).with_data(name.as_bytes().to_vec())
}

/// READ BINARY of up to `len` bytes at `offset` in the selected file.
pub fn read_binary(offset: u16, len: u8) -> Command {
    let [p1, p2] = offset.to_be_bytes();
    Command::new(CLA_ISO, 0xB0, p1, p2).with_le(u16::from(len))
}

/// Proprietary chip-info inquiry returning the card serial number.
pub fn get_chip_info() -> Command {
    Command::new(CLA_PROPRIETARY, 0xB8, 0x00, 0x00).with_le(0x07)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_frames() {
        assert_eq!(
            select_by_id([0x60, 0x1F]).to_bytes().as_ref(),
            &[0x00, 0xA4, 0x00, 0x00, 0x02, 0x60, 0x1F]
        );
        let named = select_by_name("Master.File").to_bytes();
        assert_eq!(&named[..5], &[0x00, 0xA4, 0x04, 0x00, 0x0B]);
    }

    #[test]
    fn read_binary_encodes_offset() {
        assert_eq!(
            read_binary(0x01FF, 0xEF).to_bytes().as_ref(),
            &[0x00, 0xB0, 0x01, 0xFF, 0xEF]
        );
    }
}

//! Cardholder verification.

use super::CLA_ISO;
use crate::apdu::Command;

/// VERIFY against the main PIN.
pub fn verify_pin(pin: &[u8]) -> Command {
    Command::new(CLA_ISO, 0x20, 0x00, 0x00).with_data(pin.to_vec())
}

/// VERIFY without a body: the card answers `63Cn` carrying the remaining
/// retry count without spending an attempt.
pub fn retries_left() -> Command {
    Command::new(CLA_ISO, 0x20, 0x00, 0x00)
}

/// CHANGE REFERENCE DATA with the old and new PIN values concatenated.
pub fn change_pin(old_pin: &[u8], new_pin: &[u8]) -> Command {
    let mut body = Vec::with_capacity(old_pin.len() + new_pin.len());
    body.extend_from_slice(old_pin);
    body.extend_from_slice(new_pin);
    Command::new(CLA_ISO, 0x24, 0x00, 0x00).with_data(body)
}

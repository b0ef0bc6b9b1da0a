//! APDU command builders for the ISO 7816-4/-8 subset the card dialect
//! uses. Builders only shape frames; transmission and status handling stay
//! with the callers.

pub mod auth;
pub mod file;
pub mod pin;
pub mod sign;

/// Interindustry class byte.
pub const CLA_ISO: u8 = 0x00;
/// Proprietary class byte used by the chip-info inquiry.
pub const CLA_PROPRIETARY: u8 = 0x90;

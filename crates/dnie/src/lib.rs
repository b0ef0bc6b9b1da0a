//! Protocol stack for Spanish-style eID smart cards.
//!
//! The crate turns a raw command/response channel to an identity
//! document into safe structured operations, layer by layer:
//!
//! - [`tlv`] and [`asn1`] decode the card's BER/DER file images into
//!   typed records;
//! - [`apdu`] and [`transport`] frame commands and carry them over a
//!   physical driver (a PC/SC implementation ships behind the `pcsc`
//!   feature);
//! - [`secure`] establishes and runs the encrypted, MAC-protected
//!   channel, by certificate chain or by shared secret;
//! - [`card`] sequences the document protocols on top: directory
//!   discovery, PIN verification with retry accounting, signing with
//!   bounded lost-channel recovery, and PIN change.
//!
//! ```no_run
//! use dnie_card::card::{EidCard, KeyUsage, SessionOptions, StaticPin};
//! use dnie_card::crypto::DigestAlgorithm;
//! use dnie_card::transport::CardTransport;
//!
//! fn sign_hello(transport: impl CardTransport) -> dnie_card::Result<Vec<u8>> {
//!     let mut card = EidCard::new(
//!         transport,
//!         Box::new(StaticPin::new("1234")),
//!         SessionOptions::default(),
//!     );
//!     card.connect()?;
//!     let key = card.private_key(KeyUsage::Signing)?;
//!     card.sign(&key, b"hello", DigestAlgorithm::Sha256)
//! }
//! ```

pub mod apdu;
pub mod asn1;
pub mod card;
pub mod commands;
pub mod crypto;
mod error;
pub mod icao;
pub mod secure;
pub mod tlv;
pub mod transport;

pub use error::{Error, Result};

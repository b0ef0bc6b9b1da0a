//! ICAO machine-readable-document structures that travel outside the
//! card's file system.

mod vds;

pub use vds::Vds;

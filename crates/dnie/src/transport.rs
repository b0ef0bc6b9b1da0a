//! Transport abstraction over a physical or logical card connection.
//!
//! One instance owns one connection: `transmit` is synchronous and must
//! only be called while the channel is open, and no concurrent calls are
//! permitted. Physical drivers live behind this trait; the crate never
//! talks to hardware directly.

use crate::apdu::{Command, Response};
use crate::Result;

/// Byte-oriented command/response channel to a card.
pub trait CardTransport {
    /// Open the underlying connection. Opening an open transport is a
    /// no-op.
    fn open(&mut self) -> Result<()>;

    /// Close the underlying connection.
    fn close(&mut self) -> Result<()>;

    /// Cold-reset the connection, dropping any card-side session state.
    fn reset(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Send one command and block for its response. Hard I/O faults
    /// surface as [`crate::Error::Transport`]; status-word interpretation
    /// belongs to the callers.
    fn transmit(&mut self, command: &Command) -> Result<Response>;
}

#[cfg(feature = "pcsc")]
pub use self::pcsc_transport::PcscTransport;

#[cfg(feature = "pcsc")]
mod pcsc_transport {
    use pcsc::{Card, Context, Protocols, Scope, ShareMode};
    use tracing::debug;

    use super::CardTransport;
    use crate::apdu::{Command, Response};
    use crate::{Error, Result};

    /// PC/SC driver for contact readers.
    pub struct PcscTransport {
        context: Context,
        reader: std::ffi::CString,
        card: Option<Card>,
    }

    impl PcscTransport {
        /// Connect to the first reader reported by the PC/SC daemon.
        pub fn first_reader() -> Result<Self> {
            let context = Context::establish(Scope::User)
                .map_err(|e| Error::transport(format!("PC/SC context: {e}")))?;
            let mut buf = vec![0u8; 2048];
            let reader = context
                .list_readers(&mut buf)
                .map_err(|e| Error::transport(format!("listing readers: {e}")))?
                .next()
                .ok_or_else(|| Error::transport("no PC/SC reader present"))?
                .to_owned();
            debug!(reader = ?reader, "using PC/SC reader");
            Ok(Self {
                context,
                reader,
                card: None,
            })
        }
    }

    impl CardTransport for PcscTransport {
        fn open(&mut self) -> Result<()> {
            if self.card.is_some() {
                return Ok(());
            }
            let card = self
                .context
                .connect(&self.reader, ShareMode::Exclusive, Protocols::ANY)
                .map_err(|e| Error::transport(format!("connecting to card: {e}")))?;
            self.card = Some(card);
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.card = None;
            Ok(())
        }

        fn reset(&mut self) -> Result<()> {
            self.close()?;
            self.open()
        }

        fn is_open(&self) -> bool {
            self.card.is_some()
        }

        fn transmit(&mut self, command: &Command) -> Result<Response> {
            let card = self
                .card
                .as_mut()
                .ok_or_else(|| Error::transport("transmit on a closed transport"))?;
            let mut buf = [0u8; 4096];
            let raw = card
                .transmit(&command.to_bytes(), &mut buf)
                .map_err(|e| Error::transport(format!("transmit: {e}")))?;
            Response::from_bytes(raw)
        }
    }
}

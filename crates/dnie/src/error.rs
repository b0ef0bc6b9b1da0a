use thiserror::Error;

use crate::apdu::StatusWord;

/// Result type for card operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for card operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bytes that do not form a valid TLV encoding. Never retried.
    #[error("malformed TLV encoding ({0})")]
    MalformedEncoding(&'static str),

    /// A mandatory field was absent or carried an unexpected tag.
    #[error("structure mismatch decoding field `{field}`")]
    StructureMismatch { field: &'static str },

    /// A date field was not an 8-digit `YYYYMMDD` string or named an
    /// impossible calendar date.
    #[error("invalid date field: {0}")]
    DateFormat(String),

    /// Hard I/O fault at the transport boundary.
    #[error("transport fault: {0}")]
    Transport(String),

    /// The secured channel to the card was lost. Recoverable: the session
    /// controller reconnects once within its retry budget.
    #[error("secure channel lost")]
    LostChannel,

    /// Handshake or message-integrity failure on the secure channel.
    #[error("secure channel failure: {0}")]
    SecureChannel(String),

    /// PIN verification failed; carries the retries the card reported
    /// after the failed attempt.
    #[error("wrong PIN ({retries_left} retries left)")]
    BadPin { retries_left: u8 },

    /// The card has locked this authentication method. Terminal state.
    #[error("authentication method locked")]
    AuthenticationLocked,

    /// The user declined the signature confirmation dialog.
    #[error("signature authorization denied")]
    AuthorizationDenied,

    /// The requested file does not exist on the card.
    #[error("file not found on card")]
    FileNotFound,

    /// The card rejected a command with a status word no layer maps to a
    /// more specific error.
    #[error("card returned status {sw} for {operation}")]
    CardCommand {
        operation: &'static str,
        sw: StatusWord,
    },

    /// No configured way to obtain a PIN, or the source refused.
    #[error("no PIN source available")]
    PinSourceUnavailable,

    /// The user cancelled a credential prompt.
    #[error("operation cancelled by user")]
    Cancelled,

    /// Failure inside the cryptographic helper.
    #[error("cryptographic helper failure: {0}")]
    Crypto(String),
}

impl Error {
    pub(crate) fn secure_channel(context: impl Into<String>) -> Self {
        Self::SecureChannel(context.into())
    }

    pub(crate) fn transport(context: impl Into<String>) -> Self {
        Self::Transport(context.into())
    }

    pub(crate) fn crypto(context: impl Into<String>) -> Self {
        Self::Crypto(context.into())
    }
}

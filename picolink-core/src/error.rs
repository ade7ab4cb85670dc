use core::fmt;

/// Error codes observable on the public PicoLink surface.
///
/// Success is expressed as `Ok(())`; everything here is a failure. Codes
/// prefixed with `Msg` correspond to per-message validation outcomes of the
/// receive path and are never surfaced from public client operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    GenericFailure,

    InvalidArg,

    InvalidSize,

    NotFound,

    NotSupported,

    Timeout,

    TooManyFailedAttempts,

    NoGateway,

    MsgDupId,

    MsgInvalidTs,

    MsgProcessingFailed,

    MsgUnknownSender,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::GenericFailure => write!(f, "Generic failure"),
            Error::InvalidArg => write!(f, "Invalid argument"),
            Error::InvalidSize => write!(f, "Invalid size"),
            Error::NotFound => write!(f, "Not found"),
            Error::NotSupported => write!(f, "Not supported"),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::TooManyFailedAttempts => write!(f, "Too many failed attempts"),
            Error::NoGateway => write!(f, "No gateway"),
            Error::MsgDupId => write!(f, "Duplicate message ID"),
            Error::MsgInvalidTs => write!(f, "Invalid message timestamp"),
            Error::MsgProcessingFailed => write!(f, "Message processing failed"),
            Error::MsgUnknownSender => write!(f, "Unknown message sender"),
        }
    }
}

impl core::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

use std::{error, fmt, io};

/// Errors surfaced to callers of the transfer engine. Programmer/protocol
/// errors the spec calls fatal (an invalid interval argument, a hash
/// contradiction, re-closing a handle) are not represented here -- those
/// panic at the call site instead of being returned.
#[derive(Debug)]
pub enum Error {
    /// A blocking `read` could not be satisfied because the fetcher(s)
    /// responsible for the requested range gave up: a peer stream open
    /// failure, a mid-transfer error, or a storage write failure cleared
    /// the range from `want` before it was ever covered by `have`.
    FetcherGaveUp,
    /// The underlying storage backend failed.
    IoError(io::Error),
    /// Opening a peer's content stream failed.
    PeerStreamError(Box<dyn error::Error + Send + Sync>),
    /// Could not establish an orchestrated-mode session; the caller
    /// remains in simple mode.
    OrchestrationError(Box<dyn error::Error + Send + Sync>),
    /// A peer name was not of the form `user@circle`.
    InvalidPeerName(String),
    /// Failed to send on an internal channel (the receiving thread is
    /// gone, which should not happen while the Transfer that owns it is
    /// alive).
    SendError,
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FetcherGaveUp => write!(f, "fetcher admitted failure for requested range"),
            Self::IoError(err) => err.fmt(f),
            Self::PeerStreamError(err) => write!(f, "peer stream error: {err}"),
            Self::OrchestrationError(err) => write!(f, "orchestration error: {err}"),
            Self::InvalidPeerName(name) => {
                write!(f, "peer name {name:?} is not of the form user@circle")
            }
            Self::SendError => write!(f, "failed to send into a channel"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IoError(err)
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for Error {
    fn from(_: crossbeam_channel::SendError<T>) -> Self {
        Error::SendError
    }
}

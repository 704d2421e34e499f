use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by bus operations.
///
/// The kinds map one-to-one onto OS error codes when the crate is driven
/// from a device/transport layer; inside the crate they are plain values.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("permission denied")]
    PermissionDenied,
    #[error("already exists")]
    AlreadyExists,
    #[error("no such name or connection")]
    NotFound,
    #[error("destination is only an activator")]
    AddressNotAvailable,
    #[error("connection is shutting down")]
    ConnectionReset,
    #[error("peer disconnected while a reply was pending")]
    BrokenPipe,
    #[error("queue or quota exhausted")]
    NoBufferSpace,
    #[error("too many pending requests")]
    TooManyLinks,
    #[error("receive queue is not empty")]
    ResourceBusy,
    #[error("connection already disconnected")]
    AlreadyFinished,
    #[error("wait interrupted")]
    Interrupted,
    #[error("request canceled")]
    Canceled,
    #[error("reply deadline elapsed")]
    TimedOut,
    #[error("destination does not accept file descriptors")]
    CommunicationError,
    #[error("bus or endpoint was torn down")]
    Shutdown,
    #[error("destination name and id refer to different connections")]
    ChangedIdentity,
    #[error("no message queued")]
    WouldBlock,
    #[error("no message queued at or below the requested priority")]
    NoMessage,
    #[error("too many file descriptors")]
    TooManyOpenFiles,
    #[error("too many message items")]
    ArgumentListTooLong,
    #[error("operation not supported by this connection kind")]
    NotSupported,
}

use std::io;

/// The error taxonomy shared by every asynchronous operation in the crate.
///
/// Synchronous call sites get the intake disposition (`Ok`, `WouldBlock`,
/// `Eof`, ...) as the `Err` variant of a `Result`; asynchronous callbacks
/// receive the same enum as their final outcome. A single operation yields
/// at most one of these.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transient: the operation could not make progress right now, but a
    /// later retry may succeed. Never reported to a callback; it is a
    /// signal to the *caller* to retry.
    #[error("would block")]
    WouldBlock,

    /// Terminal on the affected direction: the peer, or a local shutdown,
    /// ended the stream.
    #[error("end of file")]
    Eof,

    /// User-initiated or deadline-triggered abort of a pending operation.
    #[error("operation cancelled")]
    Cancelled,

    /// A deadline elapsed before the operation completed. Semantically
    /// equivalent to `Cancelled`, reported separately so callers can tell
    /// the two apart.
    #[error("operation timed out")]
    Timeout,

    /// Precondition violation. Never retried.
    #[error("invalid operation: {0}")]
    Invalid(&'static str),

    /// The peer rejected a handshake, or the operation is forbidden by
    /// policy.
    #[error("not authorized")]
    NotAuthorized,

    #[error("address in use")]
    AddressInUse(#[source] io::Error),

    #[error("address not available")]
    AddressNotAvailable(#[source] io::Error),

    #[error("connection refused")]
    ConnectionRefused(#[source] io::Error),

    #[error("connection reset")]
    ConnectionReset(#[source] io::Error),

    #[error("host or network unreachable")]
    Unreachable(#[source] io::Error),

    /// The platform, or the socket's current mode, does not support the
    /// requested operation.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// An invariant the crate relies on was violated. Seeing this means a
    /// bug in this crate, not misuse by the caller.
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),

    /// A bare OS failure not otherwise classified above.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True for errors that stem from the OS call needing a retry; never
    /// true for `Cancelled`/`Timeout`/`Invalid`.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::WouldBlock)
    }

    /// True for errors that latch on a socket: once observed, the socket's
    /// subsequent operations return this same error until `close`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Error::WouldBlock | Error::Invalid(_))
    }

    /// Classify a raw `io::Error` surfaced by a socket syscall into the
    /// taxonomy above. Unrecognized OS errors fall back to `Error::Io`.
    pub fn from_io(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused(err),
            io::ErrorKind::ConnectionReset => Error::ConnectionReset(err),
            io::ErrorKind::AddrInUse => Error::AddressInUse(err),
            io::ErrorKind::AddrNotAvailable => Error::AddressNotAvailable(err),
            io::ErrorKind::TimedOut => Error::Timeout,
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => Error::Eof,
            _ => {
                #[cfg(unix)]
                if let Some(code) = err.raw_os_error() {
                    if code == libc::EHOSTUNREACH || code == libc::ENETUNREACH {
                        return Error::Unreachable(err);
                    }
                }
                Error::Io(err)
            }
        }
    }
}

/// Convenience alias used throughout the crate for fallible synchronous
/// operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_is_retryable_only() {
        assert!(Error::WouldBlock.is_retryable());
        assert!(!Error::Eof.is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn would_block_and_invalid_are_not_terminal() {
        assert!(!Error::WouldBlock.is_terminal());
        assert!(!Error::Invalid("bad").is_terminal());
        assert!(Error::Eof.is_terminal());
        assert!(Error::Cancelled.is_terminal());
    }

    #[test]
    fn from_io_classifies_would_block() {
        let io_err = io::Error::from(io::ErrorKind::WouldBlock);
        assert!(matches!(Error::from_io(io_err), Error::WouldBlock));
    }
}

//! Error taxonomy (spec §7).
//!
//! Every fallible operation in this crate returns [`Error`] rather than a bare
//! OS errno. The taxonomy is intentionally small: it classifies *why* an
//! operation failed so callers (the registry, the acceptor pool) can decide
//! whether to retry, back off, or tear the connection down, without needing
//! to know which kernel API produced the failure.

use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Normalized error kind. See spec.md §7 for the recovery policy attached to
/// each variant.
#[derive(Debug)]
pub enum Error {
    /// Non-blocking op has no progress right now.
    WouldBlock,
    /// A system call was interrupted by a signal.
    Interrupted,
    /// A configured timeout expired (accept wait, poll wait, recv inactivity).
    TimedOut,
    /// Orderly remote shutdown; a read returned 0.
    PeerClosed,
    /// Write attempted against a remote that has already closed.
    BrokenPipe,
    /// File table exhausted or memory pressure reported by the kernel.
    ResourceExhausted,
    /// Bad address, bad descriptor, or other caller error.
    InvalidArgument,
    /// Anything else, carrying the raw OS error code when the platform
    /// provided one.
    Os { code: i32, source: io::Error },
}

impl Error {
    /// Classify a raw OS error into a taxonomy kind. Call sites capture the
    /// error immediately after a failing syscall; nothing re-reads a
    /// thread-local `errno` after control has left the stack (spec.md §9).
    pub fn from_io(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::Interrupted => Error::Interrupted,
            io::ErrorKind::TimedOut => Error::TimedOut,
            io::ErrorKind::BrokenPipe => Error::BrokenPipe,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Error::InvalidArgument,
            _ => match err.raw_os_error() {
                Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS)
                | Some(libc::ENOMEM) => Error::ResourceExhausted,
                Some(code) => Error::Os { code, source: err },
                None => Error::Os { code: 0, source: err },
            },
        }
    }

    /// True for errors a caller should treat as transient and simply retry
    /// on the next readiness cycle (spec.md §8, property 6).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::WouldBlock | Error::Interrupted | Error::TimedOut)
    }

    /// True for "too many links" / resource-exhaustion conditions that the
    /// acceptor pipeline answers with an overload backoff.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Error::ResourceExhausted)
    }

    /// The raw OS error code, when one is known (0 when unavailable, as
    /// spec.md §4.2 allows for the notifier's Error records).
    pub fn native_code(&self) -> i32 {
        match self {
            Error::Os { code, .. } => *code,
            Error::BrokenPipe => libc::EPIPE,
            Error::ResourceExhausted => libc::ENOMEM,
            Error::InvalidArgument => libc::EINVAL,
            Error::TimedOut => libc::ETIMEDOUT,
            _ => 0,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::WouldBlock => write!(f, "operation would block"),
            Error::Interrupted => write!(f, "system call interrupted"),
            Error::TimedOut => write!(f, "operation timed out"),
            Error::PeerClosed => write!(f, "peer closed the connection"),
            Error::BrokenPipe => write!(f, "broken pipe"),
            Error::ResourceExhausted => write!(f, "resource exhausted"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::Os { code, source } => write!(f, "os error {code}: {source}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Os { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::from_io(err)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::WouldBlock => io::Error::from(io::ErrorKind::WouldBlock),
            Error::Interrupted => io::Error::from(io::ErrorKind::Interrupted),
            Error::TimedOut => io::Error::from(io::ErrorKind::TimedOut),
            Error::PeerClosed => io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"),
            Error::BrokenPipe => io::Error::from(io::ErrorKind::BrokenPipe),
            Error::ResourceExhausted => io::Error::other("resource exhausted"),
            Error::InvalidArgument => io::Error::from(io::ErrorKind::InvalidInput),
            Error::Os { source, .. } => source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_would_block() {
        let err = Error::from_io(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(matches!(err, Error::WouldBlock));
        assert!(err.is_transient());
    }

    #[test]
    fn classifies_resource_exhaustion() {
        let err = Error::from_io(io::Error::from_raw_os_error(libc::EMFILE));
        assert!(err.is_resource_exhausted());
    }

    #[test]
    fn unmapped_os_errors_carry_their_code() {
        let err = Error::from_io(io::Error::from_raw_os_error(libc::ECONNRESET));
        assert_eq!(err.native_code(), libc::ECONNRESET);
    }
}

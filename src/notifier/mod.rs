//! Readiness notifier (spec.md §4.2, component B).
//!
//! A single contract, [`Notifier`], is satisfied by three concrete
//! backends dispatched at compile time the way the `polling` crate dispatches
//! epoll/kqueue/wepoll via `cfg_if` — edge-triggered `epoll` on Linux/Android,
//! dual-filter `kqueue` on the BSD family and macOS, and a level-triggered
//! `poll(2)`-based fallback (spec.md's "select-style bitmap" backend,
//! portable everywhere) when neither advanced mechanism is selected.

mod edge;
mod level;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod dual;

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::Result;

pub use edge::EdgeNotifier;
pub use level::LevelNotifier;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub use dual::DualNotifier;

/// Readiness interest a descriptor is registered for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub fn readable() -> Interest {
        Interest {
            readable: true,
            writable: false,
        }
    }

    pub fn writable() -> Interest {
        Interest {
            readable: false,
            writable: true,
        }
    }

    pub fn read_write() -> Interest {
        Interest {
            readable: true,
            writable: true,
        }
    }
}

/// The classification an [`EventRecord`] carries (spec.md §3 "EventRecord").
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    Recv,
    Send,
    /// Native errno, or 0 when the backend doesn't surface one.
    Error(i32),
}

/// A tagged (descriptor, kind) pair produced by a notifier and consumed by
/// the connection registry.
#[derive(Copy, Clone, Debug)]
pub struct EventRecord {
    pub fd: RawFd,
    pub kind: EventKind,
}

/// Readiness notifier contract. One of [`EdgeNotifier`], [`LevelNotifier`],
/// or (on BSD/macOS) `DualNotifier` satisfies it.
///
/// `timeout`: `None` blocks indefinitely; `Some(Duration::ZERO)` polls
/// without blocking. This is the idiomatic Rust restatement of spec.md's
/// "fractional seconds, negative = infinite, zero = non-blocking" contract.
pub trait Notifier {
    fn add(&mut self, fd: RawFd, interest: Interest) -> Result<()>;

    /// Idempotent on an absent descriptor.
    fn remove(&mut self, fd: RawFd) -> Result<()>;

    fn count(&self) -> usize;

    fn clear(&mut self);

    /// Blocks up to `timeout`, filling the three output lists. Returns the
    /// total number of events, or 0 on timeout.
    fn poll(
        &mut self,
        timeout: Option<Duration>,
        out_recv: &mut Vec<EventRecord>,
        out_send: &mut Vec<EventRecord>,
        out_error: &mut Vec<EventRecord>,
    ) -> Result<usize>;
}

/// Which concrete [`Notifier`] backend to use (spec.md §6 configuration
/// surface, `notifier_backend`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum NotifierBackend {
    LevelSet,
    EdgeInterest,
    DualFilter,
    #[default]
    Auto,
}

/// Instantiates the backend `Config::notifier_backend` asks for, resolving
/// `Auto` to whichever advanced mechanism the host target provides.
pub fn create(backend: NotifierBackend) -> Result<Box<dyn Notifier + Send>> {
    match backend {
        NotifierBackend::LevelSet => Ok(Box::new(LevelNotifier::new())),
        NotifierBackend::EdgeInterest => create_edge(),
        NotifierBackend::DualFilter => create_dual(),
        NotifierBackend::Auto => create_edge().or_else(|_| create_dual()),
    }
}

#[cfg(target_os = "linux")]
fn create_edge() -> Result<Box<dyn Notifier + Send>> {
    Ok(Box::new(EdgeNotifier::new()?))
}

#[cfg(not(target_os = "linux"))]
fn create_edge() -> Result<Box<dyn Notifier + Send>> {
    Err(crate::error::Error::InvalidArgument)
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn create_dual() -> Result<Box<dyn Notifier + Send>> {
    Ok(Box::new(DualNotifier::new()?))
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
fn create_dual() -> Result<Box<dyn Notifier + Send>> {
    Ok(Box::new(LevelNotifier::new()))
}

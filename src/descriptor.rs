//! Exclusively-owned kernel file descriptor (spec.md §3 "Descriptor").
//!
//! Grounded in queen-io's `sys::fd::FileDesc` wrapper, generalized to the
//! spec's move-only contract: at most one live owner, idempotent close, a
//! `release` that voids ownership, and a `reset` that swaps in another
//! handle while closing whatever was there before.

use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

/// An owned socket (or other) file descriptor. `-1` denotes an invalid,
/// already-released handle.
#[derive(Debug)]
pub struct Descriptor(RawFd);

const INVALID: RawFd = -1;

impl Descriptor {
    /// Takes ownership of `fd`. The caller must not use `fd` through any
    /// other handle afterwards.
    ///
    /// # Safety
    /// `fd` must be a valid, open file descriptor not already owned
    /// elsewhere.
    pub unsafe fn from_raw(fd: RawFd) -> Descriptor {
        Descriptor(fd)
    }

    /// An invalid descriptor that owns nothing and whose `close` is a no-op.
    pub fn invalid() -> Descriptor {
        Descriptor(INVALID)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != INVALID
    }

    pub fn raw(&self) -> RawFd {
        self.0
    }

    /// Yields the raw integer and voids this handle's ownership: the
    /// descriptor will not be closed when this `Descriptor` drops.
    pub fn release(mut self) -> RawFd {
        let fd = self.0;
        self.0 = INVALID;
        fd
    }

    /// Swaps in `fd`, closing whatever this handle previously owned.
    ///
    /// # Safety
    /// Same requirement as [`Descriptor::from_raw`].
    pub unsafe fn reset(&mut self, fd: RawFd) {
        self.close();
        self.0 = fd;
    }

    fn close(&mut self) {
        if self.0 != INVALID {
            unsafe {
                libc::close(self.0);
            }
            self.0 = INVALID;
        }
    }

    pub fn try_clone(&self) -> std::io::Result<Descriptor> {
        if self.0 == INVALID {
            return Ok(Descriptor(INVALID));
        }
        let fd = unsafe { libc::fcntl(self.0, libc::F_DUPFD_CLOEXEC, 0) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Descriptor(fd))
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        self.close();
    }
}

impl AsRawFd for Descriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl FromRawFd for Descriptor {
    unsafe fn from_raw_fd(fd: RawFd) -> Descriptor {
        Descriptor(fd)
    }
}

impl IntoRawFd for Descriptor {
    fn into_raw_fd(self) -> RawFd {
        self.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_descriptor_closes_nothing() {
        let d = Descriptor::invalid();
        assert!(!d.is_valid());
        drop(d);
    }

    #[test]
    fn release_voids_ownership() {
        let (a, _b) = unsafe {
            let mut fds = [0; 2];
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
            (Descriptor::from_raw(fds[0]), Descriptor::from_raw(fds[1]))
        };
        let raw = a.release();
        assert!(raw >= 0);
        unsafe { libc::close(raw) };
    }

    #[test]
    fn reset_closes_previous_handle() {
        let mut fds = [0; 2];
        unsafe { assert_eq!(libc::pipe(fds.as_mut_ptr()), 0) };
        let mut d = unsafe { Descriptor::from_raw(fds[0]) };
        let other = fds[1];
        unsafe { d.reset(other) };
        assert_eq!(d.raw(), other);
    }
}

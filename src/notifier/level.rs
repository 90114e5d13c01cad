//! Level-set backend: `select(2)`, a select-style bitmap re-evaluated in
//! full on every call (spec.md §4.2, O(max_fd) per poll). This is the
//! portable fallback used when neither `epoll` nor `kqueue` is available;
//! registered descriptor values must fit under `FD_SETSIZE`.
//!
//! `libc::fd_set` keeps its bitmap field private, so `FD_SET`/`FD_CLR`/
//! `FD_ISSET` (C macros, not linkable symbols) are reimplemented here as
//! direct bit operations over the struct's raw bytes — the same technique
//! pre-`mio` Rust select wrappers used before edge-triggered backends made
//! `select` obsolete.

use std::collections::BTreeSet;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::{Error, Result};

use super::{EventKind, EventRecord, Interest, Notifier};

const FD_SETSIZE: usize = 1024;

#[repr(C)]
#[derive(Clone, Copy)]
struct FdSet(libc::fd_set);

impl FdSet {
    fn empty() -> FdSet {
        unsafe { mem::zeroed() }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                &mut self.0 as *mut libc::fd_set as *mut u8,
                mem::size_of::<libc::fd_set>(),
            )
        }
    }

    fn bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                &self.0 as *const libc::fd_set as *const u8,
                mem::size_of::<libc::fd_set>(),
            )
        }
    }

    fn set(&mut self, fd: RawFd) {
        let fd = fd as usize;
        self.bytes_mut()[fd / 8] |= 1 << (fd % 8);
    }

    fn is_set(&self, fd: RawFd) -> bool {
        let fd = fd as usize;
        self.bytes()[fd / 8] & (1 << (fd % 8)) != 0
    }

    fn as_mut_ptr(&mut self) -> *mut libc::fd_set {
        &mut self.0
    }
}

#[derive(Default)]
struct Registration {
    interest: Interest,
}

pub struct LevelNotifier {
    registrations: BTreeSet<RawFd>,
    interests: std::collections::HashMap<RawFd, Registration>,
}

impl LevelNotifier {
    pub fn new() -> LevelNotifier {
        LevelNotifier {
            registrations: BTreeSet::new(),
            interests: std::collections::HashMap::new(),
        }
    }
}

impl Notifier for LevelNotifier {
    fn add(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        if fd as usize >= FD_SETSIZE {
            return Err(Error::InvalidArgument);
        }
        self.registrations.insert(fd);
        self.interests.insert(fd, Registration { interest });
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> Result<()> {
        self.registrations.remove(&fd);
        self.interests.remove(&fd);
        Ok(())
    }

    fn count(&self) -> usize {
        self.registrations.len()
    }

    fn clear(&mut self) {
        self.registrations.clear();
        self.interests.clear();
    }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
        out_recv: &mut Vec<EventRecord>,
        out_send: &mut Vec<EventRecord>,
        out_error: &mut Vec<EventRecord>,
    ) -> Result<usize> {
        if self.registrations.is_empty() {
            if let Some(d) = timeout {
                std::thread::sleep(d);
            }
            return Ok(0);
        }

        let mut read_set = FdSet::empty();
        let mut write_set = FdSet::empty();
        let mut error_set = FdSet::empty();
        let mut max_fd = 0;

        for &fd in &self.registrations {
            let reg = &self.interests[&fd];
            if reg.interest.readable {
                read_set.set(fd);
            }
            if reg.interest.writable {
                write_set.set(fd);
            }
            error_set.set(fd);
            max_fd = max_fd.max(fd);
        }

        let mut tv = timeout.map(|d| libc::timeval {
            tv_sec: d.as_secs() as libc::time_t,
            tv_usec: d.subsec_micros() as libc::suseconds_t,
        });

        let tv_ptr = tv
            .as_mut()
            .map(|t| t as *mut libc::timeval)
            .unwrap_or(std::ptr::null_mut());

        let ret = unsafe {
            libc::select(
                max_fd + 1,
                read_set.as_mut_ptr(),
                write_set.as_mut_ptr(),
                error_set.as_mut_ptr(),
                tv_ptr,
            )
        };

        if ret < 0 {
            let err = Error::from_io(std::io::Error::last_os_error());
            return match err {
                Error::Interrupted => Ok(0),
                other => Err(other),
            };
        }

        if ret == 0 {
            return Ok(0);
        }

        let mut n = 0;
        for &fd in &self.registrations {
            if error_set.is_set(fd) {
                out_error.push(EventRecord {
                    fd,
                    kind: EventKind::Error(0),
                });
                n += 1;
                continue;
            }
            if read_set.is_set(fd) {
                out_recv.push(EventRecord {
                    fd,
                    kind: EventKind::Recv,
                });
                n += 1;
            }
            if write_set.is_set(fd) {
                out_send.push(EventRecord {
                    fd,
                    kind: EventKind::Send,
                });
                n += 1;
            }
        }

        Ok(n)
    }
}

impl Default for LevelNotifier {
    fn default() -> LevelNotifier {
        LevelNotifier::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn reports_readable_pipe() {
        let mut fds = [0; 2];
        unsafe { assert_eq!(libc::pipe(fds.as_mut_ptr()), 0) };
        let (r, w) = (fds[0], fds[1]);

        let mut notifier = LevelNotifier::new();
        notifier.add(r, Interest::readable()).unwrap();

        unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) };

        let (mut recv, mut send, mut err) = (Vec::new(), Vec::new(), Vec::new());
        let n = notifier
            .poll(Some(Duration::from_millis(500)), &mut recv, &mut send, &mut err)
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(recv[0].fd, r);

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn times_out_with_no_events() {
        let mut fds = [0; 2];
        unsafe { assert_eq!(libc::pipe(fds.as_mut_ptr()), 0) };
        let (r, w) = (fds[0], fds[1]);

        let mut notifier = LevelNotifier::new();
        notifier.add(r, Interest::readable()).unwrap();

        let (mut recv, mut send, mut err) = (Vec::new(), Vec::new(), Vec::new());
        let n = notifier
            .poll(Some(Duration::from_millis(50)), &mut recv, &mut send, &mut err)
            .unwrap();
        assert_eq!(n, 0);

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn rejects_descriptor_beyond_fd_setsize() {
        let mut notifier = LevelNotifier::new();
        let err = notifier.add(FD_SETSIZE as RawFd, Interest::readable());
        assert!(matches!(err, Err(Error::InvalidArgument)));
    }
}

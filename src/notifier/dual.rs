//! Dual-filter backend: BSD/macOS `kqueue`, with separate read and write
//! filter entries per descriptor (spec.md §4.2). Writable interest is
//! optional and off by default, matching the spec's resolution of the
//! "should the edge-interest backend register writable by default" open
//! question (see DESIGN.md) extended here: this backend only files an
//! `EVFILT_WRITE` entry when the caller actually asks for it.

use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::error::{Error, Result};

use super::{EventKind, EventRecord, Interest, Notifier};

macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)? )) => {{
        let res = unsafe { libc::$fn($($arg),*) };
        if res == -1 {
            Err(Error::from_io(std::io::Error::last_os_error()))
        } else {
            Ok(res)
        }
    }};
}

const EVENTS_CAPACITY: usize = 1024;

pub struct DualNotifier {
    kq: RawFd,
    registered: usize,
    events: Vec<libc::kevent>,
}

impl DualNotifier {
    pub fn new() -> Result<DualNotifier> {
        let kq = syscall!(kqueue())?;
        Ok(DualNotifier {
            kq,
            registered: 0,
            events: Vec::with_capacity(EVENTS_CAPACITY),
        })
    }

    fn change(&self, fd: RawFd, filter: i16, flags: u16) -> Result<()> {
        let mut kev: libc::kevent = unsafe { mem::zeroed() };
        kev.ident = fd as usize;
        kev.filter = filter;
        kev.flags = flags;
        let changelist = [kev];
        syscall!(kevent(
            self.kq,
            changelist.as_ptr(),
            1,
            std::ptr::null_mut(),
            0,
            std::ptr::null()
        ))?;
        Ok(())
    }
}

impl Notifier for DualNotifier {
    fn add(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        // No EV_CLEAR: spec.md §4.2 classifies this backend Level-triggered,
        // so each filter re-fires on every poll while the condition holds,
        // unlike the edge-interest (epoll) backend's drain-until-would-block
        // obligation.
        self.change(
            fd,
            libc::EVFILT_READ,
            libc::EV_ADD | if interest.readable { 0 } else { libc::EV_DISABLE },
        )?;

        if interest.writable {
            self.change(fd, libc::EVFILT_WRITE, libc::EV_ADD)?;
        }

        self.registered += 1;
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> Result<()> {
        let _ = self.change(fd, libc::EVFILT_READ, libc::EV_DELETE);
        let _ = self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE);
        self.registered = self.registered.saturating_sub(1);
        Ok(())
    }

    fn count(&self) -> usize {
        self.registered
    }

    fn clear(&mut self) {
        if let Ok(fresh) = syscall!(kqueue()) {
            unsafe { libc::close(self.kq) };
            self.kq = fresh;
            self.registered = 0;
        }
    }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
        out_recv: &mut Vec<EventRecord>,
        out_send: &mut Vec<EventRecord>,
        out_error: &mut Vec<EventRecord>,
    ) -> Result<usize> {
        let capacity = (self.registered * 2).clamp(1, EVENTS_CAPACITY);
        self.events.resize(capacity, unsafe { mem::zeroed() });

        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as i64,
        });
        let ts_ptr = ts
            .as_ref()
            .map(|t| t as *const libc::timespec)
            .unwrap_or(std::ptr::null());

        let n = match syscall!(kevent(
            self.kq,
            std::ptr::null(),
            0,
            self.events.as_mut_ptr(),
            capacity as i32,
            ts_ptr
        )) {
            Ok(n) => n,
            Err(Error::Interrupted) => 0,
            Err(e) => return Err(e),
        };

        for kev in &self.events[..n as usize] {
            let fd = kev.ident as RawFd;

            if kev.flags & libc::EV_ERROR != 0 {
                out_error.push(EventRecord {
                    fd,
                    kind: EventKind::Error(kev.data as i32),
                });
                continue;
            }

            if kev.flags & libc::EV_EOF != 0 {
                out_error.push(EventRecord {
                    fd,
                    kind: EventKind::Error(kev.fflags as i32),
                });
                continue;
            }

            match kev.filter {
                libc::EVFILT_READ => out_recv.push(EventRecord {
                    fd,
                    kind: EventKind::Recv,
                }),
                libc::EVFILT_WRITE => out_send.push(EventRecord {
                    fd,
                    kind: EventKind::Send,
                }),
                _ => {}
            }
        }

        Ok(n as usize)
    }
}

impl AsRawFd for DualNotifier {
    fn as_raw_fd(&self) -> RawFd {
        self.kq
    }
}

impl Drop for DualNotifier {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}

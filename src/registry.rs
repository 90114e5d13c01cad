//! Connection registry & dispatch (spec.md §4.3, component C).
//!
//! Owns the descriptor → [`Connection`] map, the notifier registrations that
//! back it, and the three scratch partitions one `Update` cycle classifies
//! events into. Grounded in queen-io's `epoll::mod::Epoll` (which owns a
//! `Token`-keyed `Slab`/event-vector pair reused across `wait` calls) but
//! keyed directly by descriptor integer per spec.md §3 rather than through an
//! intermediate token, and single-threaded by contract rather than by type
//! (the owner-thread id is recorded and asserted against in debug builds,
//! matching spec.md §4.3's "MAY, and SHOULD in debug builds" wording).

use std::os::unix::io::RawFd;
use std::thread::{self, ThreadId};
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, trace, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::notifier::{self, EventKind, EventRecord, Interest, Notifier, NotifierBackend};

/// Descriptor → [`Connection`] map plus the notifier that backs it
/// (spec.md §3 "ConnectionRegistry").
pub struct ConnectionRegistry {
    notifier: Box<dyn Notifier + Send>,
    connections: IndexMap<RawFd, Connection>,
    max_connections: usize,
    errored: Vec<RawFd>,
    recv_scratch: Vec<EventRecord>,
    send_scratch: Vec<EventRecord>,
    error_scratch: Vec<EventRecord>,
    owner: ThreadId,
    clock: Box<dyn Clock>,
}

impl ConnectionRegistry {
    pub fn new(
        max_connections: usize,
        backend: NotifierBackend,
        clock: Box<dyn Clock>,
    ) -> Result<ConnectionRegistry> {
        Ok(ConnectionRegistry {
            notifier: notifier::create(backend)?,
            connections: IndexMap::with_capacity(max_connections),
            max_connections,
            errored: Vec::new(),
            recv_scratch: Vec::new(),
            send_scratch: Vec::new(),
            error_scratch: Vec::new(),
            owner: thread::current().id(),
            clock,
        })
    }

    /// Builds a registry from a [`Config`]: `max_connections` and
    /// `notifier_backend` size and select the notifier the way `new` takes
    /// them directly; `heartbeat` has no enforcement of its own in the
    /// core (spec.md §6 calls it advisory, for the application layer's
    /// `on_update` hook to apply), so it's only logged here for visibility.
    pub fn from_config(cfg: &Config, clock: Box<dyn Clock>) -> Result<ConnectionRegistry> {
        debug!(
            "registry configured with max_connections={}, heartbeat={:?} (advisory, enforced by on_update)",
            cfg.max_connections, cfg.heartbeat
        );
        ConnectionRegistry::new(cfg.max_connections, cfg.notifier_backend, clock)
    }

    fn assert_owner(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "ConnectionRegistry accessed from a thread other than its owner"
        );
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.connections.contains_key(&fd)
    }

    /// Inserts `conn`; fails if its descriptor collides with an existing
    /// entry (spec.md §4.3 "Join"). Registers it with the notifier with
    /// Readable interest always, and Writable interest when the connection's
    /// capabilities ask for `on_send` dispatch.
    pub fn join(&mut self, conn: Connection) -> Result<()> {
        self.assert_owner();

        let fd = conn.fd();
        if self.connections.contains_key(&fd) {
            return Err(Error::InvalidArgument);
        }
        if self.connections.len() >= self.max_connections {
            return Err(Error::ResourceExhausted);
        }

        let interest = if conn.capabilities().send {
            Interest::read_write()
        } else {
            Interest::readable()
        };
        self.notifier.add(fd, interest)?;
        self.connections.insert(fd, conn);
        trace!("joined fd {fd}, registry now holds {} connections", self.connections.len());
        Ok(())
    }

    /// Joins every connection in `batch`, returning the count successfully
    /// inserted (spec.md §4.3 "Join(batch)" / §8 scenario "Batch Join"). A
    /// duplicate descriptor within the batch, or one already present in the
    /// registry, is skipped without affecting the others.
    pub fn join_batch(&mut self, batch: Vec<Connection>) -> usize {
        let mut inserted = 0;
        for conn in batch {
            if self.join(conn).is_ok() {
                inserted += 1;
            }
        }
        inserted
    }

    /// Removes `fd` from the notifier and then from the map; a no-op if
    /// `fd` isn't registered (spec.md §4.3 "Unjoin").
    pub fn unjoin(&mut self, fd: RawFd) -> Result<()> {
        self.assert_owner();

        if let Some(mut conn) = self.connections.shift_remove(&fd) {
            let _ = self.notifier.remove(fd);
            conn.dispatch_close();
            trace!("unjoined fd {fd}");
        }
        Ok(())
    }

    /// Unregisters and drops every connection.
    pub fn clear(&mut self) {
        self.assert_owner();

        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            let _ = self.unjoin(fd);
        }
        self.errored.clear();
        self.notifier.clear();
    }

    /// The errored set accumulated during the most recent `Update`. Callers
    /// must consume it before the next `Update` — the next call clears it by
    /// unjoining every connection it names (spec.md §4.3 "ErrorSnapshot").
    pub fn error_snapshot(&self) -> &[RawFd] {
        &self.errored
    }

    /// Drives one readiness cycle (spec.md §4.3 "Update").
    pub fn update(&mut self, timeout: Option<Duration>) -> Result<usize> {
        self.assert_owner();

        // (1) drain and release the previous cycle's errored set.
        let previous: Vec<RawFd> = self.errored.drain(..).collect();
        for fd in previous {
            let _ = self.unjoin(fd);
        }
        debug_assert!(self.errored.is_empty());

        // (2) ask the notifier to Poll into the three scratch partitions.
        self.recv_scratch.clear();
        self.send_scratch.clear();
        self.error_scratch.clear();
        let now = self.clock.now();
        let total = self.notifier.poll(
            timeout,
            &mut self.recv_scratch,
            &mut self.send_scratch,
            &mut self.error_scratch,
        )?;

        // (3) Recv before (4) Send before (5) Error, within this cycle.
        let recv_events = std::mem::take(&mut self.recv_scratch);
        for event in &recv_events {
            self.dispatch_recv(event, now);
        }
        self.recv_scratch = recv_events;

        let send_events = std::mem::take(&mut self.send_scratch);
        for event in &send_events {
            self.dispatch_send(event);
        }
        self.send_scratch = send_events;

        let error_events = std::mem::take(&mut self.error_scratch);
        for event in &error_events {
            self.dispatch_error(event);
        }
        self.error_scratch = error_events;

        // (6) timeout enforcement + optional heartbeat hook, once per
        // connection per cycle, for connections that didn't already error.
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            if self.errored.contains(&fd) {
                continue;
            }
            let Some(conn) = self.connections.get_mut(&fd) else {
                continue;
            };
            if conn.is_recv_timed_out(now) {
                debug!("fd {fd} receive-timed-out at {now}");
                self.errored.push(fd);
                continue;
            }
            if conn.capabilities().update && !conn.dispatch_update(now) {
                self.errored.push(fd);
            }
        }

        Ok(total)
    }

    fn dispatch_recv(&mut self, event: &EventRecord, now: f64) {
        let EventKind::Recv = event.kind else { return };
        let Some(conn) = self.connections.get_mut(&event.fd) else {
            return;
        };
        if !conn.capabilities().receive {
            return;
        }
        match conn.dispatch_receive(65536, now) {
            Ok(_) => {}
            Err(err) => {
                warn!("fd {} on_receive failed: {err}", event.fd);
                conn.dispatch_error(err.native_code());
                self.errored.push(event.fd);
            }
        }
    }

    fn dispatch_send(&mut self, event: &EventRecord) {
        let EventKind::Send = event.kind else { return };
        if self.errored.contains(&event.fd) {
            return;
        }
        let Some(conn) = self.connections.get_mut(&event.fd) else {
            return;
        };
        if let Err(err) = conn.dispatch_send(65536) {
            warn!("fd {} on_send failed: {err}", event.fd);
            conn.dispatch_error(err.native_code());
            self.errored.push(event.fd);
        }
    }

    fn dispatch_error(&mut self, event: &EventRecord) {
        let EventKind::Error(code) = event.kind else {
            return;
        };
        if let Some(conn) = self.connections.get_mut(&event.fd) {
            conn.dispatch_error(code);
        }
        if !self.errored.contains(&event.fd) {
            self.errored.push(event.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::clock::SystemClock;
    use crate::connection::{Capabilities, ConnectionHandler};
    use crate::socket::Socket;
    use crate::stream::StreamAdapter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingHandler {
        recv_calls: Arc<AtomicUsize>,
    }

    impl ConnectionHandler for CountingHandler {
        fn on_receive(&mut self, stream: &StreamAdapter, max: usize, _now: f64) -> Result<usize> {
            self.recv_calls.fetch_add(1, Ordering::SeqCst);
            let mut buf = vec![0u8; max];
            stream.read_some(&mut buf)
        }
        fn on_send(&mut self, _s: &StreamAdapter, _max: usize) -> Result<usize> {
            Ok(0)
        }
        fn on_error(&mut self, _code: i32) {}
        fn on_close(&mut self) {}
    }

    fn connected_pair() -> (Socket, Socket) {
        let listen_addr = Address::tcp("127.0.0.1:0".parse().unwrap());
        let listener = Socket::for_address(&listen_addr).unwrap();
        listener.set_reuse_address(true).unwrap();
        listener.bind(&listen_addr, true).unwrap();
        listener.listen(16).unwrap();
        let bound = listener.local_addr().unwrap();

        let client_addr = Address::tcp(bound);
        let client = Socket::for_address(&client_addr).unwrap();
        client.set_blocking(true, None, Some(Duration::from_secs(1))).unwrap();
        unsafe {
            let mut storage: libc::sockaddr_storage = std::mem::zeroed();
            let std::net::SocketAddr::V4(v4) = bound else {
                unreachable!("test only binds v4")
            };
            let raw = &mut storage as *mut _ as *mut libc::sockaddr_in;
            (*raw).sin_family = libc::AF_INET as libc::sa_family_t;
            (*raw).sin_port = v4.port().to_be();
            (*raw).sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            let res = libc::connect(
                client.raw(),
                &storage as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            );
            assert_eq!(res, 0);
        }

        listener.set_blocking(true, None, Some(Duration::from_secs(1))).unwrap();
        let (server_side, _peer) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();
        (server_side, client)
    }

    fn make_registry() -> ConnectionRegistry {
        ConnectionRegistry::new(4, NotifierBackend::LevelSet, Box::new(SystemClock::new())).unwrap()
    }

    fn make_connection(socket: Socket, recv_timeout: Duration) -> Connection {
        let remote = Address::tcp("127.0.0.1:1".parse().unwrap());
        Connection::new(
            socket,
            remote,
            recv_timeout,
            Capabilities::receive_only(),
            Box::new(CountingHandler {
                recv_calls: Arc::new(AtomicUsize::new(0)),
            }),
        )
    }

    #[test]
    fn duplicate_fd_is_rejected_on_join() {
        let (server, _client) = connected_pair();
        let fd = server.raw();

        let mut registry = make_registry();
        registry.join(make_connection(server, Duration::from_secs(120))).unwrap();
        assert!(registry.contains(fd));

        // A second Connection built on the very same raw fd must be
        // rejected; intentionally leaked so its Drop doesn't double-close
        // the fd the registry already owns.
        let dup_socket = Socket::from_descriptor(unsafe { crate::descriptor::Descriptor::from_raw(fd) });
        let dup_conn = make_connection(dup_socket, Duration::from_secs(120));
        assert!(registry.join(dup_conn).is_err());
        assert_eq!(registry.len(), 1);
        std::mem::forget(registry);
    }

    #[test]
    fn batch_join_skips_only_the_duplicate() {
        let mut registry = make_registry();
        let mut batch = Vec::new();
        let mut keep_alive = Vec::new();
        for _ in 0..3 {
            let (server, client) = connected_pair();
            keep_alive.push(client);
            batch.push(make_connection(server, Duration::from_secs(120)));
        }
        // duplicate the first connection's fd to mirror the c50-duplicate
        // scenario at smaller scale.
        let dup_fd = batch[0].fd();
        let dup_socket = Socket::from_descriptor(unsafe { crate::descriptor::Descriptor::from_raw(dup_fd) });
        batch.push(make_connection(dup_socket, Duration::from_secs(120)));

        let inserted = registry.join_batch(batch);
        assert_eq!(inserted, 3);
        assert_eq!(registry.len(), 3);
        std::mem::forget(registry);
    }

    #[test]
    fn timeout_enrolls_connection_in_errored_set() {
        let (server, client) = connected_pair();
        let mut registry = ConnectionRegistry::new(
            4,
            NotifierBackend::LevelSet,
            Box::new(SystemClock::new()),
        )
        .unwrap();

        let conn = make_connection(server, Duration::from_millis(10));
        registry.join(conn).unwrap();

        unsafe {
            libc::send(client.raw(), b"a".as_ptr() as *const _, 1, libc::MSG_NOSIGNAL);
        }
        // pick up the byte so last_received becomes non-zero.
        registry.update(Some(Duration::from_millis(200))).unwrap();
        assert!(registry.error_snapshot().is_empty());

        std::thread::sleep(Duration::from_millis(30));
        registry.update(Some(Duration::from_millis(0))).unwrap();
        assert!(!registry.error_snapshot().is_empty());

        drop(client);
    }
}

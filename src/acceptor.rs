//! Acceptor pipeline (spec.md §4.4, component D).
//!
//! A fixed-size pool of acceptor threads blocks in kernel `accept` against a
//! shared listening descriptor and hands newly accepted connections to the
//! single registry owner through a multi-producer/single-consumer
//! [`HandoffQueue`] — grounded in queen-io's `queue::Queue<T>` (a
//! `concurrent_queue::ConcurrentQueue` plus a pending counter), simplified
//! here since this queue is drained by polling, not by registering it with a
//! notifier: spec.md §4.4 has the owner thread drain it from inside its
//! `Update` loop rather than through the notifier.
//!
//! Errno classification on a failed `accept` follows the same transient/
//! fatal split riverdb's acceptor uses: `ECONNABORTED`/`EPROTO` (the peer
//! tore the connection down mid-handshake) are treated as transient, not
//! fatal.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use concurrent_queue::ConcurrentQueue;
use log::{error, info, trace, warn};

use crate::address::Address;
use crate::config::Config;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::registry::ConnectionRegistry;
use crate::socket::Socket;

/// Multi-producer/single-consumer handoff from acceptor threads to the
/// registry owner (spec.md §3 "Handoff queue").
#[derive(Clone)]
pub struct HandoffQueue {
    inner: Arc<ConcurrentQueue<Connection>>,
}

impl HandoffQueue {
    pub fn new() -> HandoffQueue {
        HandoffQueue {
            inner: Arc::new(ConcurrentQueue::unbounded()),
        }
    }

    fn push(&self, conn: Connection) -> std::result::Result<(), Connection> {
        self.inner.push(conn).map_err(|e| e.into_inner())
    }

    /// Drains every pending connection into `registry`, joining each one.
    /// This is the owner-thread-only step spec.md §4.4 describes as part of
    /// `Update`; callers invoke it immediately before `registry.update(..)`.
    pub fn drain_into(&self, registry: &mut ConnectionRegistry) -> usize {
        let mut joined = 0;
        while let Ok(conn) = self.inner.pop() {
            match registry.join(conn) {
                Ok(()) => joined += 1,
                Err(err) => warn!("dropping handed-off connection, join failed: {err}"),
            }
        }
        joined
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for HandoffQueue {
    fn default() -> HandoffQueue {
        HandoffQueue::new()
    }
}

/// States of a single acceptor thread's loop (spec.md §4.4).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AcceptorState {
    Idle,
    AwaitingReady,
    AcceptingOne,
    Publishing,
    Overload,
    Stopped,
}

/// Outcome of one `Accept` attempt.
pub enum AcceptOutcome {
    Accepted(Socket, Address),
    /// Transient: would-block, interrupted, timed out, or an accept-path
    /// errno riverdb's listener also treats as non-fatal.
    Timeout,
    /// File-table exhaustion; the caller backs off `overload_wait`.
    Overloaded,
    Fatal(Error),
}

/// A listening descriptor plus the bookkeeping one acceptor thread needs
/// (spec.md §3 "Acceptor"): the bound address and an accept timeout. Each
/// acceptor thread owns one of these so its printable-address formatting
/// never contends with another thread's.
pub struct Acceptor {
    listener: Arc<Socket>,
    bound: Address,
    accept_timeout: Duration,
    state: AcceptorState,
}

impl Acceptor {
    pub fn new(listener: Arc<Socket>, bound: Address, accept_timeout: Duration) -> Acceptor {
        Acceptor {
            listener,
            bound,
            accept_timeout,
            state: AcceptorState::Idle,
        }
    }

    pub fn bound_address(&self) -> Address {
        self.bound
    }

    pub fn state(&self) -> AcceptorState {
        self.state
    }

    /// One accept attempt (spec.md §4.4 "Contract of one accept attempt").
    pub fn accept_one(&mut self) -> AcceptOutcome {
        self.state = AcceptorState::AwaitingReady;
        if !self.accept_timeout.is_zero() {
            match wait_readable(self.listener.raw(), self.accept_timeout) {
                Ok(true) => {}
                Ok(false) => {
                    self.state = AcceptorState::Idle;
                    return AcceptOutcome::Timeout;
                }
                Err(err) => {
                    self.state = AcceptorState::Stopped;
                    return AcceptOutcome::Fatal(err);
                }
            }
        }

        self.state = AcceptorState::AcceptingOne;
        match self.listener.accept() {
            Ok((socket, addr)) => {
                self.state = AcceptorState::Publishing;
                let address = Address::tcp(addr);
                trace!("accepted fd {} from {address}", socket.raw());
                self.state = AcceptorState::Idle;
                AcceptOutcome::Accepted(socket, address)
            }
            Err(err) => self.classify_failure(err),
        }
    }

    fn classify_failure(&mut self, err: Error) -> AcceptOutcome {
        if err.is_transient() || is_accept_transient_os_error(&err) {
            self.state = AcceptorState::Idle;
            return AcceptOutcome::Timeout;
        }
        if err.is_resource_exhausted() {
            self.state = AcceptorState::Overload;
            return AcceptOutcome::Overloaded;
        }
        self.state = AcceptorState::Stopped;
        AcceptOutcome::Fatal(err)
    }
}

fn is_accept_transient_os_error(err: &Error) -> bool {
    matches!(err, Error::Os { code, .. } if matches!(*code, libc::ECONNABORTED | libc::EPROTO))
}

fn wait_readable(fd: RawFd, timeout: Duration) -> Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    loop {
        let n = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if n < 0 {
            let err = Error::from_io(io::Error::last_os_error());
            if matches!(err, Error::Interrupted) {
                continue;
            }
            return Err(err);
        }
        return Ok(n > 0);
    }
}

/// A fixed-size pool of acceptor threads sharing one listening descriptor
/// (spec.md §4.4 "Multi-threaded acceptor").
pub struct AcceptorPool {
    shutdown: Arc<AtomicBool>,
    listener: Arc<Socket>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl AcceptorPool {
    /// Spawns `thread_count` acceptor threads against `listener`, each
    /// calling `build_connection` on every accepted socket and pushing the
    /// result into `queue`.
    pub fn spawn<F>(
        listener: Socket,
        bound: Address,
        thread_count: usize,
        accept_timeout: Duration,
        overload_wait: Duration,
        queue: HandoffQueue,
        build_connection: F,
    ) -> AcceptorPool
    where
        F: Fn(Socket, Address) -> Connection + Send + Sync + 'static,
    {
        let listener = Arc::new(listener);
        let shutdown = Arc::new(AtomicBool::new(false));
        let build_connection = Arc::new(build_connection);
        let mut handles = Vec::with_capacity(thread_count);

        for idx in 0..thread_count {
            let listener = listener.clone();
            let shutdown = shutdown.clone();
            let queue = queue.clone();
            let build_connection = build_connection.clone();
            let handle = thread::Builder::new()
                .name(format!("acceptor-{idx}"))
                .spawn(move || acceptor_loop(listener, bound, shutdown, accept_timeout, overload_wait, queue, build_connection))
                .expect("failed to spawn acceptor thread");
            handles.push(handle);
        }

        AcceptorPool {
            shutdown,
            listener,
            handles,
        }
    }

    /// Builds the listening socket with every option `cfg` carries applied
    /// (spec.md §6), then spawns `cfg.acceptor_threads` acceptor threads
    /// against it using `cfg.accept_timeout`/`cfg.overload_wait`.
    pub fn spawn_with_config<F>(addr: &Address, backlog: i32, cfg: &Config, queue: HandoffQueue, build_connection: F) -> Result<AcceptorPool>
    where
        F: Fn(Socket, Address) -> Connection + Send + Sync + 'static,
    {
        let listener = Socket::listener(addr, backlog, cfg)?;
        let bound = Address::tcp(listener.local_addr()?);
        Ok(AcceptorPool::spawn(
            listener,
            bound,
            cfg.acceptor_threads,
            cfg.accept_timeout,
            cfg.overload_wait,
            queue,
            build_connection,
        ))
    }

    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    /// Signals every acceptor thread to stop and closes the listening
    /// descriptor, unblocking any thread parked in kernel `accept`
    /// (spec.md §5 "Cancellation and timeouts"). Joins all threads before
    /// returning.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        unsafe { libc::close(self.listener.raw()) };
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn acceptor_loop<F>(
    listener: Arc<Socket>,
    bound: Address,
    shutdown: Arc<AtomicBool>,
    accept_timeout: Duration,
    overload_wait: Duration,
    queue: HandoffQueue,
    build_connection: Arc<F>,
) where
    F: Fn(Socket, Address) -> Connection + Send + Sync + 'static,
{
    let mut acceptor = Acceptor::new(listener, bound, accept_timeout);

    while !shutdown.load(Ordering::SeqCst) {
        match acceptor.accept_one() {
            AcceptOutcome::Accepted(socket, addr) => {
                info!("accepted connection from {addr}");
                let conn = build_connection(socket, addr);
                if let Err(dropped) = queue.push(conn) {
                    warn!("handoff queue rejected a connection from {addr}");
                    drop(dropped);
                }
            }
            AcceptOutcome::Timeout => continue,
            AcceptOutcome::Overloaded => {
                warn!("acceptor overloaded, backing off for {overload_wait:?}");
                thread::sleep(overload_wait);
            }
            AcceptOutcome::Fatal(err) => {
                if !shutdown.load(Ordering::SeqCst) {
                    error!("acceptor fatal error: {err}");
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::connection::Capabilities;
    use crate::connection::ConnectionHandler;
    use crate::stream::StreamAdapter;
    use std::net::TcpStream;
    use std::time::Duration;

    struct NullHandler;
    impl ConnectionHandler for NullHandler {
        fn on_receive(&mut self, _s: &StreamAdapter, _m: usize, _n: f64) -> Result<usize> {
            Ok(0)
        }
        fn on_send(&mut self, _s: &StreamAdapter, _m: usize) -> Result<usize> {
            Ok(0)
        }
        fn on_error(&mut self, _c: i32) {}
        fn on_close(&mut self) {}
    }

    fn listening_socket() -> (Socket, Address) {
        let listen_addr = Address::tcp("127.0.0.1:0".parse().unwrap());
        let listener = Socket::for_address(&listen_addr).unwrap();
        listener.set_reuse_address(true).unwrap();
        listener.bind(&listen_addr, true).unwrap();
        listener.listen(16).unwrap();
        let bound = Address::tcp(listener.local_addr().unwrap());
        (listener, bound)
    }

    #[test]
    fn accept_one_times_out_with_no_connection() {
        let (listener, bound) = listening_socket();
        let mut acceptor = Acceptor::new(Arc::new(listener), bound, Duration::from_millis(50));
        match acceptor.accept_one() {
            AcceptOutcome::Timeout => {}
            _ => panic!("expected a timeout with no pending connection"),
        }
        assert_eq!(acceptor.state(), AcceptorState::Idle);
    }

    #[test]
    fn accept_one_succeeds_once_a_peer_connects() {
        let (listener, bound) = listening_socket();
        let connect_addr = bound.socket_addr();
        let _client = thread::spawn(move || TcpStream::connect(connect_addr).unwrap());

        let mut acceptor = Acceptor::new(Arc::new(listener), bound, Duration::from_secs(2));
        match acceptor.accept_one() {
            AcceptOutcome::Accepted(_socket, _addr) => {}
            _ => panic!("expected an accepted connection"),
        }
    }

    #[test]
    fn pool_hands_off_accepted_connections_through_the_queue() {
        let (listener, bound) = listening_socket();
        let connect_addr = bound.socket_addr();
        let queue = HandoffQueue::new();

        let pool = AcceptorPool::spawn(
            listener,
            bound,
            1,
            Duration::from_millis(50),
            Duration::from_millis(10),
            queue.clone(),
            |socket, addr| {
                Connection::new(
                    socket,
                    addr,
                    Duration::from_secs(120),
                    Capabilities::receive_only(),
                    Box::new(NullHandler),
                )
            },
        );

        let _client = TcpStream::connect(connect_addr).unwrap();

        let mut waited = Duration::ZERO;
        while queue.is_empty() && waited < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(20));
            waited += Duration::from_millis(20);
        }
        assert!(!queue.is_empty());

        pool.shutdown();
    }
}

//! Connection lifecycle (spec.md §3 "Connection", §4.3 handler contract).
//!
//! A `Connection` pairs an accepted [`Socket`] with the bookkeeping the
//! registry needs (remote address, receive-timeout tracking, byte counters)
//! and a user-supplied [`ConnectionHandler`] — the capability set dispatched
//! by the registry's `Update` cycle. Dispatch is via trait object: spec.md §9
//! leaves the mechanism open (tagged variant, trait object, generic
//! parameter) and only requires no per-event heap allocation on the hot
//! path, which a `Box<dyn ConnectionHandler>` fixed at Join time satisfies —
//! the allocation happens once, not per event.

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::address::Address;
use crate::error::Result;
use crate::socket::Socket;
use crate::stream::StreamAdapter;

/// Which event callbacks a connection actually wants driven. The registry
/// consults this before invoking a handler: `send` also decides whether
/// `join` asks the notifier for Writable interest, while `receive` and
/// `update` gate the `on_receive`/`on_update` dispatch each cycle directly, so
/// a receive-only connection never pays for a `Send` dispatch — or any other
/// dispatch it has opted out of — it would otherwise ignore.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub receive: bool,
    pub send: bool,
    pub update: bool,
}

impl Capabilities {
    pub fn receive_only() -> Capabilities {
        Capabilities {
            receive: true,
            send: false,
            update: true,
        }
    }

    pub fn full() -> Capabilities {
        Capabilities {
            receive: true,
            send: true,
            update: true,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Capabilities {
        Capabilities::receive_only()
    }
}

/// The event-handler capability set a `Connection` provides (spec.md §4.3).
///
/// `on_receive`/`on_send` return bytes processed, `Ok(0)` for a spurious
/// wakeup with nothing to do, and `Err` on a fatal condition — the registry
/// enrolls the connection in the errored set on `Err` exactly as it does for
/// a notifier-reported `Error` event.
pub trait ConnectionHandler: Send {
    fn on_receive(&mut self, stream: &StreamAdapter, max_bytes: usize, now: f64) -> Result<usize>;

    fn on_send(&mut self, stream: &StreamAdapter, max_bytes: usize) -> Result<usize>;

    /// Observational; the registry has already enrolled the connection in
    /// the errored set by the time this runs.
    fn on_error(&mut self, native_code: i32);

    /// Invoked exactly once, whether removal was triggered by an error,
    /// peer hang-up, timeout, or an explicit `Unjoin`.
    fn on_close(&mut self);

    /// Per-tick hook for timeout/heartbeat checks beyond the registry's own
    /// recv-timeout enforcement. Returning `false` enrolls the connection in
    /// the errored set. The default accepts every tick.
    fn on_update(&mut self, _now: f64) -> bool {
        true
    }
}

/// An accepted stream endpoint (spec.md §3 "Connection").
pub struct Connection {
    socket: Socket,
    remote: Address,
    last_received: f64,
    recv_timeout: Duration,
    bytes_sent: u64,
    bytes_received: u64,
    capabilities: Capabilities,
    handler: Box<dyn ConnectionHandler>,
}

impl Connection {
    pub fn new(
        socket: Socket,
        remote: Address,
        recv_timeout: Duration,
        capabilities: Capabilities,
        handler: Box<dyn ConnectionHandler>,
    ) -> Connection {
        Connection {
            socket,
            remote,
            last_received: 0.0,
            recv_timeout,
            bytes_sent: 0,
            bytes_received: 0,
            capabilities,
            handler,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.socket.raw()
    }

    pub fn remote(&self) -> Address {
        self.remote
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn last_received(&self) -> f64 {
        self.last_received
    }

    pub fn recv_timeout(&self) -> Duration {
        self.recv_timeout
    }

    /// True once `last_received` is non-zero and `recv_timeout` has elapsed
    /// since it, mirroring spec.md §4.3's timeout-enforcement rule exactly
    /// (a connection that has never received anything cannot time out here
    /// — only `OnUpdate` catches that case via the application handler).
    pub fn is_recv_timed_out(&self, now: f64) -> bool {
        self.last_received != 0.0 && self.last_received + self.recv_timeout.as_secs_f64() < now
    }

    pub(crate) fn dispatch_receive(&mut self, max_bytes: usize, now: f64) -> Result<usize> {
        let stream = StreamAdapter::new(&self.socket);
        let result = self.handler.on_receive(&stream, max_bytes, now);
        if let Ok(n) = result {
            if n > 0 {
                self.last_received = now;
                self.bytes_received += n as u64;
            }
        }
        result
    }

    pub(crate) fn dispatch_send(&mut self, max_bytes: usize) -> Result<usize> {
        let stream = StreamAdapter::new(&self.socket);
        let result = self.handler.on_send(&stream, max_bytes);
        if let Ok(n) = result {
            self.bytes_sent += n as u64;
        }
        result
    }

    pub(crate) fn dispatch_error(&mut self, native_code: i32) {
        self.handler.on_error(native_code);
    }

    pub(crate) fn dispatch_close(&mut self) {
        self.handler.on_close();
    }

    pub(crate) fn dispatch_update(&mut self, now: f64) -> bool {
        self.handler.on_update(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::socket::Socket;

    struct EchoHandler;

    impl ConnectionHandler for EchoHandler {
        fn on_receive(&mut self, _stream: &StreamAdapter, _max_bytes: usize, _now: f64) -> Result<usize> {
            Ok(0)
        }
        fn on_send(&mut self, _stream: &StreamAdapter, _max_bytes: usize) -> Result<usize> {
            Ok(0)
        }
        fn on_error(&mut self, _native_code: i32) {}
        fn on_close(&mut self) {}
    }

    fn loopback_socket() -> Socket {
        let addr = Address::tcp("127.0.0.1:0".parse().unwrap());
        let socket = Socket::for_address(&addr).unwrap();
        socket.bind(&addr, true).unwrap();
        socket.listen(1).unwrap();
        socket
    }

    #[test]
    fn recv_timeout_does_not_trip_before_first_receive() {
        let socket = loopback_socket();
        let remote = Address::tcp("127.0.0.1:1".parse().unwrap());
        let conn = Connection::new(
            socket,
            remote,
            Duration::from_secs(1),
            Capabilities::default(),
            Box::new(EchoHandler),
        );
        assert!(!conn.is_recv_timed_out(1_000_000.0));
    }

    #[test]
    fn recv_timeout_trips_after_elapsed_window() {
        let socket = loopback_socket();
        let remote = Address::tcp("127.0.0.1:1".parse().unwrap());
        let mut conn = Connection::new(
            socket,
            remote,
            Duration::from_secs(1),
            Capabilities::default(),
            Box::new(EchoHandler),
        );
        conn.last_received = 0.5;
        assert!(!conn.is_recv_timed_out(1.2));
        assert!(conn.is_recv_timed_out(1.6));
    }
}

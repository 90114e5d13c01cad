//! Configuration surface (spec.md §6).

use std::time::Duration;

use crate::notifier::NotifierBackend;
use crate::socket::KeepAlive;

/// Every tunable the core exposes. Defaults match spec.md's configuration
/// table exactly.
#[derive(Clone, Debug)]
pub struct Config {
    pub max_connections: usize,
    pub recv_timeout: Duration,
    pub heartbeat: Duration,
    pub accept_timeout: Duration,
    pub overload_wait: Duration,
    pub tcp_buffer_bytes: i32,
    pub tcp_no_delay: bool,
    pub keep_alive: KeepAlive,
    pub reuse_address: bool,
    pub ipv6_only: bool,
    pub acceptor_threads: usize,
    pub notifier_backend: NotifierBackend,
}

impl Config {
    /// Builds a config with the required `max_connections` and every other
    /// option at its documented default.
    pub fn new(max_connections: usize) -> Config {
        assert!(max_connections > 0, "max_connections must be > 0");
        Config {
            max_connections,
            ..Config::default()
        }
    }

    pub fn with_recv_timeout(mut self, d: Duration) -> Config {
        self.recv_timeout = d;
        self
    }

    pub fn with_heartbeat(mut self, d: Duration) -> Config {
        self.heartbeat = d;
        self
    }

    pub fn with_accept_timeout(mut self, d: Duration) -> Config {
        self.accept_timeout = d;
        self
    }

    pub fn with_overload_wait(mut self, d: Duration) -> Config {
        self.overload_wait = d;
        self
    }

    pub fn with_tcp_buffer_bytes(mut self, bytes: i32) -> Config {
        self.tcp_buffer_bytes = bytes;
        self
    }

    pub fn with_tcp_no_delay(mut self, enable: bool) -> Config {
        self.tcp_no_delay = enable;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: KeepAlive) -> Config {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_reuse_address(mut self, enable: bool) -> Config {
        self.reuse_address = enable;
        self
    }

    pub fn with_ipv6_only(mut self, enable: bool) -> Config {
        self.ipv6_only = enable;
        self
    }

    pub fn with_acceptor_threads(mut self, count: usize) -> Config {
        assert!(count > 0, "acceptor_threads must be > 0");
        self.acceptor_threads = count;
        self
    }

    pub fn with_notifier_backend(mut self, backend: NotifierBackend) -> Config {
        self.notifier_backend = backend;
        self
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_connections: 1,
            recv_timeout: Duration::from_secs(120),
            heartbeat: Duration::from_secs(30),
            accept_timeout: Duration::from_secs(60),
            overload_wait: Duration::from_secs(10),
            tcp_buffer_bytes: 262_144,
            tcp_no_delay: false,
            keep_alive: KeepAlive::default(),
            reuse_address: false,
            ipv6_only: false,
            acceptor_threads: 1,
            notifier_backend: NotifierBackend::Auto,
        }
    }
}

//! Event-driven connection-management core for a TCP server.
//!
//! This crate provides the pieces that sit under a TCP server and above the
//! kernel: a readiness notifier unifying poll/epoll/kqueue, a connection
//! registry that drives per-connection receive/send/error dispatch, a
//! multi-threaded acceptor pipeline, and the address/socket primitives they
//! rest on. Application-layer protocol parsing, TLS, and connection pooling
//! are deliberately out of scope — see the crate's design notes.

mod address;
mod clock;
mod config;
mod descriptor;
mod error;
mod notifier;
mod socket;
mod stream;

pub mod acceptor;
pub mod connection;
pub mod registry;

pub use address::{Address, Family, SocketKind};
pub use clock::{Clock, SystemClock, TestClock};
pub use config::Config;
pub use descriptor::Descriptor;
pub use error::{Error, Result};
pub use notifier::{EventKind, EventRecord, Interest, Notifier, NotifierBackend};
pub use socket::{KeepAlive, Socket};
pub use stream::StreamAdapter;

pub use acceptor::{Acceptor, AcceptOutcome, AcceptorPool, AcceptorState, HandoffQueue};
pub use connection::{Capabilities, Connection, ConnectionHandler};
pub use registry::ConnectionRegistry;

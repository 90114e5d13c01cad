//! Stream-byte adapter (spec.md §4.5, component E).
//!
//! Wraps a [`Socket`] as a pair of byte sinks. Blocking/non-blocking
//! semantics are inherited from whatever mode the underlying descriptor is
//! already in; this adapter does not itself toggle blocking mode. Grounded in
//! queen-io's `net::tcp::TcpStream` read/write pair, generalized onto this
//! crate's `Socket`/`Error` types instead of `std::io::Result`.

use crate::error::{Error, Result};
use crate::socket::Socket;

/// A byte-stream view over an accepted connection's socket.
pub struct StreamAdapter<'a> {
    socket: &'a Socket,
}

impl<'a> StreamAdapter<'a> {
    pub fn new(socket: &'a Socket) -> StreamAdapter<'a> {
        StreamAdapter { socket }
    }

    /// Reads at most `buf.len()` bytes. Returns `Ok(0)` on an orderly peer
    /// close, `Ok(n>0)` on data, `Err(Error::WouldBlock)` when nothing is
    /// available yet — the spec.md §4.5 requirement that zero be
    /// distinguishable from would-block.
    pub fn read_some(&self, buf: &mut [u8]) -> Result<usize> {
        match self.socket.read(buf) {
            Ok(0) => Ok(0),
            Ok(n) => Ok(n),
            Err(Error::Interrupted) => self.read_some(buf),
            Err(e) => Err(e),
        }
    }

    /// Writes at most `buf.len()` bytes, returning how many went out (which
    /// may be fewer than `buf.len()` on a short write).
    pub fn write_some(&self, buf: &[u8]) -> Result<usize> {
        match self.socket.write(buf) {
            Ok(n) => Ok(n),
            Err(Error::Interrupted) => self.write_some(buf),
            Err(e) => Err(e),
        }
    }

    /// Retries short writes until every byte of `buf` has been sent or a
    /// non-transient error occurs (spec.md §4.5). `WouldBlock` on a
    /// non-blocking descriptor is surfaced rather than retried in a tight
    /// loop — callers drive the retry from the next writable readiness
    /// event.
    pub fn write_fully(&self, buf: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            match self.write_some(&buf[written..]) {
                Ok(0) if !buf.is_empty() => return Err(Error::BrokenPipe),
                Ok(n) => written += n,
                Err(Error::WouldBlock) if written > 0 => return Ok(written),
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::socket::Socket;
    use std::time::Duration;

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
            let (storage, len) = {
                let mut storage: libc::sockaddr_storage = std::mem::zeroed();
                match bound {
                    std::net::SocketAddr::V4(v4) => {
                        let raw = &mut storage as *mut _ as *mut libc::sockaddr_in;
                        (*raw).sin_family = libc::AF_INET as libc::sa_family_t;
                        (*raw).sin_port = v4.port().to_be();
                        (*raw).sin_addr = libc::in_addr {
                            s_addr: u32::from_ne_bytes(v4.ip().octets()),
                        };
                        (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
                    }
                    _ => unreachable!("test only binds v4"),
                }
            };
            let res = libc::connect(
                client.raw(),
                &storage as *const _ as *const libc::sockaddr,
                len,
            );
            assert_eq!(res, 0);
        }

        listener.set_blocking(true, None, Some(Duration::from_secs(1))).unwrap();
        let (server_side, _peer) = listener.accept().unwrap();
        server_side.set_blocking(true, None, Some(Duration::from_secs(1))).unwrap();
        (server_side, client)
    }

    #[test]
    fn write_fully_delivers_every_byte() {
        let (server, client) = connected_pair();
        let adapter = StreamAdapter::new(&server);
        let payload = vec![7u8; 64 * 1024];
        let n = adapter.write_fully(&payload).unwrap();
        assert_eq!(n, payload.len());

        let client_adapter = StreamAdapter::new(&client);
        let mut received = 0;
        let mut buf = [0u8; 4096];
        while received < payload.len() {
            received += client_adapter.read_some(&mut buf).unwrap();
        }
        assert_eq!(received, payload.len());
    }

    #[test]
    fn read_some_reports_zero_on_clean_close() {
        let (server, client) = connected_pair();
        drop(client);

        let adapter = StreamAdapter::new(&server);
        let mut buf = [0u8; 16];
        assert_eq!(adapter.read_some(&mut buf).unwrap(), 0);
    }
}

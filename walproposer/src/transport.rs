//! Transport capability contract (spec §4.2): a nonblocking byte-stream carrying
//! length-delimited frames. The real wire identity (libpq/CopyBoth) is explicitly out
//! of scope (spec §1); this implements the capability set over plain TCP with a small
//! ASCII handshake standing in for `START_WAL_PUSH` / CopyBoth negotiation.

use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use bytes::{Buf, Bytes, BytesMut};
use socket2::{Domain, Socket, Type};

use crate::error::TransportError;

const HANDSHAKE_QUERY: &[u8] = b"START_WAL_PUSH\n";
const HANDSHAKE_ACK: &[u8] = b"COPYBOTH\n";

pub enum ConnectPoll {
    Connected,
    NeedRead,
    NeedWrite,
    Failed(TransportError),
}

pub enum ExecResult {
    CopyBothOk,
    NeedInput,
    UnexpectedOk,
    Failed(TransportError),
}

pub enum WriteOutcome {
    Ok,
    TryFlush,
    Failed(TransportError),
}

pub enum FlushOutcome {
    Complete,
    Partial,
    Failed(TransportError),
}

pub enum ReadOutcome {
    ReadOk(Bytes),
    TryAgain,
    Failed(TransportError),
}

/// One nonblocking TCP connection plus its outbound frame buffer. Message framing is
/// a 4-byte little-endian length prefix followed by the payload (stands in for
/// individual `CopyData` payloads on the real wire).
pub struct Connection {
    sock: std::net::TcpStream,
    write_buf: BytesMut,
    read_buf: BytesMut,
    handshake_read_buf: Vec<u8>,
}

impl Connection {
    /// Begin a nonblocking connect. Per spec §4.2, an immediately-known-bad address
    /// (e.g. unresolvable) is an error the caller treats as "Bad" and shuts down; any
    /// other outcome means the connect is in progress and readiness must be awaited.
    pub fn connect_start(addr: SocketAddr) -> Result<Connection, TransportError> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let sock = Socket::new(domain, Type::STREAM, None).map_err(TransportError::Connect)?;
        sock.set_nonblocking(true).map_err(TransportError::Connect)?;
        match sock.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(TransportError::Connect(e)),
        }
        Ok(Connection {
            sock: sock.into(),
            write_buf: BytesMut::new(),
            read_buf: BytesMut::new(),
            handshake_read_buf: Vec::new(),
        })
    }

    /// Check whether a connect-in-progress has completed. Must be called only after
    /// the fd reported write-readiness.
    pub fn connect_poll(&self) -> ConnectPoll {
        match self.sock.take_error() {
            Ok(None) => ConnectPoll::Connected,
            Ok(Some(e)) => ConnectPoll::Failed(TransportError::Connect(e)),
            Err(e) => ConnectPoll::Failed(TransportError::Connect(e)),
        }
    }

    /// Enqueue the `START_WAL_PUSH` query. Small and sized to a single kernel buffer,
    /// so sent with a short blocking write (spec §5).
    pub fn send_query(&mut self) -> Result<(), TransportError> {
        if !self.blocking_write(HANDSHAKE_QUERY) {
            return Err(TransportError::Io(io::Error::other(
                "short write sending START_WAL_PUSH",
            )));
        }
        Ok(())
    }

    /// Poll for the handshake acknowledgement (stands in for CopyBoth negotiation).
    pub fn get_query_result(&mut self) -> ExecResult {
        let mut buf = [0u8; 64];
        loop {
            match self.sock.read(&mut buf) {
                Ok(0) => return ExecResult::Failed(TransportError::Eof),
                Ok(n) => {
                    self.handshake_read_buf.extend_from_slice(&buf[..n]);
                    if self.handshake_read_buf.len() >= HANDSHAKE_ACK.len() {
                        // The peer may have pipelined its first frame right behind the
                        // ack in the same read; anything past the ack belongs to the
                        // frame stream, not the handshake.
                        let extra = self.handshake_read_buf.split_off(HANDSHAKE_ACK.len());
                        self.read_buf.extend_from_slice(&extra);
                        return if self.handshake_read_buf == HANDSHAKE_ACK {
                            ExecResult::CopyBothOk
                        } else {
                            ExecResult::UnexpectedOk
                        };
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return ExecResult::NeedInput,
                Err(e) => return ExecResult::Failed(TransportError::Io(e)),
            }
        }
    }

    /// Queue `payload` (a fully-formed message) for sending, framed with its length
    /// prefix, and attempt to write it without blocking.
    pub fn async_write(&mut self, payload: &[u8]) -> WriteOutcome {
        self.write_buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.write_buf.extend_from_slice(payload);
        match self.flush() {
            FlushOutcome::Complete => WriteOutcome::Ok,
            FlushOutcome::Partial => WriteOutcome::TryFlush,
            FlushOutcome::Failed(e) => WriteOutcome::Failed(e),
        }
    }

    /// Drain as much of the buffered writes as the socket accepts right now.
    pub fn flush(&mut self) -> FlushOutcome {
        while !self.write_buf.is_empty() {
            match self.sock.write(&self.write_buf) {
                Ok(0) => return FlushOutcome::Failed(TransportError::Eof),
                Ok(n) => {
                    self.write_buf.advance(n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return FlushOutcome::Partial,
                Err(e) => return FlushOutcome::Failed(TransportError::Io(e)),
            }
        }
        FlushOutcome::Complete
    }

    /// Synchronous write used only for small messages (greeting, vote request) per the
    /// single-threaded cooperative scheduling model (spec §5): loops until done,
    /// socket buffer full is treated as `false` (caller should retry via the async path).
    /// Unframed: only used for the fixed-size ASCII handshake query.
    pub fn blocking_write(&mut self, bytes: &[u8]) -> bool {
        let mut remaining = bytes;
        while !remaining.is_empty() {
            match self.sock.write(remaining) {
                Ok(0) => return false,
                Ok(n) => remaining = &remaining[n..],
                Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
                Err(_) => return false,
            }
        }
        true
    }

    /// Same framing as `async_write`, but blocks until fully sent. Used for the
    /// greeting and vote request, which are small enough to always land in one kernel
    /// buffer and are sent before there is any other traffic to interleave with.
    pub fn blocking_write_framed(&mut self, payload: &[u8]) -> bool {
        let mut framed = Vec::with_capacity(4 + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        framed.extend_from_slice(payload);
        self.blocking_write(&framed)
    }

    /// Pull one complete framed message out of the socket, if available.
    pub fn async_read(&mut self) -> ReadOutcome {
        let mut buf = [0u8; 16 * 1024];
        loop {
            if let Some(msg) = self.try_take_frame() {
                return ReadOutcome::ReadOk(msg);
            }
            match self.sock.read(&mut buf) {
                Ok(0) => return ReadOutcome::Failed(TransportError::Eof),
                Ok(n) => {
                    self.read_buf.extend_from_slice(&buf[..n]);
                    if let Some(msg) = self.try_take_frame() {
                        return ReadOutcome::ReadOk(msg);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return ReadOutcome::TryAgain,
                Err(e) => return ReadOutcome::Failed(TransportError::Io(e)),
            }
        }
    }

    fn try_take_frame(&mut self) -> Option<Bytes> {
        if self.read_buf.len() < 4 {
            return None;
        }
        let len = u32::from_le_bytes(self.read_buf[..4].try_into().unwrap()) as usize;
        if self.read_buf.len() < 4 + len {
            return None;
        }
        self.read_buf.advance(4);
        Some(self.read_buf.split_to(len).freeze())
    }

    pub fn has_pending_write(&self) -> bool {
        !self.write_buf.is_empty()
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

impl queen_io::epoll::Source for Connection {
    fn add(
        &self,
        epoll: &queen_io::epoll::Epoll,
        token: queen_io::epoll::Token,
        interest: queen_io::epoll::Ready,
        opts: queen_io::epoll::EpollOpt,
    ) -> io::Result<()> {
        self.as_raw_fd().add(epoll, token, interest, opts)
    }

    fn modify(
        &self,
        epoll: &queen_io::epoll::Epoll,
        token: queen_io::epoll::Token,
        interest: queen_io::epoll::Ready,
        opts: queen_io::epoll::EpollOpt,
    ) -> io::Result<()> {
        self.as_raw_fd().modify(epoll, token, interest, opts)
    }

    fn delete(&self, epoll: &queen_io::epoll::Epoll) -> io::Result<()> {
        self.as_raw_fd().delete(epoll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn frame_round_trips_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut query = [0u8; HANDSHAKE_QUERY.len()];
            sock.read_exact(&mut query).unwrap();
            assert_eq!(&query, HANDSHAKE_QUERY);
            sock.write_all(HANDSHAKE_ACK).unwrap();
            let payload = b"hello";
            sock.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            sock.write_all(payload).unwrap();
        });

        let mut conn = Connection::connect_start(addr).unwrap();
        // Nonblocking connect to loopback on the same host completes almost
        // immediately; poll until the kernel reports it.
        loop {
            match conn.connect_poll() {
                ConnectPoll::Connected => break,
                ConnectPoll::Failed(e) => panic!("connect failed: {e}"),
                ConnectPoll::NeedRead | ConnectPoll::NeedWrite => {
                    thread::yield_now();
                }
            }
        }
        conn.send_query().unwrap();
        loop {
            match conn.get_query_result() {
                ExecResult::CopyBothOk => break,
                ExecResult::NeedInput => thread::yield_now(),
                ExecResult::UnexpectedOk => panic!("unexpected handshake reply"),
                ExecResult::Failed(e) => panic!("handshake failed: {e}"),
            }
        }
        let msg = loop {
            match conn.async_read() {
                ReadOutcome::ReadOk(b) => break b,
                ReadOutcome::TryAgain => thread::yield_now(),
                ReadOutcome::Failed(e) => panic!("read failed: {e}"),
            }
        };
        assert_eq!(&msg[..], b"hello");
        server.join().unwrap();
    }
}

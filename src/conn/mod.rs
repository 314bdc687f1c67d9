//! Per-connection state machines (spec §4.3).
//!
//! Four small machines, one per role, sharing the socket mechanics in
//! [`RawSocket`] and the framing in [`crate::wire`]. Each machine only knows
//! how to drive its own I/O; matching a completed header against the node's
//! registries, and invoking user callbacks, is [`crate::node::Node`]'s job —
//! these modules hand back raw bytes and ask to be driven again.

pub mod service_client;
pub mod service_server;
pub mod topic_client;
pub mod topic_server;

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::debug;

use crate::error::{ConnError, WireError};
use crate::time::Millis;
use crate::wire::{self, CursorBuf};

/// Flags captured from the peer's handshake header (spec §3 Connection
/// descriptor).
#[derive(Debug, Clone, Copy, Default)]
pub struct HandshakeFlags {
    pub tcp_nodelay: bool,
    pub latching: bool,
    pub persistent: bool,
    pub probe: bool,
}

/// Per-connection tuning, supplied by [`crate::node::NodeConfig`].
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    pub inactivity_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_buffer_bytes: usize,
    pub socket_buf_bytes: Option<usize>,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(2),
            max_buffer_bytes: 16 * 1024 * 1024,
            socket_buf_bytes: None,
        }
    }
}

/// Sets kernel `SO_SNDBUF`/`SO_RCVBUF` on a mio `TcpStream`, mirroring the
/// teacher's `flux_network::tcp::set_socket_buf_size` byte-for-byte.
fn set_socket_buf_size(stream: &TcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// Non-blocking socket mechanics shared by every role: a growable read-cursor
/// buffer on the way in, a backlog queue on the way out. Grounded in the
/// teacher's `flux-network::tcp::TcpStream` (`rx_buf`/`send_backlog`/
/// `writable_armed`), generalized from its fixed frame shape to the
/// arbitrary header/payload phases this protocol needs.
pub struct RawSocket {
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    rx: CursorBuf,
    tx_backlog: VecDeque<Vec<u8>>,
    writable_armed: bool,
    max_buffer_bytes: usize,
}

impl RawSocket {
    pub fn new(
        stream: TcpStream,
        peer_addr: Option<SocketAddr>,
        max_buffer_bytes: usize,
        socket_buf_bytes: Option<usize>,
    ) -> Self {
        if let Some(size) = socket_buf_bytes {
            set_socket_buf_size(&stream, size);
        }
        Self { stream, peer_addr, rx: CursorBuf::new(), tx_backlog: VecDeque::new(), writable_armed: false, max_buffer_bytes }
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.stream, token, Interest::READABLE)
    }

    /// Registers a freshly issued non-blocking `connect()` for writable
    /// readiness, which mio fires once the connect completes (successfully
    /// or not).
    pub fn register_connecting(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        self.writable_armed = true;
        registry.register(&mut self.stream, token, Interest::WRITABLE)
    }

    /// Drops back to read-only interest once a pending connect resolves;
    /// [`Self::enqueue`] re-arms writable interest for the handshake write.
    pub fn reset_to_readable(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        self.writable_armed = false;
        registry.reregister(&mut self.stream, token, Interest::READABLE)
    }

    pub fn deregister(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    pub fn apply_nodelay(&mut self) {
        let _ = self.stream.set_nodelay(true);
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Reads everything currently available (non-blocking), appending to the
    /// inbound buffer. `Ok(true)` if at least one byte was read.
    pub fn fill(&mut self) -> Result<bool, ConnError> {
        let mut progressed = false;
        let mut scratch = [0u8; 4096];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => return Err(ConnError::PeerClosed),
                Ok(n) => {
                    if self.rx.total_len() + n > self.max_buffer_bytes {
                        return Err(ConnError::BufferCeilingExceeded(self.max_buffer_bytes));
                    }
                    self.rx.extend_from_slice(&scratch[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(progressed),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ConnError::Io(e)),
            }
        }
    }

    pub fn rx(&mut self) -> &mut CursorBuf {
        &mut self.rx
    }

    /// Attempts to assemble one length-prefixed frame from the inbound
    /// buffer, filling from the socket first. `Ok(None)` means more bytes are
    /// needed; the read cursor is left untouched (spec §8 property 2).
    pub fn try_read_frame(&mut self) -> Result<Option<Vec<u8>>, ConnError> {
        self.fill()?;
        match wire::read_frame(&mut self.rx) {
            Ok(body) => Ok(Some(body.to_vec())),
            Err(WireError::ShortFrame) => Ok(None),
            Err(other) => {
                unreachable!("read_frame only ever returns ShortFrame: {other:?}")
            }
        }
    }

    /// Same as [`Self::try_read_frame`] but additionally reads a leading
    /// `ok` byte (used by the service-caller response frame, spec §6).
    /// `Ok(None)` leaves the cursor untouched if the `ok` byte, the length
    /// prefix, or the body is not yet fully buffered.
    pub fn try_read_ok_frame(&mut self) -> Result<Option<(u8, Vec<u8>)>, ConnError> {
        self.fill()?;
        let unread = self.rx.unread();
        if unread.len() < 5 {
            return Ok(None);
        }
        let ok = unread[0];
        let len = u32::from_le_bytes(unread[1..5].try_into().unwrap()) as usize;
        if unread.len() < 5 + len {
            return Ok(None);
        }
        let body = unread[5..5 + len].to_vec();
        self.rx_advance_by(5 + len);
        Ok(Some((ok, body)))
    }

    fn rx_advance_by(&mut self, n: usize) {
        let saved = self.rx.save_cursor();
        self.rx.restore_cursor(saved + n);
    }

    /// Drops bytes already consumed by the read cursor, bounding memory use.
    pub fn compact_rx(&mut self) {
        self.rx.compact();
    }

    pub fn enqueue(&mut self, registry: &Registry, token: Token, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        self.tx_backlog.push_back(bytes);
        self.arm_writable(registry, token);
    }

    fn arm_writable(&mut self, registry: &Registry, token: Token) {
        if !self.writable_armed {
            if registry.reregister(&mut self.stream, token, Interest::READABLE | Interest::WRITABLE).is_ok() {
                self.writable_armed = true;
            }
        }
    }

    /// Flushes as much of the backlog as the socket accepts without
    /// blocking. `Ok(true)` once the backlog is fully drained.
    pub fn drain(&mut self, registry: &Registry, token: Token) -> Result<bool, ConnError> {
        while let Some(front) = self.tx_backlog.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return Err(ConnError::PeerClosed),
                Ok(n) if n == front.len() => {
                    self.tx_backlog.pop_front();
                }
                Ok(n) => {
                    front.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ConnError::Io(e)),
            }
        }
        if self.writable_armed {
            let _ = registry.reregister(&mut self.stream, token, Interest::READABLE);
            debug!("connection write backlog drained");
            self.writable_armed = false;
        }
        Ok(true)
    }

    pub fn has_pending_write(&self) -> bool {
        !self.tx_backlog.is_empty()
    }

    /// Checks the socket-level error left by a non-blocking `connect()`
    /// once it reports writable, mirroring the teacher's `maybe_reconnect`
    /// (`stream.take_error()`).
    pub fn connect_completed(&mut self) -> Result<(), ConnError> {
        match self.stream.take_error() {
            Ok(None) => Ok(()),
            Ok(Some(e)) => Err(ConnError::ConnectFailed(e)),
            Err(e) => Err(ConnError::ConnectFailed(e)),
        }
    }
}

/// Connects to `addr` without blocking; the caller registers the returned
/// stream for writable readiness to learn when the connect completes (or
/// fails), matching the teacher's `ConnectionManager::maybe_reconnect`.
pub fn connect_nonblocking(addr: SocketAddr) -> io::Result<TcpStream> {
    TcpStream::connect(addr)
}

/// True if elapsed time since `last_change_ms` exceeds `timeout`.
pub fn timed_out(now_ms: Millis, last_change_ms: Millis, timeout: Duration) -> bool {
    now_ms.saturating_sub(last_change_ms) >= timeout.as_millis() as Millis
}

//! Topic-server (publisher side) connection state machine (spec §4.3).
//!
//! `CONNECTING—(accepted)—→READING_HEADER_SIZE → READING_HEADER —(matched)→
//! WRITING_HEADER → WAIT_FOR_WRITING → START_WRITING → WRITING →
//! WAIT_FOR_WRITING (loop)`.

use mio::{Registry, Token};

use crate::conn::RawSocket;
use crate::error::ConnError;
use crate::registry::Index;
use crate::time::Millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    ReadingHeaderSize,
    ReadingHeader,
    WritingHeader,
    WaitForWriting,
    Writing,
}

/// One inbound connection from a subscriber, bound to a [`crate::registry::Publisher`].
pub struct Conn {
    sock: RawSocket,
    state: State,
    pub bound: Option<Index>,
    pub tcp_nodelay: bool,
    pub send_now: bool,
    last_change_ms: Millis,
}

impl Conn {
    pub fn new(sock: RawSocket, now_ms: Millis) -> Self {
        Self { sock, state: State::ReadingHeaderSize, bound: None, tcp_nodelay: false, send_now: false, last_change_ms: now_ms }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn last_change_ms(&self) -> Millis {
        self.last_change_ms
    }

    /// `WAIT_FOR_WRITING` is a legitimate indefinite wait, not a stalled read.
    pub fn is_timeout_exempt(&self) -> bool {
        self.state == State::WaitForWriting
    }

    pub fn socket_mut(&mut self) -> &mut RawSocket {
        &mut self.sock
    }

    pub fn socket(&self) -> &RawSocket {
        &self.sock
    }

    fn set_state(&mut self, state: State, now_ms: Millis) {
        self.state = state;
        self.last_change_ms = now_ms;
    }

    /// Drives the handshake-read phase. Returns the subscription header's raw
    /// body once a complete header block has arrived.
    pub fn poll_header(&mut self, now_ms: Millis) -> Result<Option<Vec<u8>>, ConnError> {
        debug_assert!(matches!(self.state, State::ReadingHeaderSize | State::ReadingHeader));
        match self.sock.try_read_frame()? {
            Some(body) => {
                self.sock.compact_rx();
                Ok(Some(body))
            }
            None => {
                self.state = if self.sock.rx().unread_len() < 4 { State::ReadingHeaderSize } else { State::ReadingHeader };
                self.last_change_ms = now_ms;
                Ok(None)
            }
        }
    }

    /// Called once the node has matched the subscription header against a
    /// publisher and built the publication header bytes to send back.
    pub fn begin_writing_header(&mut self, registry: &Registry, token: Token, bytes: Vec<u8>, now_ms: Millis) {
        if self.tcp_nodelay {
            self.sock.apply_nodelay();
        }
        self.sock.enqueue(registry, token, bytes);
        self.set_state(State::WritingHeader, now_ms);
    }

    /// Drives an in-progress write (either the publication header, or a
    /// queued payload). Returns `true` once the backlog has fully drained.
    pub fn poll_write(&mut self, registry: &Registry, token: Token) -> Result<bool, ConnError> {
        self.sock.drain(registry, token)
    }

    pub fn finish_header_write(&mut self, now_ms: Millis) {
        self.set_state(State::WaitForWriting, now_ms);
    }

    /// Enqueues a payload frame and transitions to `WRITING`. Called from
    /// `WAIT_FOR_WRITING` once `send_now` is set (spec's `START_WRITING`,
    /// folded into this call since it "transitions immediately").
    pub fn begin_writing_payload(&mut self, registry: &Registry, token: Token, frame: Vec<u8>, now_ms: Millis) {
        self.sock.enqueue(registry, token, frame);
        self.set_state(State::Writing, now_ms);
    }

    /// Called once a queued payload has been fully flushed; the per-message
    /// fanout refcount bookkeeping lives in the node coordinator.
    pub fn finish_payload_write(&mut self, now_ms: Millis) {
        self.send_now = false;
        self.set_state(State::WaitForWriting, now_ms);
    }
}

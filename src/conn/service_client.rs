//! Service-client (caller side) connection state machine (spec §4.3).
//!
//! `WAIT_FOR_CONNECTING → CONNECTING → WRITING_HEADER → READING_HEADER_SIZE →
//! READING_HEADER —(matched)→ WAIT_FOR_WRITING → START_WRITING (request) →
//! WRITING → READING_SIZE (ok byte + length) → READING (response) →
//! WAIT_FOR_WRITING (if persistent) or teardown.`
//!
//! As with [`crate::conn::topic_client`], `WAIT_FOR_CONNECTING` lives in the
//! node's reconnect queue, not in this struct.

use mio::{Registry, Token};

use crate::conn::RawSocket;
use crate::error::ConnError;
use crate::registry::Index;
use crate::time::Millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    WritingHeader,
    ReadingHeaderSize,
    ReadingHeader,
    WaitForWriting,
    Writing,
    ReadingSize,
    Reading,
}

pub struct Conn {
    sock: RawSocket,
    state: State,
    pub bound: Option<Index>,
    pub persistent: bool,
    last_change_ms: Millis,
}

impl Conn {
    pub fn new(sock: RawSocket, now_ms: Millis) -> Self {
        Self { sock, state: State::Connecting, bound: None, persistent: false, last_change_ms: now_ms }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn last_change_ms(&self) -> Millis {
        self.last_change_ms
    }

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

    pub fn poll_connect(&mut self) -> Result<(), ConnError> {
        debug_assert_eq!(self.state, State::Connecting);
        self.sock.connect_completed()
    }

    pub fn begin_writing_header(&mut self, registry: &Registry, token: Token, bytes: Vec<u8>, now_ms: Millis) {
        self.sock.enqueue(registry, token, bytes);
        self.set_state(State::WritingHeader, now_ms);
    }

    pub fn poll_write(&mut self, registry: &Registry, token: Token) -> Result<bool, ConnError> {
        self.sock.drain(registry, token)
    }

    pub fn finish_header_write(&mut self, now_ms: Millis) {
        self.set_state(State::WaitForWriting, now_ms);
    }

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

    /// Called once the node has validated the provision header against the
    /// caller's expectations; the connection is now ready to send a request
    /// whenever the caller's periodic callback fires.
    pub fn mark_matched(&mut self, now_ms: Millis) {
        self.set_state(State::WaitForWriting, now_ms);
    }

    /// Enqueues a request payload built by the caller's periodic callback
    /// and transitions to `WRITING` (folds in `START_WRITING`).
    pub fn begin_writing_request(&mut self, registry: &Registry, token: Token, frame: Vec<u8>, now_ms: Millis) {
        self.sock.enqueue(registry, token, frame);
        self.set_state(State::Writing, now_ms);
    }

    pub fn finish_request_write(&mut self, now_ms: Millis) {
        self.set_state(State::ReadingSize, now_ms);
    }

    /// Drives the response read (`ok` byte + length-prefixed payload).
    pub fn poll_response(&mut self, now_ms: Millis) -> Result<Option<(u8, Vec<u8>)>, ConnError> {
        debug_assert!(matches!(self.state, State::ReadingSize | State::Reading));
        match self.sock.try_read_ok_frame()? {
            Some((ok, body)) => {
                self.sock.compact_rx();
                Ok(Some((ok, body)))
            }
            None => {
                self.state = State::Reading;
                self.last_change_ms = now_ms;
                Ok(None)
            }
        }
    }

    /// `true` to loop back to `WAIT_FOR_WRITING` for another call
    /// (persistent connection); `false` if the node should tear this
    /// connection down.
    pub fn finish_response_read(&mut self, now_ms: Millis) -> bool {
        if self.persistent {
            self.set_state(State::WaitForWriting, now_ms);
            true
        } else {
            false
        }
    }
}

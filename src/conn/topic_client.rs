//! Topic-client (subscriber side) connection state machine (spec §4.3).
//!
//! `WAIT_FOR_CONNECTING → CONNECTING → WRITING_HEADER → READING_HEADER_SIZE →
//! READING_HEADER —(matched)→ READING_SIZE → READING —(payload delivered)→
//! READING_SIZE (loop)`.
//!
//! `WAIT_FOR_CONNECTING` itself is modeled as a scheduling entry in
//! [`crate::node::Node`]'s reconnect queue rather than a state of this struct
//! — a `Conn` only exists once a `connect()` has actually been issued.

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
    ReadingSize,
    Reading,
}

pub struct Conn {
    sock: RawSocket,
    state: State,
    pub bound: Option<Index>,
    last_change_ms: Millis,
}

impl Conn {
    pub fn new(sock: RawSocket, now_ms: Millis) -> Self {
        Self { sock, state: State::Connecting, bound: None, last_change_ms: now_ms }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn last_change_ms(&self) -> Millis {
        self.last_change_ms
    }

    pub fn is_timeout_exempt(&self) -> bool {
        false
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

    /// Called on the first writable event after `connect()`. An `Err` means
    /// the connect failed and the caller should schedule a reconnect;
    /// `Ok(())` means the caller should move on to `begin_writing_header`.
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
        self.set_state(State::ReadingHeaderSize, now_ms);
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

    pub fn begin_reading_payloads(&mut self, now_ms: Millis) {
        self.set_state(State::ReadingSize, now_ms);
    }

    /// Drives the steady-state payload stream. Returns a payload once fully
    /// assembled; the loop re-enters `READING_SIZE` automatically.
    pub fn poll_payload(&mut self, now_ms: Millis) -> Result<Option<Vec<u8>>, ConnError> {
        debug_assert!(matches!(self.state, State::ReadingSize | State::Reading));
        match self.sock.try_read_frame()? {
            Some(body) => {
                self.sock.compact_rx();
                self.set_state(State::ReadingSize, now_ms);
                Ok(Some(body))
            }
            None => {
                self.state = if self.sock.rx().unread_len() < 4 { State::ReadingSize } else { State::Reading };
                self.last_change_ms = now_ms;
                Ok(None)
            }
        }
    }
}

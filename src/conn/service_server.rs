//! Service-server (provider side) connection state machine (spec §4.3).
//!
//! `CONNECTING—(accepted)—→READING_HEADER_SIZE → READING_HEADER —(matched,
//! not probe)→ WRITING_HEADER → READING_SIZE → READING —(request processed)→
//! WRITING (response) → READING_SIZE (loop, persistent) or teardown
//! (non-persistent). If probe: WRITING_HEADER → teardown.`

use mio::{Registry, Token};

use crate::conn::RawSocket;
use crate::error::ConnError;
use crate::registry::Index;
use crate::time::Millis;
use crate::wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    ReadingHeaderSize,
    ReadingHeader,
    WritingHeader,
    ReadingSize,
    Reading,
    Writing,
}

/// Outcome of flushing the provision/probe-reply header (spec's probe edge
/// case: "no request payload is read; no user callback is invoked").
pub enum HeaderWriteOutcome {
    ProbeComplete,
    AwaitRequest,
}

pub struct Conn {
    sock: RawSocket,
    state: State,
    pub bound: Option<Index>,
    pub probe: bool,
    pub persistent: bool,
    last_change_ms: Millis,
}

impl Conn {
    pub fn new(sock: RawSocket, now_ms: Millis) -> Self {
        Self { sock, state: State::ReadingHeaderSize, bound: None, probe: false, persistent: false, last_change_ms: now_ms }
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

    /// Called once the node has matched the service-call (or probe) header
    /// and built the provision header bytes.
    pub fn begin_writing_header(&mut self, registry: &Registry, token: Token, bytes: Vec<u8>, now_ms: Millis) {
        self.sock.enqueue(registry, token, bytes);
        self.set_state(State::WritingHeader, now_ms);
    }

    pub fn poll_write(&mut self, registry: &Registry, token: Token) -> Result<bool, ConnError> {
        self.sock.drain(registry, token)
    }

    pub fn finish_header_write(&mut self, now_ms: Millis) -> HeaderWriteOutcome {
        if self.probe {
            HeaderWriteOutcome::ProbeComplete
        } else {
            self.set_state(State::ReadingSize, now_ms);
            HeaderWriteOutcome::AwaitRequest
        }
    }

    /// Drives the request-payload read. Returns the request body once fully
    /// assembled.
    pub fn poll_request(&mut self, now_ms: Millis) -> Result<Option<Vec<u8>>, ConnError> {
        debug_assert!(matches!(self.state, State::ReadingSize | State::Reading));
        match self.sock.try_read_frame()? {
            Some(body) => {
                self.sock.compact_rx();
                Ok(Some(body))
            }
            None => {
                self.state = if self.sock.rx().unread_len() < 4 { State::ReadingSize } else { State::Reading };
                self.last_change_ms = now_ms;
                Ok(None)
            }
        }
    }

    /// Enqueues the RPCROS response frame `ok | u32(len) | payload` (spec §6).
    pub fn begin_writing_response(&mut self, registry: &Registry, token: Token, ok: bool, payload: &[u8], now_ms: Millis) {
        let mut frame = Vec::with_capacity(5 + payload.len());
        frame.push(ok as u8);
        wire::write_payload(&mut frame, payload);
        self.sock.enqueue(registry, token, frame);
        self.set_state(State::Writing, now_ms);
    }

    /// `true` to loop back to `READING_SIZE` for another call (persistent
    /// connection); `false` if the node should tear this connection down.
    pub fn finish_response_write(&mut self, now_ms: Millis) -> bool {
        if self.persistent {
            self.set_state(State::ReadingSize, now_ms);
            true
        } else {
            false
        }
    }
}

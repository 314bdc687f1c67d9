//! Frame codec (spec §4.1): the two wire primitives shared by TCPROS and
//! RPCROS — a little-endian `u32` length prefix, and a length-prefixed
//! header block made of length-prefixed `"key=value"` fields.
//!
//! The codec never interprets field semantics; that's [`crate::header`]'s
//! job.

use crate::error::WireError;

/// An explicit `{bytes, read_cursor, write_cursor}` value object, replacing
/// the source's raw pointer-cursor bookkeeping (`DynBuffer`) per design
/// note §9. `read_cursor` only ever advances when a full primitive (a
/// frame length, a frame body) has been consumed; a `ShortFrame` leaves it
/// untouched so the caller can append more bytes and retry.
#[derive(Default)]
pub struct CursorBuf {
    bytes: Vec<u8>,
    read_cursor: usize,
}

impl CursorBuf {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Bytes not yet consumed by the read cursor.
    #[inline]
    pub fn unread(&self) -> &[u8] {
        &self.bytes[self.read_cursor..]
    }

    #[inline]
    pub fn unread_len(&self) -> usize {
        self.bytes.len() - self.read_cursor
    }

    #[inline]
    pub fn total_len(&self) -> usize {
        self.bytes.len()
    }

    /// Drops already-consumed bytes, compacting the buffer. Call between
    /// frames to bound memory use of long-lived connections.
    pub fn compact(&mut self) {
        if self.read_cursor == 0 {
            return;
        }
        self.bytes.drain(..self.read_cursor);
        self.read_cursor = 0;
    }

    /// Save/restore points bracketing a matcher call, mirroring the source's
    /// `dynBufferGetPoseIndicatorOffset`/`dynBufferSetPoseIndicator` pair:
    /// the matcher is given a fully-buffered header to inspect, and on
    /// failure the cursor must end up exactly where it would have if the
    /// matcher had never run.
    #[inline]
    pub fn save_cursor(&self) -> usize {
        self.read_cursor
    }

    #[inline]
    pub fn restore_cursor(&mut self, saved: usize) {
        self.read_cursor = saved;
    }

    #[inline]
    fn advance(&mut self, n: usize) {
        self.read_cursor += n;
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.read_cursor = 0;
    }
}

/// Reads 4 bytes from `buf`'s cursor and returns their little-endian value.
/// Does not advance the cursor on `ShortFrame`.
pub fn read_u32(buf: &mut CursorBuf) -> Result<u32, WireError> {
    if buf.unread_len() < 4 {
        return Err(WireError::ShortFrame);
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf.unread()[..4]);
    buf.advance(4);
    Ok(u32::from_le_bytes(raw))
}

/// Reads a `u32` length `n` followed by `n` bytes, returning a borrowed view
/// and advancing the cursor past it. On `ShortFrame`, no bytes are
/// consumed (including the length prefix) so the caller can retry once more
/// data has arrived.
pub fn read_frame<'a>(buf: &'a mut CursorBuf) -> Result<&'a [u8], WireError> {
    let saved = buf.save_cursor();
    let n = match read_u32(buf) {
        Ok(n) => n as usize,
        Err(e) => {
            buf.restore_cursor(saved);
            return Err(e);
        }
    };
    if buf.unread_len() < n {
        buf.restore_cursor(saved);
        return Err(WireError::ShortFrame);
    }
    let start = buf.read_cursor;
    buf.advance(n);
    Ok(&buf.bytes[start..start + n])
}

/// Appends `u32(len(key)+1+len(value))` then `key`, `=`, then `value`.
pub fn write_field(out: &mut Vec<u8>, key: &str, value: &[u8]) {
    let field_len = key.len() + 1 + value.len();
    out.extend_from_slice(&(field_len as u32).to_le_bytes());
    out.extend_from_slice(key.as_bytes());
    out.push(b'=');
    out.extend_from_slice(value);
}

/// Reserves 4 bytes for the total header length, writes `fields` in order
/// via `write_field`, then back-patches the total length.
pub fn write_header<'a>(out: &mut Vec<u8>, fields: impl IntoIterator<Item = (&'a str, &'a [u8])>) {
    let len_pos = out.len();
    out.extend_from_slice(&0u32.to_le_bytes());
    let body_start = out.len();
    for (key, value) in fields {
        write_field(out, key, value);
    }
    let body_len = (out.len() - body_start) as u32;
    out[len_pos..len_pos + 4].copy_from_slice(&body_len.to_le_bytes());
}

/// Appends `u32(len)` then `bytes`.
pub fn write_payload(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_field_header() {
        // write_header's output is itself a valid read_frame: u32 total_len
        // followed by that many bytes of field data.
        let mut out = Vec::new();
        write_header(&mut out, [("callerid", b"/talker".as_slice())]);

        let mut buf = CursorBuf::new();
        buf.extend_from_slice(&out);
        let body = read_frame(&mut buf).unwrap();
        assert_eq!(body, b"callerid=/talker");
    }

    #[test]
    fn read_frame_is_short_read_idempotent() {
        let mut out = Vec::new();
        write_payload(&mut out, b"hello world");

        for split in 0..out.len() {
            let mut buf = CursorBuf::new();
            buf.extend_from_slice(&out[..split]);
            let saved = buf.save_cursor();
            let err = read_frame(&mut buf);
            if split < out.len() {
                assert_eq!(err, Err(WireError::ShortFrame));
                assert_eq!(buf.save_cursor(), saved, "cursor must not move on short read");
            }
        }

        let mut buf = CursorBuf::new();
        buf.extend_from_slice(&out);
        assert_eq!(read_frame(&mut buf).unwrap(), b"hello world");
    }

    #[test]
    fn write_payload_round_trips() {
        let mut out = Vec::new();
        write_payload(&mut out, &[1, 2, 3, 4, 5]);
        let mut buf = CursorBuf::new();
        buf.extend_from_slice(&out);
        assert_eq!(read_frame(&mut buf).unwrap(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn write_header_back_patches_total_length() {
        let mut out = Vec::new();
        write_header(
            &mut out,
            [("callerid", b"/talker".as_slice()), ("topic", b"/chatter".as_slice())],
        );
        let mut buf = CursorBuf::new();
        buf.extend_from_slice(&out);
        let total = read_u32(&mut buf).unwrap() as usize;
        assert_eq!(total, out.len() - 4);
    }
}

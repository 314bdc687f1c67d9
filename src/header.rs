//! Header field vocabulary, parsing, and the handshake matcher (spec §4.2).
//!
//! A [`Header`] is an unordered collection of at most one value per
//! [`Key`]. Field values are opaque UTF-8 byte strings on the wire; this
//! crate stores them as `String` once decoded.

use std::collections::HashMap;

use crate::error::{HandshakeError, WireError};
use crate::wire::{self, CursorBuf};

/// The fixed key vocabulary (spec §3). Unknown keys are a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    CallerId,
    Topic,
    Type,
    Md5sum,
    MessageDefinition,
    TcpNodelay,
    Latching,
    Persistent,
    Probe,
    Service,
    RequestType,
    ResponseType,
    Error,
}

impl Key {
    fn as_str(self) -> &'static str {
        match self {
            Key::CallerId => "callerid",
            Key::Topic => "topic",
            Key::Type => "type",
            Key::Md5sum => "md5sum",
            Key::MessageDefinition => "message_definition",
            Key::TcpNodelay => "tcp_nodelay",
            Key::Latching => "latching",
            Key::Persistent => "persistent",
            Key::Probe => "probe",
            Key::Service => "service",
            Key::RequestType => "request_type",
            Key::ResponseType => "response_type",
            Key::Error => "error",
        }
    }

    fn from_str(s: &str) -> Option<Key> {
        Some(match s {
            "callerid" => Key::CallerId,
            "topic" => Key::Topic,
            "type" => Key::Type,
            "md5sum" => Key::Md5sum,
            "message_definition" => Key::MessageDefinition,
            "tcp_nodelay" => Key::TcpNodelay,
            "latching" => Key::Latching,
            "persistent" => Key::Persistent,
            "probe" => Key::Probe,
            "service" => Key::Service,
            "request_type" => Key::RequestType,
            "response_type" => Key::ResponseType,
            "error" => Key::Error,
            _ => return None,
        })
    }
}

/// The empty-md5sum sentinel recognized distinctly from a normal md5sum
/// (spec §3), used by service probes.
pub const MD5_SENTINEL: &str = "*";

#[derive(Debug, Default, Clone)]
pub struct Header {
    fields: HashMap<Key, String>,
}

impl Header {
    pub fn get(&self, key: Key) -> Option<&str> {
        self.fields.get(&key).map(String::as_str)
    }

    pub fn has(&self, key: Key) -> bool {
        self.fields.contains_key(&key)
    }

    pub fn is_flag_set(&self, key: Key) -> bool {
        self.get(key) == Some("1")
    }

    pub fn insert(&mut self, key: Key, value: String) {
        self.fields.insert(key, value);
    }

    /// True when `md5sum` is present and equals the sentinel `"*"`.
    pub fn md5_is_sentinel(&self) -> bool {
        self.get(Key::Md5sum) == Some(MD5_SENTINEL)
    }
}

/// Decodes a header block's body (the bytes after the outer `u32
/// total_len`, i.e. what [`crate::wire::read_frame`] hands back) into a
/// [`Header`]. Duplicate or unknown keys are `WireError`s, matching spec
/// §4.2 ("Duplicate keys ... are a protocol error. Unknown keys are a
/// protocol error").
pub fn decode_header_body(body: &[u8]) -> Result<Header, WireError> {
    let mut cursor = CursorBuf::new();
    cursor.extend_from_slice(body);

    let mut header = Header::default();
    while cursor.unread_len() > 0 {
        let field = wire::read_frame(&mut cursor)
            .map_err(|_| WireError::MalformedField("field length exceeds header body".into()))?;

        let eq = field
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| WireError::MalformedField("missing '=' in field".into()))?;
        let key_str = std::str::from_utf8(&field[..eq])
            .map_err(|_| WireError::MalformedField("key is not UTF-8".into()))?;
        let value = String::from_utf8(field[eq + 1..].to_vec())
            .map_err(|_| WireError::MalformedField("value is not UTF-8".into()))?;

        let key = Key::from_str(key_str).ok_or_else(|| WireError::UnknownKey(key_str.to_string()))?;
        if header.has(key) {
            return Err(WireError::DuplicateKey(key_str.to_string()));
        }
        header.insert(key, value);
    }
    Ok(header)
}

/// Encodes a full header block (the `u32 total_len` frame plus its fields)
/// from an ordered field list. Field order is preserved exactly as given,
/// matching the order publishers/subscribers/service roles build theirs in.
pub fn encode_header(fields: &[(Key, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    wire::write_header(&mut out, fields.iter().map(|(k, v)| (k.as_str(), v.as_bytes())));
    out
}

fn require(header: &Header, key: Key) -> Result<&str, HandshakeError> {
    header.get(key).ok_or(HandshakeError::MissingField(key.as_str()))
}

/// Required-field validation for the subscription header (inbound to a
/// publisher): `callerid, topic, md5sum, type`.
pub fn validate_subscription_header(header: &Header) -> Result<(), HandshakeError> {
    require(header, Key::CallerId)?;
    require(header, Key::Topic)?;
    require(header, Key::Md5sum)?;
    require(header, Key::Type)?;
    Ok(())
}

/// Required-field validation for the publication header (inbound to a
/// subscriber): `callerid, md5sum, type`. `topic` is not required — see
/// `MatchStrictness` in [`crate::node`] for the open question this leaves.
pub fn validate_publication_header(header: &Header) -> Result<(), HandshakeError> {
    require(header, Key::CallerId)?;
    require(header, Key::Md5sum)?;
    require(header, Key::Type)?;
    Ok(())
}

/// Required-field validation for a service call header (standard or
/// "matlab" variant, inbound to a service provider). The standard variant
/// requires `callerid, service, md5sum, type`; the matlab variant omits
/// `type`. Either is accepted here; the caller decides which fields it
/// actually needed once matched.
pub fn validate_service_call_header(header: &Header) -> Result<(), HandshakeError> {
    require(header, Key::CallerId)?;
    require(header, Key::Service)?;
    require(header, Key::Md5sum)?;
    Ok(())
}

/// True when a parsed service-call header is a probe: `md5sum == "*"` and
/// `probe == "1"`.
pub fn is_service_probe(header: &Header) -> bool {
    header.md5_is_sentinel() && header.is_flag_set(Key::Probe)
}

/// Required-field validation for the service-provision header (inbound to a
/// service caller): `callerid, md5sum, type`.
pub fn validate_service_provision_header(header: &Header) -> Result<(), HandshakeError> {
    require(header, Key::CallerId)?;
    require(header, Key::Md5sum)?;
    require(header, Key::Type)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_all_fields_of_a_subscription_header() {
        let body = {
            let mut out = Vec::new();
            wire::write_header(
                &mut out,
                [
                    ("callerid", b"/listener".as_slice()),
                    ("topic", b"/chatter".as_slice()),
                    ("md5sum", b"992ce8a1687cec8c8bd883ec73ca41d1".as_slice()),
                    ("type", b"std_msgs/String".as_slice()),
                ],
            );
            // strip the outer length prefix: decode_header_body expects the
            // *body*, same bytes `wire::read_frame` would hand back.
            out[4..].to_vec()
        };
        let header = decode_header_body(&body).unwrap();
        assert_eq!(header.get(Key::CallerId), Some("/listener"));
        assert_eq!(header.get(Key::Topic), Some("/chatter"));
        assert_eq!(header.get(Key::Md5sum), Some("992ce8a1687cec8c8bd883ec73ca41d1"));
        assert_eq!(header.get(Key::Type), Some("std_msgs/String"));
        validate_subscription_header(&header).unwrap();
    }

    #[test]
    fn rejects_duplicate_keys() {
        let mut out = Vec::new();
        wire::write_header(
            &mut out,
            [("callerid", b"/a".as_slice()), ("callerid", b"/b".as_slice())],
        );
        let err = decode_header_body(&out[4..]).unwrap_err();
        assert_eq!(err, WireError::DuplicateKey("callerid".into()));
    }

    #[test]
    fn rejects_unknown_keys() {
        let mut out = Vec::new();
        wire::write_header(&mut out, [("bogus_key", b"x".as_slice())]);
        let err = decode_header_body(&out[4..]).unwrap_err();
        assert_eq!(err, WireError::UnknownKey("bogus_key".into()));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let mut out = Vec::new();
        wire::write_header(&mut out, [("callerid", b"/listener".as_slice())]);
        let header = decode_header_body(&out[4..]).unwrap();
        assert!(validate_subscription_header(&header).is_err());
    }

    #[test]
    fn recognizes_the_md5_sentinel_and_probe_flag() {
        let mut out = Vec::new();
        wire::write_header(
            &mut out,
            [
                ("callerid", b"/caller".as_slice()),
                ("service", b"/sum".as_slice()),
                ("md5sum", b"*".as_slice()),
                ("probe", b"1".as_slice()),
            ],
        );
        let header = decode_header_body(&out[4..]).unwrap();
        assert!(header.md5_is_sentinel());
        assert!(is_service_probe(&header));
    }
}

//! Wire records.
//!
//! Everything that crosses the relay is one record: {sender, receiver,
//! kind, payload}. The payload is a tagged map, record-encoded into the
//! `content` field of an outer 4-field map which is record-encoded again
//! for the stream. The relay routes on the outer fields only.

use std::collections::BTreeMap;

use crate::error::ProtoError;
use crate::value::{decode_record_map, encode_record_map, Value};

/// Reserved receiver name for the relay itself.
pub const SERVER_NAME: &str = "server";

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";
pub const STATUS_REQUEST: &str = "request";
pub const STATUS_REGISTERED: &str = "registered";
pub const STATUS_NOT_REGISTERED: &str = "not_registered";

/// ASCII alphanumeric, 1 to 16 characters.
pub fn check_username(name: &str) -> bool {
    !name.is_empty() && name.len() <= 16 && name.bytes().all(|b| b.is_ascii_alphanumeric())
}

// ── Kind ─────────────────────────────────────────────────────────────────────

/// Every record kind in the protocol, bijective with its wire string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Message,
    Register,
    Login,
    StatusRequest,
    Identity,
    NotRegistered,
    Registered,
    RequestSalt,
    AnswerSalt,
    Error,
    Success,
    Request,
    X3dhRequest,
    X3dhReaction,
    X3dhKeys,
    Reset,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Message => "message",
            Kind::Register => "register",
            Kind::Login => "login",
            Kind::StatusRequest => "status_request",
            Kind::Identity => "identity",
            Kind::NotRegistered => "not_registered",
            Kind::Registered => "registered",
            Kind::RequestSalt => "request_salt",
            Kind::AnswerSalt => "answer_salt",
            Kind::Error => "error",
            Kind::Success => "success",
            Kind::Request => "request",
            Kind::X3dhRequest => "x3dh_request",
            Kind::X3dhReaction => "x3dh_reaction",
            Kind::X3dhKeys => "x3dh_keys",
            Kind::Reset => "reset",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "message" => Kind::Message,
            "register" => Kind::Register,
            "login" => Kind::Login,
            "status_request" => Kind::StatusRequest,
            "identity" => Kind::Identity,
            "not_registered" => Kind::NotRegistered,
            "registered" => Kind::Registered,
            "request_salt" => Kind::RequestSalt,
            "answer_salt" => Kind::AnswerSalt,
            "error" => Kind::Error,
            "success" => Kind::Success,
            "request" => Kind::Request,
            "x3dh_request" => Kind::X3dhRequest,
            "x3dh_reaction" => Kind::X3dhReaction,
            "x3dh_keys" => Kind::X3dhKeys,
            "reset" => Kind::Reset,
            _ => return None,
        })
    }
}

// ── Record ───────────────────────────────────────────────────────────────────

pub type Payload = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub sender: String,
    pub receiver: String,
    pub kind: Kind,
    pub payload: Payload,
}

impl Record {
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        kind: Kind,
        payload: Payload,
    ) -> Self {
        Self { sender: sender.into(), receiver: receiver.into(), kind, payload }
    }

    /// Full wire form (without the stream length prefix).
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        let content = encode_record_map(&self.payload)?;
        let outer = BTreeMap::from([
            ("content".to_string(), Value::Bytes(content)),
            ("kind".to_string(), Value::Str(self.kind.as_str().to_string())),
            ("receiver".to_string(), Value::Str(self.receiver.clone())),
            ("sender".to_string(), Value::Str(self.sender.clone())),
        ]);
        encode_record_map(&outer)
    }

    /// Decode and validate a wire record. Unknown kinds and malformed
    /// fields are errors; callers drop the connection on any of them.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtoError> {
        let outer = decode_record_map(data)?;

        let take_str = |name: &'static str| -> Result<String, ProtoError> {
            outer
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(ProtoError::MissingField(name))
        };

        let sender = take_str("sender")?;
        let receiver = take_str("receiver")?;
        let kind_name = take_str("kind")?;
        let kind = Kind::parse(&kind_name).ok_or(ProtoError::UnknownKind(kind_name))?;
        let content = outer
            .get("content")
            .and_then(Value::as_bytes)
            .ok_or(ProtoError::MissingField("content"))?;
        let payload = decode_record_map(content)?;

        let record = Self { sender, receiver, kind, payload };
        if !record.is_valid() {
            return Err(ProtoError::Malformed("invalid sender or receiver".into()));
        }
        Ok(record)
    }

    /// Sender and receiver must be valid usernames; the receiver may also
    /// be the reserved relay name.
    pub fn is_valid(&self) -> bool {
        check_username(&self.sender)
            && (self.receiver == SERVER_NAME || check_username(&self.receiver))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn status(&self) -> Option<&str> {
        self.get("status").and_then(Value::as_str)
    }

    pub fn error_text(&self) -> &str {
        self.get("error").and_then(Value::as_str).unwrap_or("unspecified")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::compress;

    #[test]
    fn kind_strings_are_bijective() {
        let kinds = [
            Kind::Message, Kind::Register, Kind::Login, Kind::StatusRequest,
            Kind::Identity, Kind::NotRegistered, Kind::Registered, Kind::RequestSalt,
            Kind::AnswerSalt, Kind::Error, Kind::Success, Kind::Request,
            Kind::X3dhRequest, Kind::X3dhReaction, Kind::X3dhKeys, Kind::Reset,
        ];
        for kind in kinds {
            assert_eq!(Kind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(Kind::parse("forward"), None);
    }

    #[test]
    fn username_rules() {
        assert!(check_username("alice"));
        assert!(check_username("B0b"));
        assert!(check_username("server"));
        assert!(!check_username(""));
        assert!(!check_username("a".repeat(17).as_str()));
        assert!(!check_username("al ice"));
        assert!(!check_username("al.ice"));
    }

    #[test]
    fn record_roundtrip() {
        let record = Record::new(
            "alice",
            SERVER_NAME,
            Kind::X3dhRequest,
            BTreeMap::from([("target".to_string(), Value::from("bob"))]),
        );
        let decoded = Record::from_bytes(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn records_nest_inside_payloads() {
        let inner = Record::new("alice", "bob", Kind::Message, BTreeMap::new());
        let outer = Record::new(
            "server",
            "bob",
            Kind::Message,
            BTreeMap::from([("queued".to_string(), Value::from(inner.clone()))]),
        );
        let decoded = Record::from_bytes(&outer.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.get("queued").unwrap().as_record().unwrap(), &inner);
    }

    #[test]
    fn invalid_records_are_rejected() {
        let bad_sender = Record::new("not valid!", "server", Kind::Message, BTreeMap::new());
        assert!(Record::from_bytes(&bad_sender.to_bytes().unwrap()).is_err());

        assert!(Record::from_bytes(&compress(b"{}")).is_err());
        assert!(Record::from_bytes(b"\x00\x01").is_err());
    }
}

//! Self-describing tagged values.
//!
//! Two grammars share one tag set:
//!
//! - **Record encoding** (wire frames, store blobs): a JSON object whose
//!   values are all tagged strings `"<TAG>:<payload>"`, UTF-8 encoded and
//!   zlib-compressed.
//! - **Composite encoding** (a dict or list *inside* a tagged value):
//!   dict → `key:TAG:payload|key:TAG:payload|…`, list → `TAG:payload;…`.
//!
//! Tags: `N` null, `S` string, `B` bool, `I` integer, `Y` bytes (hex),
//! `SK` signing key (scalar hex), `VK` verifying key (SEC1 compressed hex),
//! `D` dict, `L` list, `M` record (wire bytes hex), `DRS` ratchet state
//! (composite dict of its fields). Unknown tags fall back to plain JSON
//! under `U`.
//!
//! The composite delimiters `|` and `;` cannot appear inside composite
//! atoms, and keys cannot contain `:`. Encoding rejects values that would
//! violate this instead of producing ambiguous bytes; in practice every
//! nested atom is hex, decimal or an alphanumeric name. Composites do not
//! nest; deep structures belong to the store's JSON document form.
//!
//! Decoding is total: attacker-chosen input yields `Err`, never a panic.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use qw_crypto::primitives::{
    canonical_public, signing_key_from_bytes, signing_key_to_bytes, verifying_key_from_sec1,
    SigningKey, VerifyingKey,
};
use qw_crypto::ratchet::{RatchetState, Sender};

use crate::error::ProtoError;
use crate::record::Record;

/// Upper bound on a decompressed record body; bounds zlib expansion.
pub const MAX_RECORD_BYTES: usize = 256 * 1024;

// ── Value ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Str(String),
    Bool(bool),
    Int(i64),
    Bytes(Vec<u8>),
    Signing(SigningKey),
    Verifying(VerifyingKey),
    Dict(BTreeMap<String, Value>),
    List(Vec<Value>),
    Record(Box<Record>),
    Ratchet(RatchetState),
    /// Fallback for unknown tags; round-trips as plain JSON.
    Json(serde_json::Value),
}

impl Value {
    pub fn tag(&self) -> &'static str {
        match self {
            Value::Null => "N",
            Value::Str(_) => "S",
            Value::Bool(_) => "B",
            Value::Int(_) => "I",
            Value::Bytes(_) => "Y",
            Value::Signing(_) => "SK",
            Value::Verifying(_) => "VK",
            Value::Dict(_) => "D",
            Value::List(_) => "L",
            Value::Record(_) => "M",
            Value::Ratchet(_) => "DRS",
            Value::Json(_) => "U",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_signing(&self) -> Option<&SigningKey> {
        match self {
            Value::Signing(k) => Some(k),
            _ => None,
        }
    }

    pub fn as_verifying(&self) -> Option<&VerifyingKey> {
        match self {
            Value::Verifying(k) => Some(k),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_dict_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_ratchet(&self) -> Option<&RatchetState> {
        match self {
            Value::Ratchet(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_ratchet_mut(&mut self) -> Option<&mut RatchetState> {
        match self {
            Value::Ratchet(r) => Some(r),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Signing(a), Value::Signing(b)) => {
                signing_key_to_bytes(a) == signing_key_to_bytes(b)
            }
            (Value::Verifying(a), Value::Verifying(b)) => {
                canonical_public(a) == canonical_public(b)
            }
            (Value::Dict(a), Value::Dict(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Ratchet(a), Value::Ratchet(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<SigningKey> for Value {
    fn from(v: SigningKey) -> Self {
        Value::Signing(v)
    }
}

impl From<VerifyingKey> for Value {
    fn from(v: VerifyingKey) -> Self {
        Value::Verifying(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Dict(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Value::Record(Box::new(v))
    }
}

impl From<RatchetState> for Value {
    fn from(v: RatchetState) -> Self {
        Value::Ratchet(v)
    }
}

// ── Tagged encoding ──────────────────────────────────────────────────────────

/// Encode one value as `TAG:payload`.
pub fn encode_value(value: &Value) -> Result<String, ProtoError> {
    Ok(format!("{}:{}", value.tag(), encode_payload(value, false)?))
}

fn encode_payload(value: &Value, nested: bool) -> Result<String, ProtoError> {
    match value {
        Value::Null => Ok(String::new()),
        Value::Str(s) => {
            if nested && (s.contains('|') || s.contains(';')) {
                return Err(ProtoError::Unencodable(
                    "string atom contains a composite delimiter".into(),
                ));
            }
            Ok(s.clone())
        }
        Value::Bool(b) => Ok(if *b { "1" } else { "0" }.to_string()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Bytes(b) => Ok(hex::encode(b)),
        Value::Signing(k) => Ok(hex::encode(signing_key_to_bytes(k))),
        Value::Verifying(k) => Ok(hex::encode(canonical_public(k))),
        Value::Record(r) => Ok(hex::encode(r.to_bytes()?)),
        Value::Dict(d) => {
            if nested {
                return Err(ProtoError::Unencodable("composites do not nest".into()));
            }
            encode_composite_dict(d)
        }
        Value::List(l) => {
            if nested {
                return Err(ProtoError::Unencodable("composites do not nest".into()));
            }
            encode_composite_list(l)
        }
        Value::Ratchet(state) => {
            if nested {
                return Err(ProtoError::Unencodable("composites do not nest".into()));
            }
            encode_composite_dict(&ratchet_to_dict(state))
        }
        Value::Json(v) => {
            let json = serde_json::to_string(v)?;
            if nested && (json.contains('|') || json.contains(';')) {
                return Err(ProtoError::Unencodable(
                    "JSON atom contains a composite delimiter".into(),
                ));
            }
            Ok(json)
        }
    }
}

/// Decode one `TAG:payload` string.
pub fn decode_value(encoded: &str) -> Result<Value, ProtoError> {
    let (tag, payload) = encoded
        .split_once(':')
        .ok_or_else(|| ProtoError::Malformed(format!("untagged value '{encoded}'")))?;
    match tag {
        "N" => Ok(Value::Null),
        "S" => Ok(Value::Str(payload.to_string())),
        "B" => {
            let n: i64 = payload
                .parse()
                .map_err(|_| ProtoError::Malformed(format!("bad bool '{payload}'")))?;
            Ok(Value::Bool(n != 0))
        }
        "I" => {
            let n: i64 = payload
                .parse()
                .map_err(|_| ProtoError::Malformed(format!("bad integer '{payload}'")))?;
            Ok(Value::Int(n))
        }
        "Y" => Ok(Value::Bytes(hex::decode(payload)?)),
        "SK" => Ok(Value::Signing(signing_key_from_bytes(&hex::decode(payload)?)?)),
        "VK" => Ok(Value::Verifying(verifying_key_from_sec1(&hex::decode(
            payload,
        )?)?)),
        "M" => Ok(Value::Record(Box::new(Record::from_bytes(&hex::decode(
            payload,
        )?)?))),
        "D" => Ok(Value::Dict(decode_composite_dict(payload)?)),
        "L" => Ok(Value::List(decode_composite_list(payload)?)),
        "DRS" => Ok(Value::Ratchet(ratchet_from_dict(&decode_composite_dict(
            payload,
        )?)?)),
        _ => {
            let parsed = serde_json::from_str(payload)
                .map_err(|_| ProtoError::Malformed(format!("unknown tag '{tag}'")))?;
            Ok(Value::Json(parsed))
        }
    }
}

// ── Composite encoding ───────────────────────────────────────────────────────

fn validate_key(key: &str) -> Result<(), ProtoError> {
    if key.is_empty() || key.contains(':') || key.contains('|') || key.contains(';') {
        return Err(ProtoError::Unencodable(format!("bad composite key '{key}'")));
    }
    Ok(())
}

fn encode_composite_dict(map: &BTreeMap<String, Value>) -> Result<String, ProtoError> {
    let mut out = String::new();
    for (key, value) in map {
        validate_key(key)?;
        out.push_str(key);
        out.push(':');
        out.push_str(value.tag());
        out.push(':');
        out.push_str(&encode_payload(value, true)?);
        out.push('|');
    }
    Ok(out)
}

fn decode_composite_dict(encoded: &str) -> Result<BTreeMap<String, Value>, ProtoError> {
    let mut map = BTreeMap::new();
    for item in encoded.split('|') {
        if item.is_empty() {
            continue;
        }
        let (key, tagged) = item
            .split_once(':')
            .ok_or_else(|| ProtoError::Malformed(format!("bad dict item '{item}'")))?;
        map.insert(key.to_string(), decode_value(tagged)?);
    }
    Ok(map)
}

fn encode_composite_list(list: &[Value]) -> Result<String, ProtoError> {
    let mut out = String::new();
    for value in list {
        out.push_str(value.tag());
        out.push(':');
        out.push_str(&encode_payload(value, true)?);
        out.push(';');
    }
    Ok(out)
}

fn decode_composite_list(encoded: &str) -> Result<Vec<Value>, ProtoError> {
    let mut list = Vec::new();
    for item in encoded.split(';') {
        if item.is_empty() {
            continue;
        }
        list.push(decode_value(item)?);
    }
    Ok(list)
}

// ── Ratchet state as a composite dict ────────────────────────────────────────

fn ratchet_to_dict(state: &RatchetState) -> BTreeMap<String, Value> {
    let opt_signing = |k: &Option<SigningKey>| match k {
        Some(k) => Value::Signing(k.clone()),
        None => Value::Null,
    };
    let opt_verifying = |k: &Option<VerifyingKey>| match k {
        Some(k) => Value::Verifying(k.clone()),
        None => Value::Null,
    };
    BTreeMap::from([
        ("x".to_string(), opt_signing(&state.x)),
        ("X".to_string(), opt_verifying(&state.x_pub)),
        ("Y".to_string(), opt_verifying(&state.y_pub)),
        ("ck".to_string(), Value::Bytes(state.ck.to_vec())),
        ("index".to_string(), Value::Int(i64::from(state.index))),
        (
            "last_sender".to_string(),
            Value::Str(state.last_sender.as_str().to_string()),
        ),
    ])
}

fn ratchet_from_dict(map: &BTreeMap<String, Value>) -> Result<RatchetState, ProtoError> {
    let field = |name: &'static str| {
        map.get(name)
            .ok_or(ProtoError::MissingField(name))
    };

    let ck_bytes = field("ck")?
        .as_bytes()
        .ok_or_else(|| ProtoError::Malformed("ratchet ck is not bytes".into()))?;
    let ck: [u8; 32] = ck_bytes
        .try_into()
        .map_err(|_| ProtoError::Malformed("ratchet ck is not 32 bytes".into()))?;

    let index = field("index")?
        .as_int()
        .and_then(|i| u32::try_from(i).ok())
        .ok_or_else(|| ProtoError::Malformed("ratchet index is not a u32".into()))?;

    let last_sender = field("last_sender")?
        .as_str()
        .and_then(Sender::parse)
        .ok_or_else(|| ProtoError::Malformed("ratchet last_sender is invalid".into()))?;

    let x = match field("x")? {
        Value::Null => None,
        Value::Signing(k) => Some(k.clone()),
        _ => return Err(ProtoError::Malformed("ratchet x has the wrong type".into())),
    };
    let x_pub = match field("X")? {
        Value::Null => None,
        Value::Verifying(k) => Some(k.clone()),
        _ => return Err(ProtoError::Malformed("ratchet X has the wrong type".into())),
    };
    let y_pub = match field("Y")? {
        Value::Null => None,
        Value::Verifying(k) => Some(k.clone()),
        _ => return Err(ProtoError::Malformed("ratchet Y has the wrong type".into())),
    };

    Ok(RatchetState { ck, x, x_pub, y_pub, index, last_sender })
}

// ── Record encoding (tagged JSON object, zlib compressed) ────────────────────

pub fn encode_record_map(map: &BTreeMap<String, Value>) -> Result<Vec<u8>, ProtoError> {
    let mut object = serde_json::Map::new();
    for (key, value) in map {
        object.insert(key.clone(), serde_json::Value::String(encode_value(value)?));
    }
    let json = serde_json::Value::Object(object).to_string();
    Ok(compress(json.as_bytes()))
}

pub fn decode_record_map(data: &[u8]) -> Result<BTreeMap<String, Value>, ProtoError> {
    let json = decompress(data, MAX_RECORD_BYTES)?;
    let parsed: serde_json::Value = serde_json::from_slice(&json)?;
    let object = parsed
        .as_object()
        .ok_or_else(|| ProtoError::Malformed("record body is not a JSON object".into()))?;
    let mut map = BTreeMap::new();
    for (key, value) in object {
        let tagged = value
            .as_str()
            .ok_or_else(|| ProtoError::Malformed(format!("field '{key}' is not tagged")))?;
        map.insert(key.clone(), decode_value(tagged)?);
    }
    Ok(map)
}

pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .expect("in-memory zlib writer cannot fail")
}

pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, ProtoError> {
    let mut out = Vec::new();
    let mut decoder = ZlibDecoder::new(data).take(limit as u64 + 1);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ProtoError::Malformed(format!("bad zlib stream: {e}")))?;
    if out.len() > limit {
        return Err(ProtoError::Oversized);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qw_crypto::primitives::generate_keypair;

    fn roundtrip(value: Value) {
        let encoded = encode_value(&value).unwrap();
        assert_eq!(decode_value(&encoded).unwrap(), value);
    }

    #[test]
    fn atoms_roundtrip() {
        roundtrip(Value::Null);
        roundtrip(Value::Str("alice".into()));
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
        roundtrip(Value::Int(-42));
        roundtrip(Value::Bytes(vec![0, 1, 2, 254, 255]));
        let (private, public) = generate_keypair();
        roundtrip(Value::Signing(private));
        roundtrip(Value::Verifying(public));
    }

    #[test]
    fn composites_roundtrip() {
        let (_, public) = generate_keypair();
        roundtrip(Value::Dict(BTreeMap::from([
            ("status".to_string(), Value::Str("success".into())),
            ("salt".to_string(), Value::Bytes(vec![9; 32])),
            ("SPK".to_string(), Value::Verifying(public)),
            ("count".to_string(), Value::Int(3)),
            ("gone".to_string(), Value::Null),
        ])));
        roundtrip(Value::List(vec![
            Value::Verifying(public),
            Value::Int(1),
            Value::Str("x".into()),
        ]));
    }

    #[test]
    fn ratchet_state_roundtrips() {
        let (sk, spk) = generate_keypair();
        let mut state = qw_crypto::ratchet::RatchetState::responder([3u8; 32], sk, spk);
        state.index = 7;
        roundtrip(Value::Ratchet(state));
    }

    #[test]
    fn encoding_is_deterministic() {
        let value = Value::Dict(BTreeMap::from([
            ("b".to_string(), Value::Int(2)),
            ("a".to_string(), Value::Str("one".into())),
        ]));
        assert_eq!(encode_value(&value).unwrap(), encode_value(&value).unwrap());
        let map = BTreeMap::from([("k".to_string(), value)]);
        assert_eq!(
            encode_record_map(&map).unwrap(),
            encode_record_map(&map).unwrap()
        );
    }

    #[test]
    fn unknown_tags_fall_back_to_json() {
        let decoded = decode_value("Q:[1,2,3]").unwrap();
        assert_eq!(decoded, Value::Json(serde_json::json!([1, 2, 3])));
        let reencoded = encode_value(&Value::Json(serde_json::json!({"a": 1}))).unwrap();
        assert!(reencoded.starts_with("U:"));
    }

    #[test]
    fn malformed_input_errors_without_panicking() {
        for input in [
            "", "noseparator", "I:", "I:abc", "B:maybe", "Y:zz", "SK:00", "VK:ffff",
            "M:00", "D:broken", "DRS:ck:Y:00|",
        ] {
            assert!(decode_value(input).is_err(), "accepted {input:?}");
        }
        assert!(decode_record_map(b"not zlib").is_err());
        assert!(decode_record_map(&compress(b"not json")).is_err());
        assert!(decode_record_map(&compress(b"[1,2]")).is_err());
    }

    #[test]
    fn delimiters_are_rejected_inside_composites() {
        let bad = Value::Dict(BTreeMap::from([(
            "note".to_string(),
            Value::Str("a|b".into()),
        )]));
        assert!(encode_value(&bad).is_err());

        let top_level_is_fine = Value::Str("a|b;c".into());
        roundtrip(top_level_is_fine);
    }

    #[test]
    fn zlib_expansion_is_bounded() {
        let bomb = compress(&vec![0u8; MAX_RECORD_BYTES * 4]);
        assert!(matches!(
            decompress(&bomb, MAX_RECORD_BYTES),
            Err(ProtoError::Oversized)
        ));
    }
}

//! The file-backed map.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use qw_crypto::primitives::{aead_decrypt, aead_encrypt, random_bytes};
use qw_proto::value::{compress, decode_value, decompress, encode_value, MAX_RECORD_BYTES};
use qw_proto::Value;

use crate::error::StoreError;

/// AEAD associated data for cipher-mode files.
const STORE_AAD: &[u8] = b"DB";

pub struct Database {
    path: PathBuf,
    /// Present in cipher mode only.
    key: Option<[u8; 32]>,
    data: BTreeMap<String, Value>,
}

impl Database {
    /// Open a plain-mode store. A missing file is an empty map.
    pub fn open_plain(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = match fs::read(&path) {
            Ok(bytes) => decode_plain(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, key: None, data })
    }

    /// Open a cipher-mode store, minting the key file if it does not exist.
    pub fn open_cipher(
        path: impl Into<PathBuf>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let key = load_or_create_key(key_path.as_ref())?;
        let data = match fs::read(&path) {
            Ok(bytes) => decode_cipher(&bytes, &key)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, key: Some(key), data })
    }

    // ── Map operations ───────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.data.get_mut(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Merge when both the existing and the new value are dicts, replace
    /// otherwise.
    pub fn update(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match (self.data.get_mut(&key), value) {
            (Some(Value::Dict(existing)), Value::Dict(incoming)) => {
                existing.extend(incoming);
            }
            (_, value) => {
                self.data.insert(key, value);
            }
        }
    }

    pub fn delete(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.data.keys()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    // ── Persistence ──────────────────────────────────────────────────────

    /// Full rewrite of the backing file.
    pub fn save(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = match &self.key {
            None => encode_plain(&self.data)?,
            Some(key) => encode_cipher(&self.data, key)?,
        };
        fs::write(&self.path, bytes)?;
        Ok(())
    }
}

// ── Key file ─────────────────────────────────────────────────────────────────

fn load_or_create_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let text = fs::read_to_string(key_path)?;
        let bytes = hex::decode(text.trim())
            .map_err(|_| StoreError::Corrupt("key file is not hex".into()))?;
        return bytes
            .try_into()
            .map_err(|_| StoreError::Corrupt("key file is not 32 bytes".into()));
    }
    let key = random_bytes::<32>();
    if let Some(parent) = key_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(key_path, hex::encode(key))?;
    tracing::debug!(path = %key_path.display(), "created store key file");
    Ok(key)
}

// ── Plain document form ──────────────────────────────────────────────────────

fn encode_plain(data: &BTreeMap<String, Value>) -> Result<Vec<u8>, StoreError> {
    let document = encode_document(data)?;
    Ok(serde_json::to_string_pretty(&document)
        .map_err(qw_proto::ProtoError::from)?
        .into_bytes())
}

fn decode_plain(bytes: &[u8]) -> Result<BTreeMap<String, Value>, StoreError> {
    let document: serde_json::Value =
        serde_json::from_slice(bytes).map_err(qw_proto::ProtoError::from)?;
    decode_document(&document)
}

fn encode_document(data: &BTreeMap<String, Value>) -> Result<serde_json::Value, StoreError> {
    let mut object = serde_json::Map::new();
    for (key, value) in data {
        object.insert(key.clone(), encode_document_value(value)?);
    }
    Ok(serde_json::Value::Object(object))
}

fn encode_document_value(value: &Value) -> Result<serde_json::Value, StoreError> {
    match value {
        Value::Dict(dict) => encode_document(dict),
        Value::List(list) => {
            let mut items = Vec::with_capacity(list.len());
            for item in list {
                items.push(match item {
                    Value::Dict(dict) => encode_document(dict)?,
                    other => serde_json::Value::String(encode_value(other)?),
                });
            }
            Ok(serde_json::Value::Array(items))
        }
        leaf => Ok(serde_json::Value::String(encode_value(leaf)?)),
    }
}

fn decode_document(document: &serde_json::Value) -> Result<BTreeMap<String, Value>, StoreError> {
    let object = document
        .as_object()
        .ok_or_else(|| StoreError::Corrupt("document root is not an object".into()))?;
    let mut data = BTreeMap::new();
    for (key, value) in object {
        data.insert(key.clone(), decode_document_value(value)?);
    }
    Ok(data)
}

fn decode_document_value(value: &serde_json::Value) -> Result<Value, StoreError> {
    match value {
        serde_json::Value::Object(_) => Ok(Value::Dict(decode_document(value)?)),
        serde_json::Value::Array(items) => {
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                list.push(decode_document_value(item)?);
            }
            Ok(Value::List(list))
        }
        serde_json::Value::String(tagged) => Ok(decode_value(tagged)?),
        other => Err(StoreError::Corrupt(format!("unexpected JSON node {other}"))),
    }
}

// ── Cipher form ──────────────────────────────────────────────────────────────

fn encode_cipher(data: &BTreeMap<String, Value>, key: &[u8; 32]) -> Result<Vec<u8>, StoreError> {
    let document = encode_document(data)?;
    let plaintext = compress(
        serde_json::to_string(&document)
            .map_err(qw_proto::ProtoError::from)?
            .as_bytes(),
    );
    let (iv, ct, tag) = aead_encrypt(key, &plaintext, STORE_AAD)?;
    Ok(format!("{},{},{}\n", hex::encode(iv), hex::encode(ct), hex::encode(tag)).into_bytes())
}

fn decode_cipher(bytes: &[u8], key: &[u8; 32]) -> Result<BTreeMap<String, Value>, StoreError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| StoreError::Corrupt("cipher row is not UTF-8".into()))?;
    let mut fields = text.trim_end().split(',');
    let (iv, ct, tag) = match (fields.next(), fields.next(), fields.next(), fields.next()) {
        (Some(iv), Some(ct), Some(tag), None) => (iv, ct, tag),
        _ => return Err(StoreError::Corrupt("cipher row does not have 3 fields".into())),
    };
    let iv = hex::decode(iv).map_err(|_| StoreError::Corrupt("bad iv hex".into()))?;
    let ct = hex::decode(ct).map_err(|_| StoreError::Corrupt("bad ciphertext hex".into()))?;
    let tag = hex::decode(tag).map_err(|_| StoreError::Corrupt("bad tag hex".into()))?;

    let plaintext = aead_decrypt(key, &iv, &ct, STORE_AAD, &tag)?;
    let json = decompress(&plaintext, MAX_RECORD_BYTES)?;
    let document: serde_json::Value =
        serde_json::from_slice(&json).map_err(qw_proto::ProtoError::from)?;
    decode_document(&document)
}

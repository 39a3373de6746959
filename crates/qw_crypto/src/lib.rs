//! qw_crypto — QuietWire cryptographic core
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited RustCrypto crates.
//! - Every message key is used for exactly one AEAD call.
//! - Secret chain material is zeroized on drop.
//!
//! # Module layout
//! - `primitives` — ECDH / ECDSA on NIST P-256, HKDF, HMAC, AES-256-GCM
//! - `keyring`    — long-term identity key, signed prekey, one-time prekey pool
//! - `x3dh`       — asynchronous key agreement against a published key bundle
//! - `ratchet`    — per-peer Double Ratchet (DH step on every speaker switch)
//! - `error`      — unified error type

pub mod error;
pub mod keyring;
pub mod primitives;
pub mod ratchet;
pub mod x3dh;

pub use error::CryptoError;
pub use primitives::{SigningKey, VerifyingKey};

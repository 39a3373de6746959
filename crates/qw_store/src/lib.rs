//! qw_store — QuietWire persistent key/value store
//!
//! A single-file map of tagged values with two on-disk modes:
//!
//! - **Plain**: a JSON document; dict values recurse as JSON objects, list
//!   elements recurse, leaves are tagged strings.
//! - **Cipher**: one CSV row `iv,ct,tag` (hex). The plaintext is the
//!   zlib-compressed JSON document, sealed with AES-256-GCM under a
//!   file-bound key (AAD `"DB"`). The key lives in a sibling key file and
//!   is minted on first open.
//!
//! `save` is a full rewrite with no journal: a crash between two saves
//! loses at most one operation's worth of state, which the protocol
//! tolerates (offline delivery is idempotent, ratchet advance is committed
//! only after a successful encrypt/decrypt).

pub mod db;
pub mod error;

pub use db::Database;
pub use error::StoreError;

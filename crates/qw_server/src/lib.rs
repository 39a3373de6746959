//! qw_server — QuietWire relay daemon
//!
//! The relay is untrusted by design: it authenticates users, routes opaque
//! records, brokers X3DH key bundles and holds offline queues. It never
//! sees plaintext or key material beyond the published bundles.
//!
//! # Module layout
//! - `state`    — shared server state: user store, pepper store, online table
//! - `handlers` — per-kind record handlers and the dispatch ACL
//! - `net`      — TLS accept loop and per-connection tasks
//! - `error`    — unified error type

pub mod error;
pub mod handlers;
pub mod net;
pub mod state;

pub use error::ServerError;
pub use handlers::{dispatch, Connection, Flow};
pub use state::ServerState;

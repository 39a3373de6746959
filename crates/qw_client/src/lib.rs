//! qw_client — QuietWire client core
//!
//! The session core is transport-free: decoded records go in through
//! [`ClientSession::on_record`], outbound records leave through a channel,
//! and anything a user interface must react to surfaces as a
//! [`ClientEvent`]. The interactive terminal shell in `net`/`main` is one
//! thin consumer of that core; the integration tests are another.
//!
//! # Module layout
//! - `session`  — session state, store layout, core operations
//! - `handlers` — per-kind record handlers
//! - `net`      — pinned-certificate TLS connection and the terminal shell
//! - `error`    — unified error type

pub mod error;
pub mod handlers;
pub mod net;
pub mod session;

pub use error::ClientError;
pub use session::{ClientEvent, ClientSession, Flow};

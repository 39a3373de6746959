//! qw_proto — QuietWire protocol types and serialisation
//!
//! # Module layout
//! - `value`   — self-describing tagged values (the on-wire and at-rest grammar)
//! - `record`  — the {sender, receiver, kind, payload} record and kind enum
//! - `framing` — length-prefixed record I/O over an async byte stream
//! - `error`   — unified error type
//!
//! The relay never sees inside `message` payloads; everything it routes is
//! an opaque record-encoded map.

pub mod error;
pub mod framing;
pub mod record;
pub mod value;

pub use error::ProtoError;
pub use record::{
    check_username, Kind, Payload, Record, SERVER_NAME, STATUS_ERROR, STATUS_NOT_REGISTERED,
    STATUS_REGISTERED, STATUS_REQUEST, STATUS_SUCCESS,
};
pub use value::Value;

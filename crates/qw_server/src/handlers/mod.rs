//! Record handlers and the dispatch ACL.
//!
//! Every decoded record passes three gates before its handler runs:
//! the sender must be the connection owner, anything beyond the login
//! flow requires a logged-in user, and only `message` records may name a
//! peer as receiver. All violations close the connection; so does any
//! kind the relay has no business receiving.

pub mod login;
pub mod message;
pub mod reset;
pub mod x3dh;

use std::collections::BTreeMap;

use tokio::sync::mpsc;

use qw_proto::{check_username, Kind, Payload, Record, Value, SERVER_NAME, STATUS_ERROR,
    STATUS_NOT_REGISTERED, STATUS_REGISTERED, STATUS_SUCCESS};

use crate::error::ServerError;
use crate::state::{server_record, ServerState};

/// What the connection loop should do after a record was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// One identified connection: the claimed username plus the outbound
/// channel drained by the connection's writer task.
#[derive(Clone)]
pub struct Connection {
    pub username: String,
    pub tx: mpsc::UnboundedSender<Record>,
}

impl Connection {
    pub fn reply(&self, kind: Kind, payload: Payload) {
        let _ = self.tx.send(server_record(&self.username, kind, payload));
    }
}

pub fn error_payload(error: impl Into<String>) -> Payload {
    BTreeMap::from([
        ("status".to_string(), Value::from(STATUS_ERROR)),
        ("error".to_string(), Value::Str(error.into())),
    ])
}

pub fn success_payload() -> Payload {
    BTreeMap::from([("status".to_string(), Value::from(STATUS_SUCCESS))])
}

// ── Identity gate ────────────────────────────────────────────────────────────

/// Validate the mandatory first record of a connection. On success the
/// username is claimed in the online table and the registration status is
/// reported back; on failure an error status is sent and `None` returned,
/// upon which the caller closes the connection.
pub async fn check_identity(
    state: &ServerState,
    tx: &mpsc::UnboundedSender<Record>,
    record: &Record,
) -> Result<Option<Connection>, ServerError> {
    let refuse = |error: &str| {
        let receiver = if check_username(&record.sender) {
            record.sender.as_str()
        } else {
            "unknown"
        };
        let _ = tx.send(server_record(receiver, Kind::StatusRequest, error_payload(error)));
    };

    if record.kind != Kind::Identity {
        refuse("You must send an identity record first.");
        tracing::warn!(kind = record.kind.as_str(), "first record was not an identity");
        return Ok(None);
    }

    let username = record.get("username").and_then(Value::as_str).unwrap_or_default();
    if username.is_empty() || record.sender != username || !check_username(username) {
        refuse("You must send a valid identity record.");
        tracing::warn!("identity record carried an invalid username");
        return Ok(None);
    }

    if !state.register_peer(username, tx.clone()).await {
        refuse("A user with this name is already connected.");
        tracing::warn!(user = username, "duplicate connection refused");
        return Ok(None);
    }

    let conn = Connection { username: username.to_string(), tx: tx.clone() };
    let registered = state.stores().await.is_registered(username);
    let status = if registered { STATUS_REGISTERED } else { STATUS_NOT_REGISTERED };
    conn.reply(
        Kind::StatusRequest,
        BTreeMap::from([("status".to_string(), Value::from(status))]),
    );
    tracing::info!(user = username, registered, "identity accepted");
    Ok(Some(conn))
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

pub async fn dispatch(
    state: &ServerState,
    conn: &Connection,
    record: Record,
) -> Result<Flow, ServerError> {
    if record.sender != conn.username {
        tracing::warn!(
            claimed = %record.sender,
            owner = %conn.username,
            "record sender does not match the connection owner"
        );
        return Ok(Flow::Close);
    }

    let logged_in = state.stores().await.is_logged_in(&record.sender);
    let login_flow = matches!(
        record.kind,
        Kind::Identity | Kind::Register | Kind::Login | Kind::RequestSalt
    );
    if !logged_in && !login_flow {
        tracing::warn!(
            user = %record.sender,
            kind = record.kind.as_str(),
            "record requires a logged-in user"
        );
        return Ok(Flow::Close);
    }

    if record.receiver != SERVER_NAME && record.kind != Kind::Message {
        tracing::warn!(
            user = %record.sender,
            kind = record.kind.as_str(),
            "non-message record addressed to a peer"
        );
        return Ok(Flow::Close);
    }

    match record.kind {
        Kind::Register => login::handle_register(state, conn, record).await,
        Kind::Login => login::handle_login(state, conn, record).await,
        Kind::RequestSalt => login::handle_request_salt(state, conn, record).await,
        Kind::Message => message::handle_message(state, conn, record).await,
        Kind::X3dhRequest => x3dh::handle_bundle_request(state, conn, record).await,
        Kind::X3dhKeys => x3dh::handle_key_upload(state, conn, record).await,
        Kind::X3dhReaction => x3dh::handle_reaction(state, conn, record).await,
        Kind::Reset => reset::handle_reset(state, conn, record).await,
        other => {
            tracing::warn!(user = %conn.username, kind = other.as_str(), "unexpected kind");
            Ok(Flow::Close)
        }
    }
}

//! Registration, login and salt distribution.

use std::collections::BTreeMap;

use qw_crypto::primitives::salt_password;
use qw_proto::{Kind, Record, Value, STATUS_NOT_REGISTERED};

use super::{error_payload, success_payload, Connection, Flow};
use crate::error::ServerError;
use crate::state::ServerState;

/// A valid key bundle carries an identity key, a signed prekey, a
/// non-empty signature and at least one one-time prekey, all well typed.
fn valid_key_bundle(keys: &BTreeMap<String, Value>) -> bool {
    let signed = keys
        .get("sigma")
        .and_then(Value::as_bytes)
        .map(|sigma| !sigma.is_empty())
        .unwrap_or(false);
    let opks_ok = keys
        .get("OPKs")
        .and_then(Value::as_list)
        .map(|opks| !opks.is_empty() && opks.iter().all(|k| k.as_verifying().is_some()))
        .unwrap_or(false);
    keys.get("IPK").and_then(Value::as_verifying).is_some()
        && keys.get("SPK").and_then(Value::as_verifying).is_some()
        && signed
        && opks_ok
}

pub async fn handle_register(
    state: &ServerState,
    conn: &Connection,
    record: Record,
) -> Result<Flow, ServerError> {
    let mut stores = state.stores().await;

    if stores.is_registered(&record.sender) {
        tracing::info!(user = %record.sender, "already registered");
        conn.reply(Kind::Register, error_payload("User is already registered."));
        return Ok(Flow::Continue);
    }

    let Some(password) = record.get("password").and_then(Value::as_str).map(str::to_string)
    else {
        tracing::warn!(user = %record.sender, "registration without a password");
        conn.reply(Kind::Register, error_payload("Invalid registration data."));
        return Ok(Flow::Continue);
    };

    let Some(keys) = record.get("keys").and_then(Value::as_dict).cloned() else {
        tracing::warn!(user = %record.sender, "registration without a key bundle");
        conn.reply(Kind::Register, error_payload("Invalid registration data."));
        return Ok(Flow::Continue);
    };

    if !valid_key_bundle(&keys) {
        tracing::warn!(user = %record.sender, "registration with an invalid key bundle");
        conn.reply(Kind::Register, error_payload("Invalid key bundle."));
        return Ok(Flow::Continue);
    }

    let salt = stores.get_or_create_salt(&record.sender)?;
    let pepper = stores.get_or_create_pepper(&record.sender)?;
    let salted = salt_password(&password, &salt, &pepper);

    let Some(user) = stores.user_mut(&record.sender) else {
        return Ok(Flow::Continue);
    };
    user.insert("salted_password".to_string(), Value::Bytes(salted.to_vec()));
    user.insert("keys".to_string(), Value::Dict(keys));
    user.insert("registered".to_string(), Value::Bool(true));
    stores.database.save()?;

    tracing::info!(user = %record.sender, "registered");
    let mut payload = success_payload();
    payload.insert("salt".to_string(), Value::Bytes(salt));
    payload.insert("pepper".to_string(), Value::Bytes(pepper));
    conn.reply(Kind::Register, payload);
    Ok(Flow::Continue)
}

pub async fn handle_login(
    state: &ServerState,
    conn: &Connection,
    record: Record,
) -> Result<Flow, ServerError> {
    let mut stores = state.stores().await;

    if !stores.is_registered(&record.sender) {
        tracing::info!(user = %record.sender, "login attempt by an unregistered user");
        conn.reply(
            Kind::Login,
            BTreeMap::from([("status".to_string(), Value::from(STATUS_NOT_REGISTERED))]),
        );
        return Ok(Flow::Continue);
    }

    // Throttle before looking at the password at all.
    if stores.too_many_attempts(&record.sender) {
        tracing::warn!(user = %record.sender, "login throttled");
        conn.reply(Kind::Login, error_payload("Too many failed login attempts."));
        return Ok(Flow::Continue);
    }

    let supplied = record.get("salted_password").and_then(Value::as_bytes);
    let stored = stores
        .user(&record.sender)
        .and_then(|user| user.get("salted_password"))
        .and_then(Value::as_bytes)
        .map(<[u8]>::to_vec);
    let correct = matches!((supplied, &stored), (Some(a), Some(b)) if a == b.as_slice());

    if !correct {
        tracing::warn!(user = %record.sender, "wrong password");
        stores.add_login_attempt(&record.sender);
        conn.reply(Kind::Login, error_payload("Password incorrect."));
        return Ok(Flow::Continue);
    }

    tracing::info!(user = %record.sender, "logged in");
    conn.reply(Kind::Login, success_payload());
    for queued in stores.drain_offline(&record.sender)? {
        let _ = conn.tx.send(queued);
    }
    stores.set_logged_in(&record.sender, true)?;
    Ok(Flow::Continue)
}

pub async fn handle_request_salt(
    state: &ServerState,
    conn: &Connection,
    record: Record,
) -> Result<Flow, ServerError> {
    let salt = state.stores().await.get_or_create_salt(&record.sender)?;
    conn.reply(
        Kind::AnswerSalt,
        BTreeMap::from([("salt".to_string(), Value::Bytes(salt))]),
    );
    Ok(Flow::Continue)
}

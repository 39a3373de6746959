//! Key bundle brokering and X3DH forwarding.

use std::collections::BTreeMap;

use qw_proto::{check_username, Kind, Payload, Record, Value};

use super::{error_payload, success_payload, Connection, Flow};
use crate::error::ServerError;
use crate::state::{server_record, ServerState};

/// Hand out one fetched bundle for the target, atomically consuming the
/// first stored one-time prekey. An exhausted pool produces an error for
/// the requester and a replenishment prompt for the target (queued if the
/// target is offline).
pub async fn handle_bundle_request(
    state: &ServerState,
    conn: &Connection,
    record: Record,
) -> Result<Flow, ServerError> {
    let target = record
        .get("target")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|t| check_username(t));
    let Some(target) = target else {
        tracing::warn!(user = %record.sender, "bundle request without a valid target");
        conn.reply(Kind::X3dhRequest, error_payload("No valid target specified."));
        return Ok(Flow::Continue);
    };

    let mut stores = state.stores().await;
    if !stores.is_registered(&target) {
        conn.reply(
            Kind::X3dhRequest,
            error_payload(format!("{target} is not registered.")),
        );
        return Ok(Flow::Continue);
    }

    let Some(keys) = stores
        .user(&target)
        .and_then(|user| user.get("keys"))
        .and_then(Value::as_dict)
    else {
        tracing::error!(%target, "registered user without a key bundle");
        conn.reply(
            Kind::X3dhRequest,
            error_payload(format!("Key request for {target} failed.")),
        );
        return Ok(Flow::Continue);
    };

    let ipk = keys.get("IPK").cloned();
    let spk = keys.get("SPK").cloned();
    let sigma = keys.get("sigma").cloned();
    let first_opk = keys
        .get("OPKs")
        .and_then(Value::as_list)
        .and_then(|opks| opks.first())
        .cloned();

    let (Some(ipk), Some(spk), Some(sigma)) = (ipk, spk, sigma) else {
        conn.reply(
            Kind::X3dhRequest,
            error_payload(format!("Key request for {target} failed.")),
        );
        return Ok(Flow::Continue);
    };

    let Some(opk) = first_opk else {
        tracing::info!(%target, "one-time prekey pool exhausted");
        if stores.is_logged_in(&target) {
            state
                .send_to(&target, server_record(&target, Kind::X3dhKeys, Payload::new()))
                .await;
            conn.reply(
                Kind::X3dhRequest,
                error_payload(format!("{target} doesn't have keys left. Try again.")),
            );
        } else {
            stores.add_offline(&target, server_record(&target, Kind::X3dhKeys, Payload::new()))?;
            conn.reply(
                Kind::X3dhRequest,
                error_payload(format!("{target} doesn't have keys left and is offline.")),
            );
        }
        return Ok(Flow::Continue);
    };

    // Pop the consumed prekey and persist before replying.
    if let Some(opks) = stores
        .user_mut(&target)
        .and_then(|user| user.get_mut("keys"))
        .and_then(Value::as_dict_mut)
        .and_then(|keys| keys.get_mut("OPKs"))
        .and_then(Value::as_list_mut)
    {
        opks.remove(0);
    }
    stores.database.save()?;

    tracing::info!(user = %record.sender, %target, "fetched bundle served");
    let key_bundle = BTreeMap::from([
        ("IPK".to_string(), ipk),
        ("SPK".to_string(), spk),
        ("OPK".to_string(), opk),
        ("sigma".to_string(), sigma),
    ]);
    let mut payload = success_payload();
    payload.insert("key_bundle".to_string(), Value::Dict(key_bundle));
    payload.insert("owner".to_string(), Value::Str(target));
    conn.reply(Kind::X3dhRequest, payload);
    Ok(Flow::Continue)
}

/// A user uploads fresh one-time prekeys after running out.
pub async fn handle_key_upload(
    state: &ServerState,
    conn: &Connection,
    record: Record,
) -> Result<Flow, ServerError> {
    let incoming = record.get("OPKs").and_then(Value::as_list).cloned();
    let valid = incoming
        .as_ref()
        .map(|opks| !opks.is_empty() && opks.iter().all(|k| k.as_verifying().is_some()))
        .unwrap_or(false);
    let Some(incoming) = incoming.filter(|_| valid) else {
        tracing::warn!(user = %record.sender, "invalid one-time prekey upload");
        conn.reply(Kind::X3dhKeys, error_payload("Invalid OPKs."));
        return Ok(Flow::Continue);
    };

    let mut stores = state.stores().await;
    let Some(opks) = stores
        .user_mut(&record.sender)
        .and_then(|user| user.get_mut("keys"))
        .and_then(Value::as_dict_mut)
        .and_then(|keys| keys.get_mut("OPKs"))
        .and_then(Value::as_list_mut)
    else {
        conn.reply(Kind::X3dhKeys, error_payload("Invalid OPKs."));
        return Ok(Flow::Continue);
    };

    let count = incoming.len();
    opks.extend(incoming);
    stores.database.save()?;
    tracing::info!(user = %record.sender, count, "one-time prekeys replenished");
    conn.reply(Kind::X3dhKeys, success_payload());
    Ok(Flow::Continue)
}

/// Forward an initiator's reaction to its target, stamping the
/// authenticated sender into the payload.
pub async fn handle_reaction(
    state: &ServerState,
    conn: &Connection,
    record: Record,
) -> Result<Flow, ServerError> {
    let target = record
        .get("target")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|t| check_username(t));
    let Some(target) = target else {
        tracing::warn!(user = %record.sender, "reaction without a valid target");
        conn.reply(Kind::X3dhReaction, error_payload("No valid target specified."));
        return Ok(Flow::Continue);
    };

    let mut stores = state.stores().await;
    if !stores.is_registered(&target) {
        conn.reply(
            Kind::X3dhReaction,
            error_payload(format!("{target} is not registered.")),
        );
        return Ok(Flow::Continue);
    }

    let mut payload = record.payload.clone();
    payload.insert("sender".to_string(), Value::Str(record.sender.clone()));
    let forwarded = server_record(&target, Kind::X3dhReaction, payload);

    if stores.is_logged_in(&target) {
        drop(stores);
        tracing::info!(user = %record.sender, %target, "reaction forwarded");
        state.send_to(&target, forwarded).await;
    } else {
        tracing::info!(user = %record.sender, %target, "reaction queued for offline target");
        stores.add_offline(&target, forwarded)?;
    }
    Ok(Flow::Continue)
}

//! Chat and account resets.

use std::collections::BTreeMap;

use qw_proto::{check_username, Kind, Payload, Record, Value, SERVER_NAME, STATUS_REQUEST};

use super::{error_payload, Connection, Flow};
use crate::error::ServerError;
use crate::state::{server_record, ServerState};

fn reset_notice(sender: &str) -> Payload {
    BTreeMap::from([
        ("sender".to_string(), Value::from(sender)),
        ("status".to_string(), Value::from(STATUS_REQUEST)),
    ])
}

/// `target == "server"` deletes the caller's account and fans the notice
/// out to every remaining user so peers can tear down their chats; the
/// caller's connection terminates afterwards. Any other target receives
/// the notice alone.
pub async fn handle_reset(
    state: &ServerState,
    conn: &Connection,
    record: Record,
) -> Result<Flow, ServerError> {
    let target = record
        .get("target")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if target == SERVER_NAME {
        tracing::info!(user = %record.sender, "account reset");
        let mut stores = state.stores().await;
        stores.database.delete(&record.sender);
        stores.database.save()?;

        let others: Vec<String> = stores.database.keys().cloned().collect();
        for user in others {
            let notice = server_record(&user, Kind::Reset, reset_notice(&record.sender));
            if stores.is_logged_in(&user) {
                state.send_to(&user, notice).await;
            } else {
                stores.add_offline(&user, notice)?;
            }
        }
        return Ok(Flow::Close);
    }

    let mut stores = state.stores().await;
    if !check_username(&target) || !stores.is_registered(&target) {
        tracing::warn!(user = %record.sender, %target, "reset for an invalid target");
        conn.reply(Kind::Reset, error_payload(format!("{target} is invalid.")));
        return Ok(Flow::Continue);
    }

    tracing::info!(user = %record.sender, %target, "peer reset");
    let notice = server_record(&target, Kind::Reset, reset_notice(&record.sender));
    if stores.is_logged_in(&target) {
        drop(stores);
        state.send_to(&target, notice).await;
    } else {
        stores.add_offline(&target, notice)?;
    }
    Ok(Flow::Continue)
}

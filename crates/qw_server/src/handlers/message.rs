//! Encrypted message relay.
//!
//! The payload is opaque to the relay; it only decides between immediate
//! delivery and the receiver's offline queue. The original record is
//! forwarded untouched so the receiver sees the authenticated sender.

use qw_proto::{Kind, Record};

use super::{error_payload, Connection, Flow};
use crate::error::ServerError;
use crate::state::ServerState;

pub async fn handle_message(
    state: &ServerState,
    conn: &Connection,
    record: Record,
) -> Result<Flow, ServerError> {
    let receiver = record.receiver.clone();
    let mut stores = state.stores().await;

    if !stores.is_registered(&receiver) {
        tracing::info!(user = %record.sender, %receiver, "message to an unregistered user");
        conn.reply(
            Kind::Message,
            error_payload(format!("{receiver} is not registered.")),
        );
        return Ok(Flow::Continue);
    }

    if !stores.is_logged_in(&receiver) {
        tracing::debug!(user = %record.sender, %receiver, "receiver offline, queueing");
        stores.add_offline(&receiver, record)?;
        return Ok(Flow::Continue);
    }
    drop(stores);

    tracing::debug!(user = %record.sender, %receiver, "relaying message");
    if !state.send_to(&receiver, record).await {
        tracing::warn!(%receiver, "receiver vanished during delivery");
    }
    Ok(Flow::Continue)
}

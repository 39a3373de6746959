//! Reset notices.

use qw_proto::{Record, Value, STATUS_ERROR, STATUS_REQUEST};

use crate::error::ClientError;
use crate::session::{ClientEvent, ClientSession, Flow};

/// A peer reset the chat with us (directly or through an account reset
/// fan-out): drop every trace of them.
pub fn handle_reset(
    session: &mut ClientSession,
    record: &Record,
    events: &mut Vec<ClientEvent>,
) -> Result<Flow, ClientError> {
    match record.status() {
        Some(STATUS_REQUEST) => {
            let Some(sender) = record.get("sender").and_then(Value::as_str).map(str::to_string)
            else {
                return Ok(Flow::Continue);
            };
            session.purge_peer(&sender)?;
            events.push(ClientEvent::ResetBy(sender));
            Ok(Flow::Continue)
        }
        Some(STATUS_ERROR) => {
            events.push(ClientEvent::Info(format!(
                "reset failed: {}",
                record.error_text()
            )));
            Ok(Flow::Continue)
        }
        _ => Ok(Flow::Continue),
    }
}

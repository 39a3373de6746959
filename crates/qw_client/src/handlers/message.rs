//! Inbound chat messages.

use qw_proto::{Record, Value, SERVER_NAME, STATUS_ERROR};

use crate::error::ClientError;
use crate::session::{parse_sealed, ClientEvent, ClientSession, Flow};

pub fn handle_message(
    session: &mut ClientSession,
    record: &Record,
    events: &mut Vec<ClientEvent>,
) -> Result<Flow, ClientError> {
    // Status notes from the relay (delivery errors and the like).
    if record.sender == SERVER_NAME {
        if record.status() == Some(STATUS_ERROR) {
            events.push(ClientEvent::Info(format!(
                "relay error: {}",
                record.error_text()
            )));
        } else {
            let note = record
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("<empty>");
            events.push(ClientEvent::Info(format!("relay: {note}")));
        }
        return Ok(Flow::Continue);
    }

    let sender = record.sender.clone();

    // A pending shared secret means this is the first message of a fresh
    // session; promote it to a responder chat before decrypting.
    session.init_chat_receiver(&sender)?;

    let Some(sealed) = parse_sealed(&record.payload) else {
        tracing::warn!(from = %sender, "undecodable message payload");
        events.push(ClientEvent::Info(format!(
            "failed to decrypt message from {sender}"
        )));
        return Ok(Flow::Continue);
    };

    let plaintext = {
        let Some(chat) = session
            .map_entry_mut("chats")?
            .get_mut(&sender)
            .and_then(Value::as_ratchet_mut)
        else {
            tracing::warn!(from = %sender, "message without an established chat");
            events.push(ClientEvent::Info(format!(
                "failed to decrypt message from {sender}"
            )));
            return Ok(Flow::Continue);
        };
        chat.decrypt(&sealed)
    };

    match plaintext {
        Ok(bytes) => {
            session.db_mut().save()?;
            events.push(ClientEvent::Message {
                from: sender,
                text: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Err(e) => {
            // Ratchet state was rolled back; the session stays usable.
            tracing::warn!(from = %sender, error = %e, "decrypt failure");
            events.push(ClientEvent::Info(format!(
                "failed to decrypt message from {sender}"
            )));
        }
    }
    Ok(Flow::Continue)
}

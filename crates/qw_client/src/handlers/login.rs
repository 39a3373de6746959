//! Registration and login flow.
//!
//! The relay drives the flow with its status reply to our identity record:
//! an unknown user is asked to register (minting keys on the way), a known
//! user requests its salt and answers with the salted password.

use qw_proto::{Record, Value, STATUS_ERROR, STATUS_NOT_REGISTERED, STATUS_REGISTERED,
    STATUS_SUCCESS};

use crate::error::ClientError;
use crate::session::{ClientEvent, ClientSession, Flow};

pub fn handle_status(
    session: &mut ClientSession,
    record: &Record,
    events: &mut Vec<ClientEvent>,
) -> Result<Flow, ClientError> {
    match record.status() {
        Some(STATUS_ERROR) => {
            events.push(ClientEvent::Info(format!(
                "relay refused the connection: {}",
                record.error_text()
            )));
            Ok(Flow::Stop)
        }
        Some(STATUS_NOT_REGISTERED) => {
            events.push(ClientEvent::NeedsRegistration);
            Ok(Flow::Continue)
        }
        Some(STATUS_REGISTERED) => {
            session.request_salt()?;
            Ok(Flow::Continue)
        }
        other => {
            events.push(ClientEvent::Info(format!(
                "unknown status '{}' from the relay",
                other.unwrap_or("<missing>")
            )));
            Ok(Flow::Stop)
        }
    }
}

pub fn handle_register(
    session: &mut ClientSession,
    record: &Record,
    events: &mut Vec<ClientEvent>,
) -> Result<Flow, ClientError> {
    match record.status() {
        Some(STATUS_SUCCESS) => {
            let salt = record.get("salt").and_then(Value::as_bytes).map(<[u8]>::to_vec);
            let pepper = record.get("pepper").and_then(Value::as_bytes).map(<[u8]>::to_vec);
            let (Some(salt), Some(pepper)) = (salt, pepper) else {
                events.push(ClientEvent::Info(
                    "relay sent an invalid salt or pepper".to_string(),
                ));
                return Ok(Flow::Stop);
            };
            session.db_mut().insert("salt", Value::Bytes(salt));
            session.db_mut().insert("pepper", Value::Bytes(pepper));
            session.db_mut().save()?;
            events.push(ClientEvent::RegisteredAwaitLogin);
            Ok(Flow::Continue)
        }
        Some(STATUS_ERROR) => {
            events.push(ClientEvent::Info(format!(
                "registration failed: {}",
                record.error_text()
            )));
            Ok(Flow::Stop)
        }
        _ => Ok(Flow::Continue),
    }
}

pub fn handle_answer_salt(
    session: &mut ClientSession,
    record: &Record,
    events: &mut Vec<ClientEvent>,
) -> Result<Flow, ClientError> {
    let Some(salt) = record.get("salt").and_then(Value::as_bytes).map(<[u8]>::to_vec) else {
        events.push(ClientEvent::Info("relay sent an invalid salt".to_string()));
        return Ok(Flow::Stop);
    };
    session.db_mut().insert("salt", Value::Bytes(salt));
    session.db_mut().save()?;
    events.push(ClientEvent::SaltReceived);
    Ok(Flow::Continue)
}

pub fn handle_login(
    _session: &mut ClientSession,
    record: &Record,
    events: &mut Vec<ClientEvent>,
) -> Result<Flow, ClientError> {
    match record.status() {
        Some(STATUS_SUCCESS) => {
            events.push(ClientEvent::LoggedIn);
            Ok(Flow::Continue)
        }
        Some(STATUS_ERROR) => {
            events.push(ClientEvent::Info(format!(
                "login failed: {}",
                record.error_text()
            )));
            Ok(Flow::Stop)
        }
        other => {
            events.push(ClientEvent::Info(format!(
                "login status: {}",
                other.unwrap_or("<missing>")
            )));
            Ok(Flow::Continue)
        }
    }
}

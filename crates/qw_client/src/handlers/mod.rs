//! Inbound record handlers.
//!
//! Each handler mutates the session store, emits user-facing events and
//! decides whether the connection stays up. Decrypt failures and server
//! error statuses are survivable; everything that smells like a broken or
//! hostile relay stops the session.

pub mod login;
pub mod message;
pub mod reset;
pub mod x3dh;

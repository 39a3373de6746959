//! The client session core.
//!
//! Store layout (cipher mode, `db/<username>/database.json` + `key.txt`):
//! - `keys`           — own key material: ik/IPK, sk/SPK, sigma, oks/OPKs
//! - `salt`, `pepper` — password material received from the relay
//! - `chats`          — peer username → live ratchet state
//! - `shared_secrets` — peer username → pending X3DH output, consumed when
//!   the chat is constructed
//! - `key_bundles`    — peer username → remembered peer SPK
//!
//! A pending shared secret and a chat for the same peer never coexist:
//! constructing the chat consumes the secret, and a freshly installed
//! secret wins over an older chat the next time the peer is spoken to.

use std::collections::BTreeMap;
use std::path::Path;

use tokio::sync::mpsc;

use qw_crypto::keyring::KeyRing;
use qw_crypto::primitives::{salt_password, SigningKey, VerifyingKey};
use qw_crypto::ratchet::{RatchetState, SealedMessage};
use qw_proto::{check_username, Kind, Payload, Record, Value, SERVER_NAME};
use qw_store::Database;

use crate::error::ClientError;
use crate::handlers;

/// What the connection loop should do after a record was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Everything the user interface must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The relay does not know this user; call `register`.
    NeedsRegistration,
    /// Registration succeeded and salt/pepper are stored; call `login`.
    RegisteredAwaitLogin,
    /// The login salt arrived; call `login`.
    SaltReceived,
    LoggedIn,
    Message { from: String, text: String },
    /// A peer (or the relay on its behalf) reset the chat with us.
    ResetBy(String),
    Info(String),
}

pub struct ClientSession {
    username: String,
    db: Database,
    outbound: mpsc::UnboundedSender<Record>,
}

impl ClientSession {
    /// Open the per-user encrypted store and bind the outbound channel.
    pub fn open(
        data_dir: &Path,
        username: &str,
        outbound: mpsc::UnboundedSender<Record>,
    ) -> Result<Self, ClientError> {
        if !check_username(username) || username == SERVER_NAME {
            return Err(ClientError::InvalidUsername(username.to_string()));
        }
        let user_dir = data_dir.join(username);
        let db = Database::open_cipher(user_dir.join("database.json"), user_dir.join("key.txt"))?;
        Ok(Self { username: username.to_string(), db, outbound })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Direct access to the underlying store (used by the shell for
    /// diagnostics and by integration tests to stage state).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn db_mut(&mut self) -> &mut Database {
        &mut self.db
    }

    // ── Outbound ─────────────────────────────────────────────────────────

    pub(crate) fn send(
        &self,
        receiver: &str,
        kind: Kind,
        payload: Payload,
    ) -> Result<(), ClientError> {
        let record = Record::new(self.username.clone(), receiver, kind, payload);
        self.outbound.send(record).map_err(|_| ClientError::Disconnected)
    }

    /// The mandatory first record of every connection.
    pub fn identify(&self) -> Result<(), ClientError> {
        self.send(
            SERVER_NAME,
            Kind::Identity,
            BTreeMap::from([("username".to_string(), Value::from(self.username.as_str()))]),
        )
    }

    pub fn register(&mut self, password: &str) -> Result<(), ClientError> {
        self.ensure_keys()?;
        let keys = self.keys()?;
        let bundle = BTreeMap::from([
            ("IPK".to_string(), keys.get("IPK").cloned().unwrap_or(Value::Null)),
            ("SPK".to_string(), keys.get("SPK").cloned().unwrap_or(Value::Null)),
            ("OPKs".to_string(), keys.get("OPKs").cloned().unwrap_or(Value::Null)),
            ("sigma".to_string(), keys.get("sigma").cloned().unwrap_or(Value::Null)),
        ]);
        self.send(
            SERVER_NAME,
            Kind::Register,
            BTreeMap::from([
                ("password".to_string(), Value::from(password)),
                ("keys".to_string(), Value::Dict(bundle)),
            ]),
        )
    }

    pub fn request_salt(&self) -> Result<(), ClientError> {
        self.send(SERVER_NAME, Kind::RequestSalt, Payload::new())
    }

    /// Derive the salted password from the stored salt and pepper and send
    /// the login record.
    pub fn login(&self, password: &str) -> Result<(), ClientError> {
        let salt = self
            .db
            .get("salt")
            .and_then(Value::as_bytes)
            .ok_or(ClientError::MissingState("salt"))?;
        let pepper = self
            .db
            .get("pepper")
            .and_then(Value::as_bytes)
            .ok_or(ClientError::MissingState("pepper"))?;
        let salted = salt_password(password, salt, pepper);
        self.send(
            SERVER_NAME,
            Kind::Login,
            BTreeMap::from([("salted_password".to_string(), Value::Bytes(salted.to_vec()))]),
        )
    }

    /// Ask the relay for the target's key bundle. Returns false when a
    /// session (live or pending) already exists.
    pub fn initiate_x3dh(&mut self, target: &str) -> Result<bool, ClientError> {
        if self.peer_value("chats", target).is_some()
            || self.peer_value("shared_secrets", target).is_some()
        {
            return Ok(false);
        }
        self.send(
            SERVER_NAME,
            Kind::X3dhRequest,
            BTreeMap::from([("target".to_string(), Value::from(target))]),
        )?;
        Ok(true)
    }

    /// Encrypt and send one text message. Returns false for an empty text.
    /// Fails with `NoSession` when neither a chat nor a pending shared
    /// secret (with a remembered peer SPK) exists for the target.
    pub fn send_text(&mut self, target: &str, text: &str) -> Result<bool, ClientError> {
        if text.trim().is_empty() {
            return Ok(false);
        }
        if !self.init_chat_sender(target)? {
            return Err(ClientError::NoSession(target.to_string()));
        }

        let sealed = {
            let chat = self
                .map_entry_mut("chats")?
                .get_mut(target)
                .and_then(Value::as_ratchet_mut)
                .ok_or_else(|| ClientError::NoSession(target.to_string()))?;
            chat.encrypt(text.as_bytes())?
        };
        self.send(target, Kind::Message, seal_payload(&sealed))?;
        self.db.save()?;
        Ok(true)
    }

    /// Reset the chat with a peer, or the whole account when the target is
    /// the relay itself.
    pub fn reset(&mut self, target: &str) -> Result<(), ClientError> {
        self.send(
            SERVER_NAME,
            Kind::Reset,
            BTreeMap::from([("target".to_string(), Value::from(target))]),
        )?;
        if target == SERVER_NAME {
            self.db.clear();
            self.db.save()?;
        } else {
            self.purge_peer(target)?;
        }
        Ok(())
    }

    // ── Inbound dispatch ─────────────────────────────────────────────────

    pub fn on_record(
        &mut self,
        record: Record,
    ) -> Result<(Flow, Vec<ClientEvent>), ClientError> {
        let mut events = Vec::new();
        let flow = match record.kind {
            Kind::StatusRequest => handlers::login::handle_status(self, &record, &mut events)?,
            Kind::Register => handlers::login::handle_register(self, &record, &mut events)?,
            Kind::AnswerSalt => handlers::login::handle_answer_salt(self, &record, &mut events)?,
            Kind::Login => handlers::login::handle_login(self, &record, &mut events)?,
            Kind::Message => handlers::message::handle_message(self, &record, &mut events)?,
            Kind::X3dhRequest => {
                handlers::x3dh::handle_bundle_answer(self, &record, &mut events)?
            }
            Kind::X3dhReaction => handlers::x3dh::handle_reaction(self, &record, &mut events)?,
            Kind::X3dhKeys => handlers::x3dh::handle_key_request(self, &record, &mut events)?,
            Kind::Reset => handlers::reset::handle_reset(self, &record, &mut events)?,
            other => {
                // Anything else from the relay is a protocol violation.
                events.push(ClientEvent::Info(format!(
                    "unexpected record kind '{}', closing the connection",
                    other.as_str()
                )));
                Flow::Stop
            }
        };
        Ok((flow, events))
    }

    // ── Own key material ─────────────────────────────────────────────────

    /// Mint and persist the full key set on first use.
    pub(crate) fn ensure_keys(&mut self) -> Result<(), ClientError> {
        if matches!(self.db.get("keys"), Some(Value::Dict(_))) {
            return Ok(());
        }
        let ring = KeyRing::generate();
        self.db.insert("keys", keyring_value(&ring));
        self.db.save()?;
        Ok(())
    }

    pub(crate) fn keys(&self) -> Result<&BTreeMap<String, Value>, ClientError> {
        self.db
            .get("keys")
            .and_then(Value::as_dict)
            .ok_or(ClientError::MissingState("keys"))
    }

    pub(crate) fn keys_mut(&mut self) -> Result<&mut BTreeMap<String, Value>, ClientError> {
        self.db
            .get_mut("keys")
            .and_then(Value::as_dict_mut)
            .ok_or(ClientError::MissingState("keys"))
    }

    pub(crate) fn own_ik(&self) -> Result<SigningKey, ClientError> {
        self.keys()?
            .get("ik")
            .and_then(Value::as_signing)
            .cloned()
            .ok_or(ClientError::MissingState("identity key"))
    }

    pub(crate) fn own_ipk(&self) -> Result<VerifyingKey, ClientError> {
        self.keys()?
            .get("IPK")
            .and_then(Value::as_verifying)
            .cloned()
            .ok_or(ClientError::MissingState("identity public key"))
    }

    pub(crate) fn own_sk(&self) -> Result<SigningKey, ClientError> {
        self.keys()?
            .get("sk")
            .and_then(Value::as_signing)
            .cloned()
            .ok_or(ClientError::MissingState("signed prekey"))
    }

    pub(crate) fn own_spk(&self) -> Result<VerifyingKey, ClientError> {
        self.keys()?
            .get("SPK")
            .and_then(Value::as_verifying)
            .cloned()
            .ok_or(ClientError::MissingState("signed prekey public"))
    }

    // ── Per-peer maps ────────────────────────────────────────────────────

    pub(crate) fn peer_value(&self, map: &str, peer: &str) -> Option<&Value> {
        self.db.get(map).and_then(Value::as_dict).and_then(|d| d.get(peer))
    }

    /// Whether one of the per-peer maps has an entry for `peer`.
    pub fn peer_value_exists(&self, map: &str, peer: &str) -> bool {
        self.peer_value(map, peer).is_some()
    }

    pub(crate) fn map_entry_mut(
        &mut self,
        map: &str,
    ) -> Result<&mut BTreeMap<String, Value>, ClientError> {
        if !matches!(self.db.get(map), Some(Value::Dict(_))) {
            self.db.insert(map, Value::Dict(BTreeMap::new()));
        }
        self.db
            .get_mut(map)
            .and_then(Value::as_dict_mut)
            .ok_or(ClientError::MissingState("peer map"))
    }

    /// Drop every trace of a peer: chat, pending secret, remembered SPK.
    pub(crate) fn purge_peer(&mut self, peer: &str) -> Result<(), ClientError> {
        for map in ["chats", "shared_secrets", "key_bundles"] {
            if let Some(Value::Dict(entries)) = self.db.get_mut(map) {
                entries.remove(peer);
            }
        }
        self.db.save()?;
        Ok(())
    }

    // ── Chat construction ────────────────────────────────────────────────

    /// Make sure a chat exists before sending to `target`. A pending shared
    /// secret (plus the remembered peer SPK) is promoted into an initiator
    /// chat, consuming the secret; an installed secret replaces any chat
    /// left over from before it.
    pub(crate) fn init_chat_sender(&mut self, target: &str) -> Result<bool, ClientError> {
        let chat_exists = self.peer_value("chats", target).is_some();
        let secret = self
            .peer_value("shared_secrets", target)
            .and_then(Value::as_bytes)
            .map(<[u8]>::to_vec);
        let Some(secret) = secret else {
            return Ok(chat_exists);
        };

        let Some(spk) = self
            .peer_value("key_bundles", target)
            .and_then(Value::as_dict)
            .and_then(|bundle| bundle.get("SPK"))
            .and_then(Value::as_verifying)
            .cloned()
        else {
            tracing::warn!(peer = target, "pending secret without a remembered SPK");
            return Ok(chat_exists);
        };

        let root: [u8; 32] = secret
            .try_into()
            .map_err(|_| ClientError::CorruptState("shared secret is not 32 bytes"))?;
        self.map_entry_mut("shared_secrets")?.remove(target);
        let chat = RatchetState::initiator(root, spk);
        self.map_entry_mut("chats")?
            .insert(target.to_string(), Value::Ratchet(chat));
        self.db.save()?;
        Ok(true)
    }

    /// Mirror of `init_chat_sender` for the first inbound message: a
    /// pending secret becomes a responder chat seeded with our own signed
    /// prekey pair.
    pub(crate) fn init_chat_receiver(&mut self, sender: &str) -> Result<(), ClientError> {
        let secret = self
            .peer_value("shared_secrets", sender)
            .and_then(Value::as_bytes)
            .map(<[u8]>::to_vec);
        let Some(secret) = secret else {
            return Ok(());
        };

        let root: [u8; 32] = secret
            .try_into()
            .map_err(|_| ClientError::CorruptState("shared secret is not 32 bytes"))?;
        let sk = self.own_sk()?;
        let spk = self.own_spk()?;
        self.map_entry_mut("shared_secrets")?.remove(sender);
        let chat = RatchetState::responder(root, sk, spk);
        self.map_entry_mut("chats")?
            .insert(sender.to_string(), Value::Ratchet(chat));
        self.db.save()?;
        Ok(())
    }
}

// ── Wire forms ───────────────────────────────────────────────────────────────

pub(crate) fn seal_payload(sealed: &SealedMessage) -> Payload {
    BTreeMap::from([
        ("cipher".to_string(), Value::Bytes(sealed.cipher.clone())),
        ("iv".to_string(), Value::Bytes(sealed.iv.to_vec())),
        ("tag".to_string(), Value::Bytes(sealed.tag.to_vec())),
        ("index".to_string(), Value::from(sealed.index)),
        ("X".to_string(), Value::Verifying(sealed.ratchet_key.clone())),
    ])
}

pub(crate) fn parse_sealed(payload: &Payload) -> Option<SealedMessage> {
    Some(SealedMessage {
        cipher: payload.get("cipher")?.as_bytes()?.to_vec(),
        iv: payload.get("iv")?.as_bytes()?.try_into().ok()?,
        tag: payload.get("tag")?.as_bytes()?.try_into().ok()?,
        index: u32::try_from(payload.get("index")?.as_int()?).ok()?,
        ratchet_key: payload.get("X")?.as_verifying()?.clone(),
    })
}

fn keyring_value(ring: &KeyRing) -> Value {
    Value::Dict(BTreeMap::from([
        ("ik".to_string(), Value::Signing(ring.ik.clone())),
        ("IPK".to_string(), Value::Verifying(ring.ipk.clone())),
        ("sk".to_string(), Value::Signing(ring.sk.clone())),
        ("SPK".to_string(), Value::Verifying(ring.spk.clone())),
        ("sigma".to_string(), Value::Bytes(ring.sigma.clone())),
        (
            "oks".to_string(),
            Value::List(ring.oks.iter().map(|k| Value::Signing(k.clone())).collect()),
        ),
        (
            "OPKs".to_string(),
            Value::List(ring.opks.iter().map(|k| Value::Verifying(k.clone())).collect()),
        ),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(dir: &Path, name: &str) -> (ClientSession, mpsc::UnboundedReceiver<Record>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientSession::open(dir, name, tx).unwrap(), rx)
    }

    #[test]
    fn rejects_reserved_and_invalid_usernames() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(ClientSession::open(dir.path(), "server", tx.clone()).is_err());
        assert!(ClientSession::open(dir.path(), "no spaces", tx.clone()).is_err());
        assert!(ClientSession::open(dir.path(), "", tx).is_err());
    }

    #[test]
    fn identify_emits_the_identity_record() {
        let dir = tempfile::tempdir().unwrap();
        let (session, mut rx) = session(dir.path(), "alice");
        session.identify().unwrap();
        let record = rx.try_recv().unwrap();
        assert_eq!(record.kind, Kind::Identity);
        assert_eq!(record.receiver, SERVER_NAME);
        assert_eq!(record.get("username").unwrap().as_str(), Some("alice"));
    }

    #[test]
    fn keys_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let ipk = {
            let (mut session, _rx) = session(dir.path(), "alice");
            session.ensure_keys().unwrap();
            session.own_ipk().unwrap()
        };
        let (mut session, _rx) = session(dir.path(), "alice");
        session.ensure_keys().unwrap();
        assert_eq!(
            qw_crypto::primitives::canonical_public(&session.own_ipk().unwrap()),
            qw_crypto::primitives::canonical_public(&ipk)
        );
    }

    #[test]
    fn send_text_without_a_session_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, _rx) = session(dir.path(), "alice");
        assert!(matches!(
            session.send_text("bob", "hi"),
            Err(ClientError::NoSession(_))
        ));
        assert!(!session.send_text("bob", "   ").unwrap());
    }

    #[test]
    fn pending_secret_is_consumed_into_a_chat() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, mut rx) = session(dir.path(), "alice");
        session.ensure_keys().unwrap();

        let (_, spk) = qw_crypto::primitives::generate_keypair();
        session
            .map_entry_mut("shared_secrets")
            .unwrap()
            .insert("bob".to_string(), Value::Bytes(vec![4; 32]));
        session.map_entry_mut("key_bundles").unwrap().insert(
            "bob".to_string(),
            Value::Dict(BTreeMap::from([("SPK".to_string(), Value::Verifying(spk))])),
        );

        assert!(session.send_text("bob", "hello").unwrap());
        assert!(session.peer_value("shared_secrets", "bob").is_none());
        assert!(session.peer_value("chats", "bob").is_some());

        let record = rx.try_recv().unwrap();
        assert_eq!(record.kind, Kind::Message);
        assert_eq!(record.receiver, "bob");
        assert!(parse_sealed(&record.payload).is_some());
    }

    #[test]
    fn purge_peer_clears_all_three_maps() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, _rx) = session(dir.path(), "alice");
        session.ensure_keys().unwrap();

        session
            .map_entry_mut("shared_secrets")
            .unwrap()
            .insert("bob".to_string(), Value::Bytes(vec![4; 32]));
        session
            .map_entry_mut("key_bundles")
            .unwrap()
            .insert("bob".to_string(), Value::Dict(BTreeMap::new()));
        session
            .map_entry_mut("chats")
            .unwrap()
            .insert("bob".to_string(), Value::Int(0));

        session.purge_peer("bob").unwrap();
        for map in ["chats", "shared_secrets", "key_bundles"] {
            assert!(session.peer_value(map, "bob").is_none());
        }
    }
}

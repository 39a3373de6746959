//! Shared server state.
//!
//! Two locks, always taken in this order when both are needed:
//!   1. `stores` — the user database, the pepper store and the login
//!      throttle table. Holding this lock across a read-modify-write-save
//!      makes OPK pops, offline appends, logged_in flips and registration
//!      commits atomic with respect to concurrent connections.
//!   2. `peers` — the online table, mapping a username to the outbound
//!      channel of its connection task.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, Mutex, MutexGuard};

use qw_crypto::primitives::random_bytes;
use qw_proto::{Kind, Payload, Record, Value, SERVER_NAME};

use crate::error::ServerError;

/// Offline queue cap per user; everything beyond it is dropped.
pub const MAX_OFFLINE_MESSAGES: usize = 256;

const MAX_LOGIN_ATTEMPTS: usize = 3;
const LOGIN_WINDOW_MINUTES: i64 = 5;

/// Build a record originating from the relay itself.
pub fn server_record(receiver: &str, kind: Kind, payload: Payload) -> Record {
    Record::new(SERVER_NAME, receiver, kind, payload)
}

// ── Persistent side ──────────────────────────────────────────────────────────

pub struct Stores {
    pub database: qw_store::Database,
    pub peppers: qw_store::Database,
    pub login_attempts: HashMap<String, Vec<DateTime<Utc>>>,
}

impl Stores {
    pub fn user(&self, name: &str) -> Option<&BTreeMap<String, Value>> {
        self.database.get(name).and_then(Value::as_dict)
    }

    pub fn user_mut(&mut self, name: &str) -> Option<&mut BTreeMap<String, Value>> {
        self.database.get_mut(name).and_then(Value::as_dict_mut)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.user(name)
            .and_then(|user| user.get("registered"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_logged_in(&self, name: &str) -> bool {
        self.user(name)
            .and_then(|user| user.get("logged_in"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set_logged_in(&mut self, name: &str, value: bool) -> Result<(), ServerError> {
        if let Some(user) = self.user_mut(name) {
            user.insert("logged_in".to_string(), Value::Bool(value));
            self.database.save()?;
        }
        Ok(())
    }

    /// The user's salt, minting and persisting one if absent.
    pub fn get_or_create_salt(&mut self, name: &str) -> Result<Vec<u8>, ServerError> {
        if let Some(salt) = self
            .user(name)
            .and_then(|user| user.get("salt"))
            .and_then(Value::as_bytes)
        {
            return Ok(salt.to_vec());
        }
        let salt = random_bytes::<32>().to_vec();
        if self.user_mut(name).is_none() {
            self.database.insert(name, Value::Dict(BTreeMap::new()));
        }
        if let Some(user) = self.user_mut(name) {
            user.insert("salt".to_string(), Value::Bytes(salt.clone()));
        }
        self.database.save()?;
        Ok(salt)
    }

    pub fn get_or_create_pepper(&mut self, name: &str) -> Result<Vec<u8>, ServerError> {
        if let Some(pepper) = self.peppers.get(name).and_then(Value::as_bytes) {
            return Ok(pepper.to_vec());
        }
        let pepper = random_bytes::<32>().to_vec();
        self.peppers.insert(name, Value::Bytes(pepper.clone()));
        self.peppers.save()?;
        Ok(pepper)
    }

    /// Append to a registered user's offline queue. Silently ignored for
    /// unknown users; dropped with a warning when the queue is full.
    pub fn add_offline(&mut self, name: &str, record: Record) -> Result<(), ServerError> {
        if !self.is_registered(name) {
            return Ok(());
        }
        let Some(user) = self.user_mut(name) else {
            return Ok(());
        };
        let queue = user
            .entry("offline_messages".to_string())
            .or_insert_with(|| Value::List(Vec::new()));
        let Some(list) = queue.as_list_mut() else {
            return Ok(());
        };
        if list.len() >= MAX_OFFLINE_MESSAGES {
            tracing::warn!(user = name, "offline queue full, dropping record");
            return Ok(());
        }
        list.push(Value::from(record));
        self.database.save()?;
        Ok(())
    }

    /// Remove and return the user's queued records in arrival order.
    pub fn drain_offline(&mut self, name: &str) -> Result<Vec<Record>, ServerError> {
        let mut drained = Vec::new();
        if let Some(user) = self.user_mut(name) {
            if let Some(queue) = user.get_mut("offline_messages").and_then(Value::as_list_mut) {
                for item in std::mem::take(queue) {
                    if let Value::Record(record) = item {
                        drained.push(*record);
                    }
                }
                self.database.save()?;
            }
        }
        Ok(drained)
    }

    /// True when the user already burned its allowed failures inside the
    /// sliding window. Expired attempts are pruned as a side effect.
    pub fn too_many_attempts(&mut self, name: &str) -> bool {
        let now = Utc::now();
        let attempts = self.login_attempts.entry(name.to_string()).or_default();
        attempts.retain(|t| now.signed_duration_since(*t) < Duration::minutes(LOGIN_WINDOW_MINUTES));
        attempts.len() >= MAX_LOGIN_ATTEMPTS
    }

    pub fn add_login_attempt(&mut self, name: &str) {
        self.login_attempts
            .entry(name.to_string())
            .or_default()
            .push(Utc::now());
    }
}

// ── Shared handle ────────────────────────────────────────────────────────────

pub struct ServerState {
    stores: Mutex<Stores>,
    peers: Mutex<HashMap<String, mpsc::UnboundedSender<Record>>>,
}

impl ServerState {
    /// Open (or create) the server stores under `data_dir` and clear every
    /// stale logged_in flag left behind by a crash.
    pub fn open(data_dir: &Path) -> Result<Self, ServerError> {
        let mut database = qw_store::Database::open_plain(data_dir.join("database.json"))?;
        let peppers = qw_store::Database::open_cipher(
            data_dir.join("peppers.csv"),
            data_dir.join("server-key-peppers.txt"),
        )?;

        let users: Vec<String> = database.keys().cloned().collect();
        for name in users {
            if let Some(user) = database.get_mut(&name).and_then(Value::as_dict_mut) {
                user.insert("logged_in".to_string(), Value::Bool(false));
            }
        }
        database.save()?;

        Ok(Self {
            stores: Mutex::new(Stores {
                database,
                peppers,
                login_attempts: HashMap::new(),
            }),
            peers: Mutex::new(HashMap::new()),
        })
    }

    pub async fn stores(&self) -> MutexGuard<'_, Stores> {
        self.stores.lock().await
    }

    /// Claim a username for a connection. Fails when the name is taken.
    pub async fn register_peer(
        &self,
        name: &str,
        tx: mpsc::UnboundedSender<Record>,
    ) -> bool {
        let mut peers = self.peers.lock().await;
        if peers.contains_key(name) {
            return false;
        }
        peers.insert(name.to_string(), tx);
        true
    }

    pub async fn unregister_peer(&self, name: &str) {
        self.peers.lock().await.remove(name);
    }

    /// Hand a record to the named user's connection task. Returns false
    /// when the user is not connected.
    pub async fn send_to(&self, name: &str, record: Record) -> bool {
        let peers = self.peers.lock().await;
        match peers.get(name) {
            Some(tx) => tx.send(record).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_in(dir: &Path) -> ServerState {
        ServerState::open(dir).unwrap()
    }

    #[tokio::test]
    async fn throttle_trips_after_three_attempts_in_window() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let mut stores = state.stores().await;

        assert!(!stores.too_many_attempts("alice"));
        stores.add_login_attempt("alice");
        stores.add_login_attempt("alice");
        assert!(!stores.too_many_attempts("alice"));
        stores.add_login_attempt("alice");
        assert!(stores.too_many_attempts("alice"));
    }

    #[tokio::test]
    async fn expired_attempts_fall_out_of_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let mut stores = state.stores().await;

        let stale = Utc::now() - Duration::minutes(LOGIN_WINDOW_MINUTES + 1);
        stores
            .login_attempts
            .insert("alice".to_string(), vec![stale, stale, stale]);
        assert!(!stores.too_many_attempts("alice"));
    }

    #[tokio::test]
    async fn offline_queue_is_fifo_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let mut stores = state.stores().await;

        stores.database.insert(
            "bob",
            Value::Dict(BTreeMap::from([(
                "registered".to_string(),
                Value::Bool(true),
            )])),
        );

        for i in 0..MAX_OFFLINE_MESSAGES + 10 {
            let record = Record::new(
                "alice",
                "bob",
                Kind::Message,
                BTreeMap::from([("index".to_string(), Value::from(i as u32))]),
            );
            stores.add_offline("bob", record).unwrap();
        }

        let drained = stores.drain_offline("bob").unwrap();
        assert_eq!(drained.len(), MAX_OFFLINE_MESSAGES);
        assert_eq!(drained[0].get("index").unwrap().as_int(), Some(0));
        assert_eq!(
            drained[MAX_OFFLINE_MESSAGES - 1].get("index").unwrap().as_int(),
            Some((MAX_OFFLINE_MESSAGES - 1) as i64)
        );
        assert!(stores.drain_offline("bob").unwrap().is_empty());
    }

    #[tokio::test]
    async fn login_flags_are_cleared_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let state = state_in(dir.path());
            let mut stores = state.stores().await;
            stores.database.insert(
                "alice",
                Value::Dict(BTreeMap::from([
                    ("registered".to_string(), Value::Bool(true)),
                    ("logged_in".to_string(), Value::Bool(true)),
                ])),
            );
            stores.database.save().unwrap();
        }
        let reopened = state_in(dir.path());
        let stores = reopened.stores().await;
        assert!(!stores.is_logged_in("alice"));
    }
}

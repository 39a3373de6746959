//! Double Ratchet with a single symmetric chain.
//!
//! Reference: <https://signal.org/docs/specifications/doubleratchet/>
//!
//! State per peer: {ck, x, X, Y, index, last_sender}. A DH ratchet step
//! happens exactly once per turn-taking: on the very first message and
//! whenever the speaker role flips. Within a monologue successive messages
//! share the ratchet keys but each consumes a fresh message key from the
//! chain:
//!
//!   step with DH:    (mk, ck') = kdf_chain(ecdh(x, Y) || ck)
//!   step without DH: (mk, ck') = kdf_chain(ck)
//!
//! Every mk keys exactly one AES-256-GCM call (AAD `"AD"`), so the random
//! iv can never repeat under the same key.
//!
//! Decrypt failure policy: all transitions are computed on locals and
//! committed only after the authentication tag verifies, so a corrupted or
//! replayed ciphertext leaves the session state untouched and the genuine
//! next message still decrypts.

use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::primitives::{
    aead_decrypt, aead_encrypt, canonical_public, ecdh, generate_keypair, kdf_chain,
    signing_key_to_bytes, SigningKey, VerifyingKey,
};

/// AEAD associated data for every ratchet message.
const RATCHET_AAD: &[u8] = b"AD";

// ── Speaker bookkeeping ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    Me,
    Them,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::Me => "ME",
            Sender::Them => "THEM",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ME" => Some(Sender::Me),
            "THEM" => Some(Sender::Them),
            _ => None,
        }
    }
}

// ── Wire form of one encrypted message ───────────────────────────────────────

/// What actually travels to the peer: ciphertext, AEAD parameters, the
/// message index and the sender's current ratchet public key.
#[derive(Debug, Clone)]
pub struct SealedMessage {
    pub cipher: Vec<u8>,
    pub iv: [u8; 12],
    pub tag: [u8; 16],
    pub index: u32,
    pub ratchet_key: VerifyingKey,
}

// ── State ────────────────────────────────────────────────────────────────────

/// Per-peer ratchet state. Persisted (encrypted) in the local store between
/// messages; the chain key is wiped from memory on drop.
#[derive(Debug, Clone)]
pub struct RatchetState {
    pub ck: [u8; 32],
    /// Our current ratchet private key. Absent for an initiator that has
    /// not yet sent its first message.
    pub x: Option<SigningKey>,
    pub x_pub: Option<VerifyingKey>,
    /// The peer's current ratchet public key. Absent for a responder that
    /// has not yet received the first message.
    pub y_pub: Option<VerifyingKey>,
    pub index: u32,
    pub last_sender: Sender,
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.ck.zeroize();
    }
}

impl PartialEq for RatchetState {
    fn eq(&self, other: &Self) -> bool {
        let key_eq = |a: &Option<SigningKey>, b: &Option<SigningKey>| match (a, b) {
            (Some(a), Some(b)) => signing_key_to_bytes(a) == signing_key_to_bytes(b),
            (None, None) => true,
            _ => false,
        };
        let pub_eq = |a: &Option<VerifyingKey>, b: &Option<VerifyingKey>| match (a, b) {
            (Some(a), Some(b)) => canonical_public(a) == canonical_public(b),
            (None, None) => true,
            _ => false,
        };
        self.ck == other.ck
            && self.index == other.index
            && self.last_sender == other.last_sender
            && key_eq(&self.x, &other.x)
            && pub_eq(&self.x_pub, &other.x_pub)
            && pub_eq(&self.y_pub, &other.y_pub)
    }
}

impl RatchetState {
    /// First sender: the peer's signed prekey seeds the DH ratchet; our own
    /// keypair is minted lazily on the first encrypt.
    pub fn initiator(root_key: [u8; 32], peer_spk: VerifyingKey) -> Self {
        Self {
            ck: root_key,
            x: None,
            x_pub: None,
            y_pub: Some(peer_spk),
            index: 0,
            last_sender: Sender::Me,
        }
    }

    /// First receiver: our signed prekey pair is the initial ratchet key;
    /// the peer's key arrives with their first message.
    pub fn responder(root_key: [u8; 32], own_sk: SigningKey, own_spk: VerifyingKey) -> Self {
        Self {
            ck: root_key,
            x: Some(own_sk),
            x_pub: Some(own_spk),
            y_pub: None,
            index: 0,
            last_sender: Sender::Them,
        }
    }

    // ── Encrypt ──────────────────────────────────────────────────────────

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<SealedMessage, CryptoError> {
        let dh = if self.index == 0 || self.last_sender == Sender::Them {
            let peer = self
                .y_pub
                .clone()
                .ok_or(CryptoError::RatchetState("peer ratchet key"))?;
            let (x, x_pub) = generate_keypair();
            let dh = ecdh(&x, &peer);
            self.x = Some(x);
            self.x_pub = Some(x_pub);
            Some(dh)
        } else {
            None
        };

        let mut ikm = Vec::with_capacity(64);
        if let Some(dh) = &dh {
            ikm.extend_from_slice(dh);
        }
        ikm.extend_from_slice(&self.ck);
        let (mk, next_ck) = kdf_chain(&ikm);
        ikm.zeroize();
        self.ck = next_ck;

        let (iv, cipher, tag) = aead_encrypt(&mk, plaintext, RATCHET_AAD)?;
        let sealed = SealedMessage {
            cipher,
            iv,
            tag,
            index: self.index,
            ratchet_key: self
                .x_pub
                .clone()
                .ok_or(CryptoError::RatchetState("own ratchet key"))?,
        };
        self.index += 1;
        self.last_sender = Sender::Me;
        Ok(sealed)
    }

    // ── Decrypt ──────────────────────────────────────────────────────────

    /// Derive the message key for `message` and open it. State is committed
    /// only on success; any failure leaves `self` exactly as it was.
    pub fn decrypt(&mut self, message: &SealedMessage) -> Result<Vec<u8>, CryptoError> {
        let peer = message.ratchet_key.clone();

        let dh = if message.index == 0 || self.last_sender == Sender::Me {
            let x = self
                .x
                .as_ref()
                .ok_or(CryptoError::RatchetState("own ratchet key"))?;
            Some(ecdh(x, &peer))
        } else {
            None
        };

        let mut ikm = Vec::with_capacity(64);
        if let Some(dh) = &dh {
            ikm.extend_from_slice(dh);
        }
        ikm.extend_from_slice(&self.ck);
        let (mk, next_ck) = kdf_chain(&ikm);
        ikm.zeroize();

        let plaintext = aead_decrypt(&mk, &message.iv, &message.cipher, RATCHET_AAD, &message.tag)?;

        self.ck = next_ck;
        self.y_pub = Some(peer);
        self.index = message.index + 1;
        self.last_sender = Sender::Them;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{generate_keypair, random_bytes};

    fn fresh_pair() -> (RatchetState, RatchetState) {
        let (sk, spk) = generate_keypair();
        let root: [u8; 32] = random_bytes();
        (
            RatchetState::initiator(root, spk),
            RatchetState::responder(root, sk, spk),
        )
    }

    #[test]
    fn conversation_with_turn_taking() {
        let (mut alice, mut bob) = fresh_pair();

        let m1 = alice.encrypt(b"Hey").unwrap();
        let m2 = alice.encrypt(b"How are you?").unwrap();
        assert_eq!(bob.decrypt(&m1).unwrap(), b"Hey");
        assert_eq!(bob.decrypt(&m2).unwrap(), b"How are you?");

        let m3 = bob.encrypt(b"Good, thanks!").unwrap();
        let m4 = bob.encrypt(b"Want to meet up?").unwrap();
        assert_eq!(alice.decrypt(&m3).unwrap(), b"Good, thanks!");
        assert_eq!(alice.decrypt(&m4).unwrap(), b"Want to meet up?");

        let m5 = alice.encrypt(b"Sure, when?").unwrap();
        assert_eq!(bob.decrypt(&m5).unwrap(), b"Sure, when?");

        let m6 = bob.encrypt(b"Tomorrow?").unwrap();
        let m7 = bob.encrypt(b"Maybe 18:00?").unwrap();
        let m8 = bob.encrypt(b"Where?").unwrap();
        assert_eq!(alice.decrypt(&m6).unwrap(), b"Tomorrow?");
        assert_eq!(alice.decrypt(&m7).unwrap(), b"Maybe 18:00?");
        assert_eq!(alice.decrypt(&m8).unwrap(), b"Where?");

        let m9 = alice.encrypt(b"At the park").unwrap();
        assert_eq!(bob.decrypt(&m9).unwrap(), b"At the park");
    }

    #[test]
    fn ratchet_key_rotates_on_speaker_switch_only() {
        let (mut alice, mut bob) = fresh_pair();

        let a1 = alice.encrypt(b"one").unwrap();
        let a2 = alice.encrypt(b"two").unwrap();
        assert_eq!(
            canonical_public(&a1.ratchet_key),
            canonical_public(&a2.ratchet_key)
        );

        bob.decrypt(&a1).unwrap();
        bob.decrypt(&a2).unwrap();
        let b1 = bob.encrypt(b"three").unwrap();
        assert_ne!(
            canonical_public(&b1.ratchet_key),
            canonical_public(&a1.ratchet_key)
        );
        alice.decrypt(&b1).unwrap();

        let a3 = alice.encrypt(b"four").unwrap();
        assert_ne!(
            canonical_public(&a3.ratchet_key),
            canonical_public(&a1.ratchet_key)
        );
        assert_eq!(bob.decrypt(&a3).unwrap(), b"four");
    }

    #[test]
    fn chain_key_advances_every_message() {
        let (mut alice, _) = fresh_pair();
        let before = alice.ck;
        alice.encrypt(b"x").unwrap();
        let mid = alice.ck;
        alice.encrypt(b"y").unwrap();
        assert_ne!(before, mid);
        assert_ne!(mid, alice.ck);
    }

    #[test]
    fn corrupted_ciphertext_rolls_back() {
        let (mut alice, mut bob) = fresh_pair();

        let genuine = alice.encrypt(b"hello").unwrap();
        let mut tampered = genuine.clone();
        tampered.cipher[0] ^= 0xFF;

        let snapshot = bob.clone();
        assert!(bob.decrypt(&tampered).is_err());
        assert_eq!(bob, snapshot);

        // The untampered original still decrypts afterwards.
        assert_eq!(bob.decrypt(&genuine).unwrap(), b"hello");
    }
}

//! Client-side key material.
//!
//! Each user owns one long-term identity keypair (ik, IPK), one signed
//! prekey (sk, SPK, sigma) and a pool of one-time prekeys. The identity
//! key and signed prekey are generated once on first registration and
//! never rotated. One-time prekeys are consumed front-first, one per
//! inbound handshake, and replenished in batches when the pool runs dry.
//!
//! sigma is an ECDSA signature of SPK's canonical SEC1 encoding under ik;
//! initiators must verify it before doing any DH against the bundle.

use crate::primitives::{
    canonical_public, generate_keypair, sign, SigningKey, VerifyingKey,
};

/// How many one-time prekeys are minted per batch.
pub const ONE_TIME_PREKEY_BATCH: usize = 5;

/// The published view of a user's keys, as uploaded at registration.
#[derive(Debug, Clone)]
pub struct KeyBundle {
    pub ipk: VerifyingKey,
    pub spk: VerifyingKey,
    pub sigma: Vec<u8>,
    pub opks: Vec<VerifyingKey>,
}

/// Full private key material for one user.
pub struct KeyRing {
    pub ik: SigningKey,
    pub ipk: VerifyingKey,
    pub sk: SigningKey,
    pub spk: VerifyingKey,
    pub sigma: Vec<u8>,
    /// One-time prekey private halves, index-aligned with `opks`.
    pub oks: Vec<SigningKey>,
    pub opks: Vec<VerifyingKey>,
}

impl KeyRing {
    /// Mint a complete fresh key set: identity, signed prekey and one batch
    /// of one-time prekeys.
    pub fn generate() -> Self {
        let (ik, ipk) = generate_keypair();
        let (sk, spk, sigma) = generate_signed_prekey(&ik);
        let pool = generate_one_time_prekeys(ONE_TIME_PREKEY_BATCH);
        let (oks, opks) = pool.into_iter().unzip();
        Self { ik, ipk, sk, spk, sigma, oks, opks }
    }

    pub fn bundle(&self) -> KeyBundle {
        KeyBundle {
            ipk: self.ipk.clone(),
            spk: self.spk.clone(),
            sigma: self.sigma.clone(),
            opks: self.opks.clone(),
        }
    }

    /// Remove and return the oldest one-time prekey pair.
    pub fn consume_one_time_prekey(&mut self) -> Option<(SigningKey, VerifyingKey)> {
        if self.oks.is_empty() || self.opks.is_empty() {
            return None;
        }
        Some((self.oks.remove(0), self.opks.remove(0)))
    }

    /// Mint a fresh batch, append it to the pool, and return the public
    /// halves for upload.
    pub fn replenish(&mut self) -> Vec<VerifyingKey> {
        let batch = generate_one_time_prekeys(ONE_TIME_PREKEY_BATCH);
        let mut published = Vec::with_capacity(batch.len());
        for (ok, opk) in batch {
            published.push(opk.clone());
            self.oks.push(ok);
            self.opks.push(opk);
        }
        published
    }
}

/// A signed prekey: fresh keypair plus sigma = ECDSA(ik, canonical(SPK)).
pub fn generate_signed_prekey(ik: &SigningKey) -> (SigningKey, VerifyingKey, Vec<u8>) {
    let (sk, spk) = generate_keypair();
    let sigma = sign(ik, &canonical_public(&spk));
    (sk, spk, sigma)
}

pub fn generate_one_time_prekeys(amount: usize) -> Vec<(SigningKey, VerifyingKey)> {
    (0..amount).map(|_| generate_keypair()).collect()
}

//! X3DH asynchronous key agreement.
//!
//! Reference: <https://signal.org/docs/specifications/x3dh/>
//!
//! The initiator A fetches B's published bundle {IPK_B, SPK_B, sigma_B,
//! OPK_B} from the relay (which pops exactly one OPK) and computes, with a
//! single fresh ephemeral key ek:
//!
//!   DH1 = ecdh(ik_A, SPK_B)
//!   DH2 = ecdh(ek_A, IPK_B)
//!   DH3 = ecdh(ek_A, SPK_B)
//!   DH4 = ecdh(ek_A, OPK_B)
//!   SK  = HKDF-SHA256(salt = absent, ikm = DH1 || DH2 || DH3 || DH4, L = 32)
//!
//! A then proves possession of SK by AEAD-encrypting its own username with
//! AAD = canonical(IPK_A) || canonical(IPK_B); the responder recomputes SK
//! from its own private halves, decrypts the challenge and requires the
//! plaintext to equal the claimed sender name.
//!
//! Non-negotiable: sigma_B MUST verify against canonical(SPK_B) under IPK_B
//! before any DH is computed. A bad signature aborts with no state change.

use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::primitives::{
    aead_encrypt, aead_decrypt, canonical_public, ecdh, generate_keypair, hkdf_extract, verify,
    SigningKey, VerifyingKey,
};

// ── Fetched bundle ───────────────────────────────────────────────────────────

/// One user's published keys as handed to an initiator: the stored bundle
/// with exactly one one-time prekey popped off by the relay.
#[derive(Debug, Clone)]
pub struct FetchedBundle {
    pub owner: String,
    pub ipk: VerifyingKey,
    pub spk: VerifyingKey,
    pub sigma: Vec<u8>,
    pub opk: VerifyingKey,
}

impl FetchedBundle {
    /// Check sigma against the canonical SPK encoding under the bundle's
    /// identity key.
    pub fn verify_signature(&self) -> bool {
        verify(&self.sigma, &canonical_public(&self.spk), &self.ipk)
    }
}

// ── Initiator ────────────────────────────────────────────────────────────────

/// Everything the initiator produces: the shared secret to keep, and the
/// material to send in the reaction record.
pub struct Initiation {
    pub shared_secret: [u8; 32],
    pub epk: VerifyingKey,
    pub challenge_iv: [u8; 12],
    pub challenge_cipher: Vec<u8>,
    pub challenge_tag: [u8; 16],
}

pub fn initiate(
    username: &str,
    ik: &SigningKey,
    ipk: &VerifyingKey,
    bundle: &FetchedBundle,
) -> Result<Initiation, CryptoError> {
    if !bundle.verify_signature() {
        return Err(CryptoError::SignatureVerification);
    }

    let (ek, epk) = generate_keypair();

    let mut ikm = Vec::with_capacity(128);
    ikm.extend_from_slice(&ecdh(ik, &bundle.spk));
    ikm.extend_from_slice(&ecdh(&ek, &bundle.ipk));
    ikm.extend_from_slice(&ecdh(&ek, &bundle.spk));
    ikm.extend_from_slice(&ecdh(&ek, &bundle.opk));

    let mut shared_secret = [0u8; 32];
    hkdf_extract(None, &ikm, &mut shared_secret)?;
    ikm.zeroize();

    let mut aad = canonical_public(ipk);
    aad.extend_from_slice(&canonical_public(&bundle.ipk));
    let (challenge_iv, challenge_cipher, challenge_tag) =
        aead_encrypt(&shared_secret, username.as_bytes(), &aad)?;

    Ok(Initiation {
        shared_secret,
        epk,
        challenge_iv,
        challenge_cipher,
        challenge_tag,
    })
}

// ── Responder ────────────────────────────────────────────────────────────────

/// Recompute the shared secret from the responder's private halves and the
/// initiator's public material. `ok` is the consumed one-time prekey.
pub fn react(
    ik: &SigningKey,
    sk: &SigningKey,
    ok: &SigningKey,
    ipk_initiator: &VerifyingKey,
    epk_initiator: &VerifyingKey,
) -> Result<[u8; 32], CryptoError> {
    let mut ikm = Vec::with_capacity(128);
    ikm.extend_from_slice(&ecdh(sk, ipk_initiator));
    ikm.extend_from_slice(&ecdh(ik, epk_initiator));
    ikm.extend_from_slice(&ecdh(sk, epk_initiator));
    ikm.extend_from_slice(&ecdh(ok, epk_initiator));

    let mut shared_secret = [0u8; 32];
    hkdf_extract(None, &ikm, &mut shared_secret)?;
    ikm.zeroize();
    Ok(shared_secret)
}

/// Decrypt the initiator's challenge and require the plaintext to equal the
/// claimed sender username.
pub fn open_challenge(
    shared_secret: &[u8; 32],
    iv: &[u8],
    cipher: &[u8],
    tag: &[u8],
    ipk_initiator: &VerifyingKey,
    ipk_responder: &VerifyingKey,
    claimed_sender: &str,
) -> Result<(), CryptoError> {
    let mut aad = canonical_public(ipk_initiator);
    aad.extend_from_slice(&canonical_public(ipk_responder));
    let plaintext = aead_decrypt(shared_secret, iv, cipher, &aad, tag)?;
    if plaintext != claimed_sender.as_bytes() {
        return Err(CryptoError::ChallengeMismatch);
    }
    Ok(())
}

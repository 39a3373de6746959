//! Curve and symmetric primitives.
//!
//! Everything in this module is a thin wrapper over RustCrypto:
//!   - ECDH and ECDSA-SHA256 on NIST P-256 (`p256`)
//!   - HKDF-SHA256 and HMAC-SHA256 (`hkdf`, `hmac`)
//!   - AES-256-GCM with a random 96-bit iv and detached tag (`aes-gcm`)
//!
//! ECDH output is the 32-byte X coordinate of the scalar-point product.
//! ECDSA signatures are DER encoded; nonces are deterministic per RFC 6979,
//! which keeps test vectors reproducible without an explicit nonce input.
//!
//! The canonical encoding of a public key, used wherever a key is signed or
//! fed into AEAD associated data, is the SEC1 compressed point (33 bytes).

use aes_gcm::{aead::AeadInPlace, Aes256Gcm, Key, KeyInit, Nonce, Tag};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::Signature;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::error::CryptoError;

pub use p256::ecdsa::{SigningKey, VerifyingKey};

type HmacSha256 = Hmac<Sha256>;

// ── Key generation and encoding ──────────────────────────────────────────────

/// Generate a fresh P-256 keypair.
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let private = SigningKey::random(&mut OsRng);
    let public = VerifyingKey::from(&private);
    (private, public)
}

/// Canonical public encoding: SEC1 compressed point, 33 bytes.
pub fn canonical_public(key: &VerifyingKey) -> Vec<u8> {
    key.to_encoded_point(true).as_bytes().to_vec()
}

pub fn verifying_key_from_sec1(bytes: &[u8]) -> Result<VerifyingKey, CryptoError> {
    VerifyingKey::from_sec1_bytes(bytes)
        .map_err(|e| CryptoError::InvalidKey(format!("bad SEC1 public key: {e}")))
}

/// Private scalar, big-endian, 32 bytes.
pub fn signing_key_to_bytes(key: &SigningKey) -> [u8; 32] {
    key.to_bytes().into()
}

pub fn signing_key_from_bytes(bytes: &[u8]) -> Result<SigningKey, CryptoError> {
    SigningKey::from_slice(bytes)
        .map_err(|e| CryptoError::InvalidKey(format!("bad private scalar: {e}")))
}

// ── ECDH ─────────────────────────────────────────────────────────────────────

/// X coordinate of `public * private`, 32 bytes.
pub fn ecdh(private: &SigningKey, public: &VerifyingKey) -> [u8; 32] {
    let shared = p256::ecdh::diffie_hellman(private.as_nonzero_scalar(), public.as_affine());
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes().as_slice());
    out
}

// ── ECDSA ────────────────────────────────────────────────────────────────────

/// ECDSA-SHA256 over `message`, DER encoded.
pub fn sign(private: &SigningKey, message: &[u8]) -> Vec<u8> {
    let signature: Signature = private.sign(message);
    signature.to_der().as_bytes().to_vec()
}

/// Returns false on any malformed signature or key; never panics.
pub fn verify(signature: &[u8], message: &[u8], public: &VerifyingKey) -> bool {
    match Signature::from_der(signature) {
        Ok(sig) => public.verify(message, &sig).is_ok(),
        Err(_) => false,
    }
}

// ── KDFs ─────────────────────────────────────────────────────────────────────

/// HKDF-SHA256 extract-and-expand with empty info. An absent salt is the
/// RFC 5869 default of a hash-length zero block.
pub fn hkdf_extract(salt: Option<&[u8]>, ikm: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
    Hkdf::<Sha256>::new(salt, ikm)
        .expand(&[], out)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// HKDF-SHA256 expand step only.
pub fn hkdf_expand(prk: &[u8], info: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
    Hkdf::<Sha256>::new(None, prk)
        .expand(info, out)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Chain step: 64 bytes of HKDF output split into (message_key, next_chain_key).
pub fn kdf_chain(ikm: &[u8]) -> ([u8; 32], [u8; 32]) {
    let mut okm = [0u8; 64];
    Hkdf::<Sha256>::new(None, ikm)
        .expand(&[], &mut okm)
        .expect("64 bytes is a valid HKDF-SHA256 output length");
    let mut mk = [0u8; 32];
    let mut ck = [0u8; 32];
    mk.copy_from_slice(&okm[..32]);
    ck.copy_from_slice(&okm[32..]);
    (mk, ck)
}

pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac =
        <HmacSha256 as KeyInit>::new_from_slice(key).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// salted_password = HMAC-SHA256(salt, utf8(password) || pepper).
pub fn salt_password(password: &str, salt: &[u8], pepper: &[u8]) -> [u8; 32] {
    let mut content = password.as_bytes().to_vec();
    content.extend_from_slice(pepper);
    hmac_sha256(salt, &content)
}

// ── AEAD ─────────────────────────────────────────────────────────────────────

/// AES-256-GCM with a fresh random 12-byte iv and a detached 16-byte tag.
pub fn aead_encrypt(
    key: &[u8; 32],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<([u8; 12], Vec<u8>, [u8; 16]), CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let iv = random_bytes::<12>();
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), aad, &mut buffer)
        .map_err(|_| CryptoError::AeadEncrypt)?;
    Ok((iv, buffer, tag.into()))
}

pub fn aead_decrypt(
    key: &[u8; 32],
    iv: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
    tag: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != 12 || tag.len() != 16 {
        return Err(CryptoError::AeadDecrypt);
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(iv), aad, &mut buffer, Tag::from_slice(tag))
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(buffer)
}

// ── Randomness ───────────────────────────────────────────────────────────────

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let (private, public) = generate_keypair();
        let sig = sign(&private, b"bundle material");
        assert!(verify(&sig, b"bundle material", &public));
        assert!(!verify(&sig, b"other material", &public));
    }

    #[test]
    fn verify_rejects_garbage_without_panicking() {
        let (_, public) = generate_keypair();
        assert!(!verify(b"", b"msg", &public));
        assert!(!verify(&[0u8; 70], b"msg", &public));
        assert!(!verify(b"\x30\x02\x01\x00", b"msg", &public));
    }

    #[test]
    fn ecdh_is_symmetric() {
        let (a, pub_a) = generate_keypair();
        let (b, pub_b) = generate_keypair();
        assert_eq!(ecdh(&a, &pub_b), ecdh(&b, &pub_a));
    }

    #[test]
    fn key_encodings_roundtrip() {
        let (private, public) = generate_keypair();
        let restored = signing_key_from_bytes(&signing_key_to_bytes(&private)).unwrap();
        assert_eq!(signing_key_to_bytes(&restored), signing_key_to_bytes(&private));
        let point = canonical_public(&public);
        assert_eq!(point.len(), 33);
        let restored = verifying_key_from_sec1(&point).unwrap();
        assert_eq!(canonical_public(&restored), point);
    }

    #[test]
    fn kdf_chain_is_deterministic_and_splits() {
        let (mk1, ck1) = kdf_chain(&[7u8; 32]);
        let (mk2, ck2) = kdf_chain(&[7u8; 32]);
        assert_eq!(mk1, mk2);
        assert_eq!(ck1, ck2);
        assert_ne!(mk1, ck1);
    }

    #[test]
    fn salt_password_matches_hmac_definition() {
        let salt = [1u8; 32];
        let pepper = [2u8; 32];
        let mut content = b"hunter2".to_vec();
        content.extend_from_slice(&pepper);
        assert_eq!(
            salt_password("hunter2", &salt, &pepper),
            hmac_sha256(&salt, &content)
        );
    }

    #[test]
    fn aead_roundtrip_and_tamper_detection() {
        let key = [9u8; 32];
        let (iv, ct, tag) = aead_encrypt(&key, b"hello", b"AD").unwrap();
        assert_eq!(aead_decrypt(&key, &iv, &ct, b"AD", &tag).unwrap(), b"hello");

        let mut bad = ct.clone();
        bad[0] ^= 1;
        assert!(aead_decrypt(&key, &iv, &bad, b"AD", &tag).is_err());
        assert!(aead_decrypt(&key, &iv, &ct, b"XX", &tag).is_err());
        assert!(aead_decrypt(&key, &[0u8; 3], &ct, b"AD", &tag).is_err());
    }

    #[test]
    fn hkdf_absent_salt_equals_zero_salt() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        hkdf_extract(None, b"ikm", &mut a).unwrap();
        hkdf_extract(Some(&[0u8; 32]), b"ikm", &mut b).unwrap();
        assert_eq!(a, b);
    }
}

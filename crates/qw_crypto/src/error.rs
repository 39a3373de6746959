use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch)")]
    AeadDecrypt,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("signed prekey signature verification failed")]
    SignatureVerification,

    #[error("handshake challenge did not match the claimed sender")]
    ChallengeMismatch,

    #[error("ratchet state is missing {0}")]
    RatchetState(&'static str),

    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}

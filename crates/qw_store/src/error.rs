use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store file is corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Proto(#[from] qw_proto::ProtoError),

    #[error(transparent)]
    Crypto(#[from] qw_crypto::CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

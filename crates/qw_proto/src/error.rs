use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("unknown record kind '{0}'")]
    UnknownKind(String),

    #[error("value cannot be encoded: {0}")]
    Unencodable(String),

    #[error("frame exceeds the size limit")]
    Oversized,

    #[error("record is missing field '{0}'")]
    MissingField(&'static str),

    #[error(transparent)]
    Crypto(#[from] qw_crypto::CryptoError),

    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

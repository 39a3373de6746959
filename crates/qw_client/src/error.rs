use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid username '{0}'")]
    InvalidUsername(String),

    #[error("connection closed")]
    Disconnected,

    #[error("local store is missing {0}")]
    MissingState(&'static str),

    #[error("local store is corrupt: {0}")]
    CorruptState(&'static str),

    #[error("no session with {0}")]
    NoSession(String),

    #[error(transparent)]
    Store(#[from] qw_store::StoreError),

    #[error(transparent)]
    Proto(#[from] qw_proto::ProtoError),

    #[error(transparent)]
    Crypto(#[from] qw_crypto::CryptoError),

    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] qw_store::StoreError),

    #[error(transparent)]
    Proto(#[from] qw_proto::ProtoError),

    #[error(transparent)]
    Crypto(#[from] qw_crypto::CryptoError),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

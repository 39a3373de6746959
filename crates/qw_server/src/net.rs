//! TLS accept loop and per-connection tasks.
//!
//! One task per connection reads and dispatches records; a sibling writer
//! task drains the connection's outbound channel so handlers and other
//! connections can send without touching the socket. Record boundaries are
//! preserved by the length-prefixed framing; any framing or decode error
//! drops the connection.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{rustls, TlsAcceptor};

use qw_proto::framing::{read_record, write_record};
use qw_proto::Record;

use crate::error::ServerError;
use crate::handlers::{self, Connection, Flow};
use crate::state::ServerState;

pub struct ServerConfig {
    pub bind: SocketAddr,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub data_dir: PathBuf,
}

// ── TLS setup ────────────────────────────────────────────────────────────────

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        ServerError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "no private key found in key file",
        ))
    })
}

pub fn tls_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor, ServerError> {
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certs(cert)?, load_private_key(key)?)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

// ── Accept loop ──────────────────────────────────────────────────────────────

pub async fn run(config: ServerConfig) -> Result<(), ServerError> {
    let state = Arc::new(ServerState::open(&config.data_dir)?);
    let acceptor = tls_acceptor(&config.cert, &config.key)?;
    let listener = TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %config.bind, "relay listening");

    loop {
        let (stream, addr) = listener.accept().await?;
        let state = state.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(state, acceptor, stream, addr).await {
                tracing::warn!(%addr, error = %e, "connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    state: Arc<ServerState>,
    acceptor: TlsAcceptor,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), ServerError> {
    tracing::info!(%addr, "new connection");
    let tls = acceptor.accept(stream).await?;
    let (mut reader, mut writer) = tokio::io::split(tls);

    let (tx, mut rx) = mpsc::unbounded_channel::<Record>();
    let writer_task = tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            if write_record(&mut writer, &record).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    // The connection must identify itself before anything else.
    let conn = match read_record(&mut reader).await {
        Ok(Some(first)) => handlers::check_identity(&state, &tx, &first).await?,
        Ok(None) => None,
        Err(e) => {
            tracing::warn!(%addr, error = %e, "undecodable first record");
            None
        }
    };
    let Some(conn) = conn else {
        drop(tx);
        let _ = writer_task.await;
        tracing::info!(%addr, "connection closed before identification");
        return Ok(());
    };

    let result = connection_loop(&state, &conn, &mut reader).await;

    // Log the user out and free the name, whatever ended the loop.
    state.unregister_peer(&conn.username).await;
    state.stores().await.set_logged_in(&conn.username, false)?;
    tracing::info!(%addr, user = %conn.username, "connection closed");

    drop(conn);
    drop(tx);
    let _ = writer_task.await;
    result
}

async fn connection_loop<R>(
    state: &ServerState,
    conn: &Connection,
    reader: &mut R,
) -> Result<(), ServerError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        match read_record(reader).await {
            Ok(Some(record)) => match handlers::dispatch(state, conn, record).await? {
                Flow::Continue => {}
                Flow::Close => return Ok(()),
            },
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!(user = %conn.username, error = %e, "dropping connection");
                return Ok(());
            }
        }
    }
}

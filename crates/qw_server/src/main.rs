use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use qw_server::net::{run, ServerConfig};

/// QuietWire relay server.
#[derive(Parser)]
#[command(name = "qw-server", version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:25567")]
    bind: SocketAddr,

    /// TLS certificate chain (PEM).
    #[arg(long, default_value = "server.pem")]
    cert: PathBuf,

    /// TLS private key (PEM).
    #[arg(long, default_value = "server.key")]
    key: PathBuf,

    /// Directory for the user database and pepper store.
    #[arg(long, default_value = "db")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    run(ServerConfig {
        bind: args.bind,
        cert: args.cert,
        key: args.key,
        data_dir: args.data_dir,
    })
    .await?;
    Ok(())
}

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use qw_client::net::{run, ClientConfig};

/// QuietWire interactive chat client.
#[derive(Parser)]
#[command(name = "qw-client", version, about)]
struct Args {
    /// Relay host name.
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Relay port.
    #[arg(long, default_value_t = 25567)]
    port: u16,

    /// Pinned relay certificate (PEM).
    #[arg(long, default_value = "server.pem")]
    cert: PathBuf,

    /// Directory for per-user encrypted stores.
    #[arg(long, default_value = "db")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    run(ClientConfig {
        host: args.host,
        port: args.port,
        cert: args.cert,
        data_dir: args.data_dir,
    })
    .await?;
    Ok(())
}

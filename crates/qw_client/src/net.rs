//! Pinned-certificate TLS connection and the interactive terminal shell.
//!
//! The relay is authenticated against the certificate file alone: the
//! trust store contains exactly the pinned `server.pem`, nothing from the
//! system. The shell is a thin consumer of the session core: it pumps
//! decoded records in, reacts to events (mostly by printing or prompting
//! for a password) and translates typed commands into core operations.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Write as _};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as AsyncBufReader, Lines, Stdin};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{rustls, TlsConnector};

use qw_proto::framing::{read_record, write_record};
use qw_proto::{ProtoError, Record, SERVER_NAME};

use crate::error::ClientError;
use crate::session::{ClientEvent, ClientSession, Flow};

pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub cert: PathBuf,
    pub data_dir: PathBuf,
}

// ── Transport ────────────────────────────────────────────────────────────────

/// Open a TCP connection and wrap it in TLS anchored to the pinned
/// certificate file.
pub async fn connect(config: &ClientConfig) -> Result<TlsStream<TcpStream>, ClientError> {
    let mut roots = rustls::RootCertStore::empty();
    let mut reader = BufReader::new(File::open(&config.cert)?);
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert?)?;
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let tcp = TcpStream::connect((config.host.as_str(), config.port)).await?;
    let name = ServerName::try_from(config.host.clone()).map_err(|_| {
        ClientError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "host is not a valid TLS server name",
        ))
    })?;
    Ok(connector.connect(name, tcp).await?)
}

// ── Interactive shell ────────────────────────────────────────────────────────

type StdinLines = Lines<AsyncBufReader<Stdin>>;

async fn prompt(lines: &mut StdinLines, text: &str) -> Result<String, ClientError> {
    print!("{text}");
    std::io::stdout().flush()?;
    Ok(lines.next_line().await?.unwrap_or_default().trim().to_string())
}

pub async fn run(config: ClientConfig) -> Result<(), ClientError> {
    let stream = connect(&config).await?;
    println!("Connected to relay {}:{}.", config.host, config.port);
    let (mut reader, mut writer) = tokio::io::split(stream);

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Record>();
    let writer_task = tokio::spawn(async move {
        while let Some(record) = outbound_rx.recv().await {
            if write_record(&mut writer, &record).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let username = prompt(&mut lines, "Enter your username: ").await?;
    let mut session = ClientSession::open(&config.data_dir, &username, outbound_tx.clone())?;
    session.identify()?;

    // Records are read by a dedicated task so the select loop below only
    // ever parks on cancel-safe channel reads.
    let (inbound_tx, mut inbound_rx) =
        mpsc::unbounded_channel::<Result<Option<Record>, ProtoError>>();
    let reader_task = tokio::spawn(async move {
        loop {
            let incoming = read_record(&mut reader).await;
            let done = !matches!(incoming, Ok(Some(_)));
            if inbound_tx.send(incoming).is_err() || done {
                break;
            }
        }
    });

    let result = shell_loop(&mut session, &mut lines, &mut inbound_rx).await;

    drop(session);
    drop(outbound_tx);
    reader_task.abort();
    let _ = writer_task.await;
    result
}

async fn shell_loop(
    session: &mut ClientSession,
    lines: &mut StdinLines,
    inbound: &mut mpsc::UnboundedReceiver<Result<Option<Record>, ProtoError>>,
) -> Result<(), ClientError> {
    loop {
        tokio::select! {
            incoming = inbound.recv() => match incoming {
                Some(Ok(Some(record))) => {
                    let (flow, events) = session.on_record(record)?;
                    for event in events {
                        handle_event(session, lines, event).await?;
                    }
                    if flow == Flow::Stop {
                        return Ok(());
                    }
                }
                Some(Ok(None)) | None => {
                    println!("Connection closed.");
                    return Ok(());
                }
                Some(Err(e)) => {
                    println!("Relay sent an undecodable record ({e}). Closing.");
                    return Ok(());
                }
            },
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_command(session, line.trim())? {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            },
        }
    }
}

async fn handle_event(
    session: &mut ClientSession,
    lines: &mut StdinLines,
    event: ClientEvent,
) -> Result<(), ClientError> {
    match event {
        ClientEvent::NeedsRegistration => {
            println!("User not registered.");
            let password = prompt(lines, "Enter your new password: ").await?;
            println!("Computing keys and sending registration request...");
            session.register(&password)?;
        }
        ClientEvent::RegisteredAwaitLogin => {
            println!("User registered successfully. You can now log in.");
            let password = prompt(lines, "Enter your password: ").await?;
            session.login(&password)?;
        }
        ClientEvent::SaltReceived => {
            let password = prompt(lines, "Received salt for login. Please enter your password: ")
                .await?;
            session.login(&password)?;
        }
        ClientEvent::LoggedIn => {
            println!("Logged in successfully.");
            println!("Type 'init <user>' to initiate a key exchange and open a chat.");
            println!("Type 'msg <user> <message>' to chat.");
            println!("Type 'reset <user|server>' to reset a chat or delete your account.");
            println!("Type 'exit' to close the connection.");
        }
        ClientEvent::Message { from, text } => println!("{from}: {text}"),
        ClientEvent::ResetBy(peer) => {
            println!("Received reset request from {peer}; the chat was deleted.");
        }
        ClientEvent::Info(text) => println!("{text}"),
    }
    Ok(())
}

/// Returns false when the shell should exit.
fn handle_command(session: &mut ClientSession, line: &str) -> Result<bool, ClientError> {
    if line.is_empty() {
        return Ok(true);
    }
    if line.eq_ignore_ascii_case("exit") {
        println!("Closing connection.");
        return Ok(false);
    }

    let mut parts = line.split_whitespace().collect::<VecDeque<_>>();
    let (Some(command), Some(target)) = (parts.pop_front(), parts.pop_front()) else {
        println!("Invalid command. Use 'init <user>', 'msg <user> <text>' or 'reset <user|server>'.");
        return Ok(true);
    };

    if target == session.username() {
        println!("You cannot send messages to yourself.");
        return Ok(true);
    }

    match command {
        "init" => {
            if target == SERVER_NAME {
                println!("You cannot initiate a key exchange with the server.");
            } else if session.initiate_x3dh(target)? {
                println!("Requesting key bundle for {target}...");
            } else {
                println!(
                    "Already have a session with {target}. Use 'reset {target}' or 'msg {target} <text>'."
                );
            }
        }
        "msg" | "message" | "send" => {
            if target == SERVER_NAME {
                println!("You cannot send a message to the server.");
                return Ok(true);
            }
            let text = parts.into_iter().collect::<Vec<_>>().join(" ");
            match session.send_text(target, &text) {
                Ok(true) => {}
                Ok(false) => println!("Empty messages aren't allowed."),
                Err(ClientError::NoSession(peer)) => {
                    println!("No shared secret found for {peer}. Initiate a chat using 'init {peer}'.");
                }
                Err(e) => return Err(e),
            }
        }
        "reset" => {
            session.reset(target)?;
            if target == SERVER_NAME {
                println!("Account reset. Closing connection.");
                return Ok(false);
            }
            println!("Deleted shared secret, chat and key bundle for {target}.");
        }
        _ => {
            println!("Unknown command. Please use 'init', 'msg' or 'reset'.");
        }
    }
    Ok(true)
}

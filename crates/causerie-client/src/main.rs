//! # causerie
//!
//! Terminal front end for the Causerie chat client. Lines typed on stdin
//! become chat messages or slash commands; client events are printed to
//! stdout, either as text or as one JSON object per line.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use causerie_client::commands::{files, profile};
use causerie_client::{CallCommand, Client, ClientCommand, ClientConfig, ClientEvent};
use causerie_media::WebRtcBackend;
use causerie_net::WsConnector;
use causerie_shared::UserId;

#[derive(Debug, Parser)]
#[command(name = "causerie")]
#[command(about = "Join a Causerie chat from the terminal")]
struct Cli {
    /// Display name to join as
    name: String,

    /// Broker WebSocket URL
    #[arg(long, env = "CAUSERIE_SERVER_URL")]
    server: Option<String>,

    /// Image to use as profile picture (max 100 KB)
    #[arg(long)]
    profile_image: Option<PathBuf>,

    /// Save received files into this directory
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

const HELP: &str = "\
commands:
  <text>                        send a public message
  /msg <user> <text>            send a private message
  /file <path> [caption]        send a file publicly
  /sendfile <user> <path> [caption]
                                send a file privately
  /avatar <path>                set your profile picture
  /call <user>                  start an audio call
  /accept  /reject  /hangup     answer, decline or end a call
  /mute  /unmute                toggle your microphone
  /quit                         leave the chat";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,causerie_client=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // -----------------------------------------------------------------------
    // 2. Load configuration and profile
    // -----------------------------------------------------------------------
    let mut config = ClientConfig::from_env();
    if let Some(server) = cli.server.clone() {
        config.server_url = server;
    }
    let user = UserId::parse(&cli.name).context("invalid display name")?;
    let profile = match &cli.profile_image {
        Some(path) => Some(
            profile::load_profile_image(path)
                .await
                .map_err(|e| anyhow::anyhow!("cannot load profile image: {e}"))?,
        ),
        None => None,
    };
    if let Some(dir) = &cli.download_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create download dir {}", dir.display()))?;
    }
    info!(user = %user, server = %config.server_url, "Joining");

    // -----------------------------------------------------------------------
    // 3. Start the client and bridge stdin/stdout to it
    // -----------------------------------------------------------------------
    let connector = Box::new(WsConnector::new(config.server_url.clone()));
    let backend = Arc::new(WebRtcBackend::new(config.stun_servers.clone()));
    let (client, handle) = Client::new(&config, user, profile, connector, backend);
    let commands = handle.commands;
    let mut events = handle.events;

    let download_dir = cli.download_dir.clone();
    let json = cli.json;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event, json);
            if let (ClientEvent::NewFile(file), Some(dir)) = (&event, &download_dir) {
                if !file.outgoing {
                    match files::save_attachment(&file.file, dir).await {
                        Ok(path) => println!("* saved {}", path.display()),
                        Err(e) => eprintln!("! could not save {}: {e}", file.name),
                    }
                }
            }
        }
    });

    // Blocking stdin reads get their own thread so they never hold up
    // runtime shutdown
    let input_commands = commands.clone();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            match parse_line(&line) {
                Ok(Some(cmd)) => {
                    let quit = cmd == ClientCommand::Leave;
                    if input_commands.blocking_send(cmd).is_err() || quit {
                        return;
                    }
                }
                Ok(None) => {}
                Err(message) => eprintln!("{message}"),
            }
        }
        let _ = input_commands.blocking_send(ClientCommand::Leave);
    });
    let shutdown = commands.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, leaving");
            let _ = shutdown.send(ClientCommand::Leave).await;
        }
    });
    drop(commands);

    let result = tokio::spawn(client.run())
        .await
        .context("client task failed")?;
    // The event stream ends with the client
    let _ = printer.await;
    result.map_err(|e| anyhow::anyhow!("{e}"))
}

fn parse_line(line: &str) -> Result<Option<ClientCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.starts_with('/') {
        return Ok(Some(ClientCommand::SendMessage {
            content: line.to_string(),
            to: None,
        }));
    }

    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let cmd = match command {
        "/msg" => {
            let (to, content) = split_word(rest).ok_or("usage: /msg <user> <text>")?;
            ClientCommand::SendMessage {
                content: content.to_string(),
                to: Some(parse_user(to)?),
            }
        }
        "/file" => {
            let (path, caption) = split_word(rest).ok_or("usage: /file <path> [caption]")?;
            ClientCommand::SendFile {
                path: PathBuf::from(path),
                caption: caption.to_string(),
                to: None,
            }
        }
        "/sendfile" => {
            let (to, rest) = split_word(rest).ok_or("usage: /sendfile <user> <path> [caption]")?;
            let (path, caption) =
                split_word(rest).ok_or("usage: /sendfile <user> <path> [caption]")?;
            ClientCommand::SendFile {
                path: PathBuf::from(path),
                caption: caption.to_string(),
                to: Some(parse_user(to)?),
            }
        }
        "/avatar" if !rest.is_empty() => ClientCommand::SetProfileImage(PathBuf::from(rest)),
        "/call" if !rest.is_empty() => ClientCommand::Call(CallCommand::Start(parse_user(rest)?)),
        "/accept" => ClientCommand::Call(CallCommand::Accept),
        "/reject" => ClientCommand::Call(CallCommand::Reject),
        "/hangup" => ClientCommand::Call(CallCommand::Hangup),
        "/mute" => ClientCommand::Call(CallCommand::Mute(true)),
        "/unmute" => ClientCommand::Call(CallCommand::Mute(false)),
        "/quit" => ClientCommand::Leave,
        _ => return Err(HELP.to_string()),
    };
    Ok(Some(cmd))
}

/// First word and the (possibly empty) remainder.
fn split_word(s: &str) -> Option<(&str, &str)> {
    if s.is_empty() {
        return None;
    }
    let (word, rest) = s.split_once(' ').unwrap_or((s, ""));
    Some((word, rest.trim()))
}

fn parse_user(name: &str) -> Result<UserId, String> {
    UserId::parse(name).map_err(|e| e.to_string())
}

fn print_event(event: &ClientEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => eprintln!("! cannot encode event: {e}"),
        }
        return;
    }

    match event {
        ClientEvent::ConnectionChanged(p) => println!("* connection: {:?}", p.state),
        ClientEvent::PresenceChanged(p) => {
            let names: Vec<&str> = p.users.iter().map(UserId::as_str).collect();
            println!("* online: {}", names.join(", "));
        }
        ClientEvent::NewMessage(m) => {
            let time = m.timestamp.format("%H:%M");
            match &m.receiver {
                Some(to) if m.outgoing => println!("[{time}] (to {to}) {}", m.content),
                Some(_) => println!("[{time}] (private) {}: {}", m.sender, m.content),
                None => println!("[{time}] {}: {}", m.sender, m.content),
            }
        }
        ClientEvent::NewFile(f) => {
            let time = f.timestamp.format("%H:%M");
            let scope = if f.receiver.is_some() { " (private)" } else { "" };
            println!(
                "[{time}]{scope} {} shared {} ({}, {}) {}",
                f.sender, f.name, f.mime_type, f.size, f.caption
            );
        }
        ClientEvent::SystemNotice(n) => println!("* {}", n.text),
        ClientEvent::CallStateChanged(c) => println!("* call: {}", c.message),
        ClientEvent::Error(e) => eprintln!("! {}", e.message),
    }
}

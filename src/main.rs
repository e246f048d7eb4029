use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};

use chatrelay::chat::{format_help, parse_input, ChatInput, LocalCommand};
use chatrelay::{Config, PeerConnection, PeerEvent, PeerStatus, RelayHandle, RelayServer};

#[tokio::main]
async fn main() {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    // Load configuration
    let config = match Config::load_with_env(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {path}: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    // Initialize logging
    if let Err(e) = chatrelay::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        chatrelay::logging::init_console_only(&config.logging.level);
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    info!("chatrelay starting as {}", config.session.username);

    let (relay, connected) = match start(&config).await {
        Ok(started) => started,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    let (peer, events) = connected;

    run_session(&peer, events).await;

    peer.disconnect().await;
    if let Some(relay) = relay {
        relay.shutdown().await;
        relay.wait().await;
    }
}

type Connected = (PeerConnection, mpsc::UnboundedReceiver<PeerEvent>);

/// Start the relay when hosting, then connect the local peer.
async fn start(config: &Config) -> chatrelay::Result<(Option<RelayHandle>, Connected)> {
    let username = &config.session.username;

    if !config.session.host {
        let connected = PeerConnection::connect(
            config.session.server_addr.as_str(),
            username,
            None,
            config.limits,
        )
        .await?;
        return Ok((None, connected));
    }

    let relay = RelayServer::bind(&config.server, config.limits, username.as_str())
        .await?
        .spawn()?;
    let addr = loopback_for(relay.local_addr());
    println!("Hosting on {}", relay.local_addr());

    let connected =
        PeerConnection::connect(addr, username, Some(relay.host_key()), config.limits).await?;
    Ok((Some(relay), connected))
}

/// Wildcard listen addresses are reached over loopback.
fn loopback_for(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) if v4.ip().is_unspecified() => {
            SocketAddr::from((Ipv4Addr::LOCALHOST, v4.port()))
        }
        SocketAddr::V6(v6) if v6.ip().is_unspecified() => {
            SocketAddr::from((Ipv6Addr::LOCALHOST, v6.port()))
        }
        other => other,
    }
}

/// Pump relay events to the terminal and terminal lines to the relay.
async fn run_session(peer: &PeerConnection, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", format_help());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(PeerEvent::MessageReceived(message)) => println!("{}", message.format()),
                Some(PeerEvent::StatusChanged(status)) => {
                    println!("{}", describe(&status));
                    if !status.is_connected {
                        return;
                    }
                }
                None => return,
            },
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => return,
                    Err(e) => {
                        error!("Failed to read input: {}", e);
                        return;
                    }
                };
                if !handle_line(peer, &line).await {
                    return;
                }
            }
        }
    }
}

/// Act on one input line. Returns false when the user quits.
async fn handle_line(peer: &PeerConnection, line: &str) -> bool {
    let result = match parse_input(line) {
        ChatInput::Message(text) if text.is_empty() => Ok(()),
        ChatInput::Message(text) => peer.send(&text).await,
        ChatInput::Command(LocalCommand::Quit) => return false,
        ChatInput::Command(LocalCommand::Mute(target)) => peer.attempt_mute(&target).await,
        ChatInput::Command(LocalCommand::Admin(target)) => peer.attempt_admin(&target).await,
        ChatInput::Command(LocalCommand::Kick(target)) => peer.attempt_kick(&target).await,
        ChatInput::Command(LocalCommand::Status) => {
            println!("{}", describe(&peer.status()));
            Ok(())
        }
        ChatInput::Command(LocalCommand::Help) => {
            println!("{}", format_help());
            Ok(())
        }
        ChatInput::Command(LocalCommand::Unknown(cmd)) => {
            println!("Unknown command: /{cmd} (try /help)");
            Ok(())
        }
    };

    if let Err(e) = result {
        println!("*** {e}");
    }
    true
}

fn describe(status: &PeerStatus) -> String {
    if !status.is_connected {
        return "*** Disconnected".to_string();
    }
    let mut flags = vec![status.role().to_string()];
    if status.is_muted {
        flags.push("muted".to_string());
    }
    format!("*** Status: {}", flags.join(", "))
}

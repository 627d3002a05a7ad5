use std::{io::BufRead, path::PathBuf, sync::Arc};

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use clap::Parser;
use client_core::{
    websocket_url, AuthGate, ChatClient, ClientEvent, Delivery, Message, SessionEnd,
    TimelineChange, UiCommand, WebSocketConnector,
};
use shared::domain::{LocalIdentity, UserId};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod session;

use session::{SessionStore, StoredSession};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "client.toml")]
    config: PathBuf,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    session_file: Option<PathBuf>,
    #[arg(long)]
    log_filter: Option<String>,
    /// Store this token as the session before connecting.
    #[arg(long, requires = "user_id")]
    token: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
    #[arg(long, default_value = "")]
    email: String,
    #[arg(long, default_value = "")]
    username: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Command(UiCommand),
    Quit,
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let command = match line.split_once(' ').unwrap_or((line, "")) {
        ("/select", peer) if !peer.trim().is_empty() => {
            UiCommand::SelectPeer(UserId::new(peer.trim()))
        }
        ("/close", _) => UiCommand::Deselect,
        ("/older", _) => UiCommand::LoadOlder,
        ("/dismiss", _) => UiCommand::DismissNotification,
        ("/logout", _) => UiCommand::Logout,
        ("/quit", _) => return Some(Input::Quit),
        _ => UiCommand::SendMessage(line.to_string()),
    };
    Some(Input::Command(command))
}

fn format_time(at: DateTime<Utc>, now: DateTime<Local>) -> String {
    let local = at.with_timezone(&Local);
    if local.date_naive() == now.date_naive() {
        local.format("%H:%M").to_string()
    } else {
        local.format("%Y-%m-%d %H:%M").to_string()
    }
}

fn format_message(message: &Message, now: DateTime<Local>) -> String {
    if !message.from_self {
        let at = message
            .timestamp
            .map(|at| format_time(at, now))
            .unwrap_or_default();
        return format!("  < {} [{at}]", message.content);
    }
    let status = match message.delivery() {
        Delivery::Pending => "send failed".to_string(),
        Delivery::Sent { at } => format!("Sent at {}", format_time(at, now)),
        Delivery::Read { at } => format!("Read at {}", format_time(at, now)),
    };
    format!("  > {} ({status})", message.content)
}

/// The part of the timeline a change should (re)print. In-place updates can
/// touch any entry, so they reprint everything.
fn changed_messages(change: TimelineChange, messages: &[Message]) -> &[Message] {
    match change {
        TimelineChange::Reset => &[],
        TimelineChange::Prepended {
            first_page: true, ..
        }
        | TimelineChange::Updated { .. } => messages,
        TimelineChange::Prepended { count, .. } => &messages[..count.min(messages.len())],
        TimelineChange::Appended { count } => &messages[messages.len().saturating_sub(count)..],
    }
}

fn print_event(event: ClientEvent) {
    let now = Local::now();
    match event {
        ClientEvent::ConnectionStateChanged(state) => println!("[connection] {state:?}"),
        ClientEvent::RosterUpdated(contacts) => {
            println!("[contacts]");
            for contact in contacts {
                let marker = if contact.online { "*" } else { " " };
                println!(
                    " {marker} {} ({}) unread={}",
                    contact.display_name(),
                    contact.user_id,
                    contact.unread_count
                );
            }
        }
        ClientEvent::ConversationChanged { peer: Some(peer) } => {
            println!("--- conversation with {} ---", peer.display_name())
        }
        ClientEvent::ConversationChanged { peer: None } => println!("--- no conversation ---"),
        ClientEvent::TimelineUpdated {
            change, messages, ..
        } => {
            match change {
                TimelineChange::Prepended {
                    count,
                    first_page: false,
                } => println!("(loaded {count} older)"),
                TimelineChange::Updated { .. } => println!("(timeline updated)"),
                _ => {}
            }
            for message in changed_messages(change, &messages) {
                println!("{}", format_message(message, now));
            }
        }
        ClientEvent::Notification {
            notification,
            display_name,
        } => println!("[new message from {display_name}] {}", notification.preview),
        ClientEvent::NotificationDismissed => {}
        ClientEvent::AudibleAlert => print!("\x07"),
        ClientEvent::SessionEnded(end) => println!("[session ended] {end:?}"),
        ClientEvent::Error(message) => eprintln!("[error] {message}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = config::load_settings(&args.config);
    if let Some(v) = args.server_url {
        settings.server_url = v;
    }
    if let Some(v) = args.session_file {
        settings.session_file = Some(v);
    }
    if let Some(v) = args.log_filter {
        settings.log_filter = v;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = match settings.session_file.clone() {
        Some(path) => SessionStore::new(path),
        None => SessionStore::new(SessionStore::default_path()?),
    };
    if let (Some(token), Some(user_id)) = (args.token, args.user_id) {
        store.save(&StoredSession {
            token,
            user: LocalIdentity {
                user_id: UserId::new(user_id),
                email: args.email,
                username: args.username,
            },
        })?;
        info!(path = %store.path().display(), "session: stored");
    }
    let session = store.load()?;

    AuthGate::new(settings.server_url.clone())
        .verify(&session.token)
        .await?;

    let url = websocket_url(&settings.server_url, &settings.ws_path)?;
    let connector = Arc::new(WebSocketConnector::new(url, session.token.clone()));
    let client = ChatClient::new(
        session.user.clone(),
        settings.sync_settings(),
        settings.reconnect_policy(),
        connector,
    );

    let mut events = BroadcastStream::new(client.subscribe_events());
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => print_event(event),
                Err(err) => warn!("ui: dropped events: {err}"),
            }
        }
    });

    let (commands, commands_rx) = mpsc::channel(64);
    println!(
        "signed in as {}; /select <user id>, /older, /close, /dismiss, /logout, /quit",
        session.user.user_id
    );
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            match parse_input(&line) {
                Some(Input::Command(command)) => {
                    if commands.blocking_send(command).is_err() {
                        break;
                    }
                }
                Some(Input::Quit) => break,
                None => {}
            }
        }
    });

    let end = client.run(commands_rx).await;
    let _ = printer.await;
    if end == SessionEnd::LoggedOut || matches!(end, SessionEnd::Rejected(_)) {
        store.clear()?;
        info!("session: cleared stored session");
    }

    Ok(())
}

use anyhow::{bail, Context};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use securechat_lib::services::{
    ChatChannel, ChatEvent, ChatMessage, ChatService, ClientConfig, MessageBody,
};
use securechat_lib::AppState;

const HELP: &str = "commands: /dm <user>, /global, /file <url>, /who, /logout, /quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG controls verbosity, e.g. RUST_LOG=securechat_lib=debug
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("rustls crypto provider already installed");
    }

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SECURECHAT_CONFIG").ok())
        .map(PathBuf::from);
    let config = ClientConfig::load(config_path.as_deref()).context("loading configuration")?;
    log::info!("SecureChat v{} starting", env!("CARGO_PKG_VERSION"));

    let (state, events) = AppState::from_config(config).context("initializing client")?;
    let chat = state.chat.clone();

    if chat.restore().await?.is_none() {
        let username = std::env::var("SECURECHAT_USERNAME").ok();
        let password = std::env::var("SECURECHAT_PASSWORD").ok();
        match (username, password) {
            (Some(username), Some(password)) => {
                chat.login(&username, &password)
                    .await
                    .context("login failed")?;
            }
            _ => bail!(
                "no saved session; set SECURECHAT_USERNAME and SECURECHAT_PASSWORD to log in"
            ),
        }
    }

    let printer = tokio::spawn(print_events(chat.clone(), events));
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !handle_line(&chat, line.trim()).await {
            break;
        }
    }

    chat.logout().await;
    printer.abort();
    Ok(())
}

/// Returns false when the user asked to quit.
async fn handle_line(chat: &ChatService, line: &str) -> bool {
    let result = match line.split_once(' ').unwrap_or((line, "")) {
        ("", _) => Ok(()),
        ("/quit", _) => return false,
        ("/logout", _) => {
            chat.logout().await;
            println!("logged out");
            return false;
        }
        ("/global", _) => chat.switch_channel(ChatChannel::global()).await.map(|_| ()),
        ("/dm", peer) if !peer.trim().is_empty() => {
            chat.open_private_chat(peer.trim()).await.map(|_| ())
        }
        ("/file", url) if !url.trim().is_empty() => chat.send_file_reference(url.trim()).await,
        ("/who", _) => {
            println!("online: {}", chat.online_users().await.join(", "));
            Ok(())
        }
        (cmd, _) if cmd.starts_with('/') => {
            println!("{}", HELP);
            Ok(())
        }
        _ => chat.send_text(line).await,
    };
    if let Err(e) = result {
        println!("! {}", e);
    }
    true
}

async fn print_events(chat: Arc<ChatService>, mut events: mpsc::UnboundedReceiver<ChatEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ChatEvent::PresenceChanged { users } => println!("* online: {}", users.join(", ")),
            ChatEvent::Message { channel, message } => {
                println!("[{}] {}", channel, render(&message))
            }
            ChatEvent::History { channel, messages } => {
                println!("-- {} ({} messages) --", channel, messages.len());
                for message in &messages {
                    println!("[{}] {}", channel, render(message));
                }
            }
            ChatEvent::HistoryFetchFailed { channel, error } => {
                println!("! history for {} unavailable: {}", channel, error)
            }
            ChatEvent::KeyUnavailable { error } => {
                println!("! chat key unavailable ({}); logging out", error);
                chat.logout().await;
            }
            ChatEvent::FrameRejected { error } => log::warn!("Ignored frame: {}", error),
            ChatEvent::Reconnected { channel } => println!("* reconnected to {}", channel),
            ChatEvent::ConnectionLost { channel, error } => {
                println!("! connection to {} lost: {}; restart to log in again", channel, error)
            }
        }
    }
}

fn render(message: &ChatMessage) -> String {
    let time = message
        .timestamp
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string());
    let body = match &message.body {
        MessageBody::Text(text) => text.clone(),
        MessageBody::File(url) => format!("<file {}>", url),
        MessageBody::Undecryptable => "<unable to decrypt>".to_string(),
    };
    format!("{} {}: {}", time, message.sender, body)
}

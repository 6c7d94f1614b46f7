use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, load_settings_from, ChatMessage, Identity, MessagingSession, SessionEvent,
};
use shared::domain::{ConversationId, MessageId, MessageStatus, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// REST base, e.g. https://fleet.example.com/api
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, env = "DRIVER_TOKEN")]
    token: String,
    #[arg(long)]
    user_id: String,
    /// Send over REST only.
    #[arg(long)]
    no_realtime: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    List {
        #[arg(long)]
        search: Option<String>,
    },
    Start {
        participant_id: String,
    },
    Chat {
        conversation_id: String,
    },
}

fn parse_id<T: From<i64> + From<String>>(raw: &str) -> T {
    match raw.parse::<i64>() {
        Ok(value) => T::from(value),
        Err(_) => T::from(raw.to_string()),
    }
}

fn format_message(message: &ChatMessage) -> String {
    let who = if message.is_from_me {
        "me".to_string()
    } else {
        message.sender_id.to_string()
    };
    let at = message
        .sent_at
        .map(|at| at.format("%H:%M").to_string())
        .unwrap_or_default();
    format!("[{at}] {who}: {} ({:?})", message.content, message.status)
}

/// Lines for messages not shown yet and for status changes on shown ones.
/// Messages dropped from the list are forgotten.
fn render_changes(
    shown: &mut HashMap<MessageId, MessageStatus>,
    messages: &[ChatMessage],
) -> Vec<String> {
    let mut lines = Vec::new();
    for message in messages {
        match shown.insert(message.id.clone(), message.status) {
            None => lines.push(format_message(message)),
            Some(previous) if previous != message.status => {
                lines.push(format!("  {} is now {:?}", message.id, message.status));
            }
            Some(_) => {}
        }
    }
    shown.retain(|id, _| messages.iter().any(|message| &message.id == id));
    lines
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => load_settings_from(path)?,
        None => load_settings(),
    };
    if let Some(api_url) = cli.api_url {
        settings.api_url = api_url;
    }
    if cli.no_realtime {
        settings.realtime_enabled = false;
    }

    let session = MessagingSession::from_settings(settings)?;
    session
        .sign_in(Identity {
            user_id: parse_id(&cli.user_id),
            access_token: cli.token,
        })
        .await;

    match cli.command {
        Command::List { search } => {
            for conversation in session.refresh_conversations(search).await? {
                println!(
                    "{}\t{}\t{} unread\t{}",
                    conversation.id,
                    conversation.participant.name,
                    conversation.unread_count,
                    conversation.last_message.unwrap_or_default()
                );
            }
        }
        Command::Start { participant_id } => {
            let participant: UserId = parse_id(&participant_id);
            let created = session.start_conversation(&participant).await?;
            println!("created conversation {}", created.id);
        }
        Command::Chat { conversation_id } => {
            chat(&session, parse_id(&conversation_id)).await?;
        }
    }

    session.sign_out().await;
    Ok(())
}

async fn chat(session: &Arc<MessagingSession>, conversation_id: ConversationId) -> Result<()> {
    let mut events = session.subscribe();
    if let Err(err) = session.open_conversation(&conversation_id).await {
        warn!("{err:#}");
    }
    let mut shown = HashMap::new();
    for line in render_changes(&mut shown, &session.messages(&conversation_id).await) {
        println!("{line}");
    }

    let printer = {
        let session = Arc::clone(session);
        let conversation_id = conversation_id.clone();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "chat: missed session events");
                        continue;
                    }
                    Err(RecvError::Closed) => return,
                };
                match event {
                    SessionEvent::MessagesChanged { conversation_id: changed }
                        if changed == conversation_id =>
                    {
                        let messages = session.messages(&conversation_id).await;
                        for line in render_changes(&mut shown, &messages) {
                            println!("{line}");
                        }
                    }
                    SessionEvent::TypingChanged {
                        conversation_id: changed,
                        user_id,
                        is_typing: true,
                    } if changed == conversation_id => println!("... {user_id} is typing"),
                    SessionEvent::ConnectionChanged(status) => {
                        info!(state = ?status.state, error = ?status.last_error, "chat: connection changed");
                    }
                    SessionEvent::HistoryFailed { message, .. } => {
                        warn!("chat: history unavailable: {message}");
                    }
                    _ => {}
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if line.trim() == "/quit" {
            break;
        }
        session.input_changed(&conversation_id, &line).await;
        match session.send(&conversation_id, &line).await {
            Ok(route) => info!(?route, "chat: sent"),
            Err(err) => warn!("{err:#}"),
        }
        session.input_changed(&conversation_id, "").await;
    }

    session.close_conversation(&conversation_id).await;
    printer.abort();
    Ok(())
}

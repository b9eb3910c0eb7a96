use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    config::{load_settings, normalize_database_url},
    ChatClient, ClientEvent, HttpApi, OutgoingFile, WebSocketChannel,
};
use shared::domain::{Message, MessageId, MessageStatus, UserId};
use storage::Storage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    token: String,
    /// Our own user id.
    #[arg(long)]
    user: String,
    /// Who to chat with.
    #[arg(long)]
    peer: String,
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(database_url) = args.database_url {
        settings.database_url = database_url;
    }
    let database_url = normalize_database_url(&settings.database_url);

    let storage = Storage::new(&database_url).await?;
    let channel =
        WebSocketChannel::connect(&settings.server_url, &args.token, settings.ack_timeout).await?;
    let api = Arc::new(HttpApi::new(settings.server_url.clone(), args.token.clone()));

    let client = ChatClient::new(
        settings,
        UserId::new(args.user),
        Arc::new(channel),
        api.clone(),
        api,
        Arc::new(storage),
    );
    let inbound = client.start();
    spawn_printer(&client);
    client.open_conversation(UserId::new(args.peer)).await;

    println!("commands: /edit <id> <text>, /unsend <id>, /react <id> <emoji>, /retry <id>, /file <path>, /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match run_command(&client, line.trim()).await {
            Ok(true) => break,
            Ok(false) => {}
            Err(err) => warn!(%err, "command failed"),
        }
    }

    client.set_typing(false, None).await;
    inbound.abort();
    Ok(())
}

/// Returns `true` when the user asked to quit.
async fn run_command(client: &Arc<ChatClient>, line: &str) -> Result<bool> {
    if line.is_empty() {
        return Ok(false);
    }
    let Some(command) = line.strip_prefix('/') else {
        client.send_text(line, None).await?;
        return Ok(false);
    };

    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    match name {
        "quit" => return Ok(true),
        "edit" => {
            let (id, text) = rest.split_once(' ').context("usage: /edit <id> <text>")?;
            client.edit_message(&MessageId::from(id), text).await?;
        }
        "unsend" => client.unsend(&MessageId::from(rest.trim())).await?,
        "react" => {
            let (id, emoji) = rest.split_once(' ').context("usage: /react <id> <emoji>")?;
            client.toggle_reaction(&MessageId::from(id), emoji.trim()).await?;
        }
        "retry" => {
            client.retry(&MessageId::from(rest.trim())).await?;
        }
        "file" => {
            let file = OutgoingFile::read(&PathBuf::from(rest.trim())).await?;
            for result in client.send_attachments(vec![file]).await {
                result?;
            }
        }
        other => println!("unknown command /{other}"),
    }
    Ok(false)
}

fn spawn_printer(client: &Arc<ChatClient>) {
    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::MessagesChanged { peer, messages } => {
                    println!("--- {peer} ---");
                    for message in &messages {
                        println!("{}", render(message));
                    }
                }
                ClientEvent::Notice(text) => println!("! {text}"),
                ClientEvent::ScrollToLatest => {}
            }
        }
    });

    let mut presence = client.subscribe_presence();
    tokio::spawn(async move {
        while presence.changed().await.is_ok() {
            let snapshot = presence.borrow_and_update().clone();
            let Some(peer) = snapshot.peer else {
                continue;
            };
            if snapshot.recording {
                println!("{peer} is recording...");
            } else if let Some(draft) = snapshot.ghost_text {
                println!("{peer} is typing: {draft}");
            } else if snapshot.typing {
                println!("{peer} is typing...");
            }
        }
    });
}

fn render(message: &Message) -> String {
    let status = match message.status {
        MessageStatus::Sending => "…",
        MessageStatus::Sent => "✓",
        MessageStatus::Delivered => "✓✓",
        MessageStatus::Read => "read",
        MessageStatus::Failed => "failed",
    };
    let edited = if message.edited { " (edited)" } else { "" };
    let reactions: String = message.reactions.iter().map(|r| r.emoji.as_str()).collect();
    format!(
        "[{}] {}: {}{} {} {}",
        message.id, message.sender_id, message.content, edited, status, reactions
    )
}

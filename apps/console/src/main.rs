mod config;
mod render;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use backend::{BackendHandle, ExpoPushGateway, RealtimeSocket, RestBackend};
use chat_core::{tables, Attachment, ChatClient, ChatError, ChatSettings, ThreadState};
use clap::{Parser, Subcommand};
use config::{load_settings, BackendMode, Settings};
use serde_json::json;
use shared::domain::{ConversationId, MediaKind, UserId};
use storage::{FixedSession, LocalObjectStore, Storage};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const NOTIFICATION_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "chat-console", about = "Marketplace messaging from the terminal")]
struct Cli {
    #[arg(long, default_value = "chat.toml")]
    config: PathBuf,
    /// Session user in local mode.
    #[arg(long = "as")]
    as_user: Option<UserId>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Conversations of the session user, most recent first.
    Conversations,
    /// Opens (or creates) the conversation with another user.
    Open {
        #[arg(long = "with")]
        with: UserId,
    },
    Thread {
        conversation: ConversationId,
        #[arg(long, default_value_t = 0)]
        page: u64,
    },
    Send {
        conversation: ConversationId,
        #[arg(long, default_value = "")]
        text: String,
        #[arg(long, requires = "kind")]
        media: Option<String>,
        #[arg(long, requires = "media")]
        kind: Option<MediaKind>,
    },
    /// Prints new messages until Ctrl-C.
    Watch { conversation: ConversationId },
    /// Marks the counterpart's messages as read.
    Read { conversation: ConversationId },
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        push_token: Option<String>,
        #[arg(long, default_value = "console")]
        device_type: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = load_settings(&cli.config)?;
    let backend = connect(&settings, cli.as_user).await?;
    let client = ChatClient::new(
        backend.clone(),
        ChatSettings {
            media_bucket: settings.media_bucket.clone(),
            page_size: settings.page_size,
        },
    );

    match cli.command {
        Command::Conversations => {
            let summaries = client.conversations().await.map_err(alert)?;
            if summaries.is_empty() {
                println!("no conversations yet");
            }
            for summary in &summaries {
                println!("{}", render::conversation_line(summary));
            }
        }
        Command::Open { with } => {
            let conversation = client.open_conversation(with).await.map_err(alert)?;
            println!("{}", conversation.id);
        }
        Command::Thread { conversation, page } => {
            let me = client.current_user().await.ok();
            for message in client.load_page(conversation, page).await {
                println!("{}", render::message_line(&message, me));
            }
        }
        Command::Send {
            conversation,
            text,
            media,
            kind,
        } => {
            let attachment = match (media, kind) {
                (Some(uri), Some(kind)) => Some(Attachment::new(uri, kind)),
                (None, None) => None,
                _ => bail!("--media and --kind go together"),
            };
            let message = client
                .send(conversation, &text, attachment)
                .await
                .map_err(alert)?;
            println!("{}", message.id);
        }
        Command::Watch { conversation } => watch(&client, conversation).await?,
        Command::Read { conversation } => {
            let updated = client.mark_read(conversation).await.map_err(alert)?;
            println!("marked {updated} message(s) as read");
        }
        Command::Register {
            name,
            email,
            push_token,
            device_type,
        } => {
            let user_id = client.current_user().await.map_err(alert)?;
            backend
                .database
                .upsert(
                    tables::PROFILES,
                    json!({ "id": user_id, "full_name": name, "email": email }),
                    &["id"],
                )
                .await
                .context("failed to store profile")?;
            if let Some(push_token) = push_token {
                backend
                    .database
                    .upsert(
                        tables::PUSH_TOKENS,
                        json!({
                            "user_id": user_id,
                            "push_token": push_token,
                            "device_type": device_type,
                        }),
                        &["user_id", "push_token"],
                    )
                    .await
                    .context("failed to store push token")?;
            }
            println!("{user_id}");
        }
    }

    // Push alerts from `send` run on their own tasks; let them finish before the runtime drops.
    client.flush_notifications(NOTIFICATION_FLUSH_TIMEOUT).await;
    Ok(())
}

async fn watch(client: &ChatClient, conversation_id: ConversationId) -> Result<()> {
    let me = client.current_user().await.ok();
    // Subscribe before loading history so nothing slips between the two.
    let (live_tx, mut live_rx) = mpsc::unbounded_channel();
    let mut handle = client
        .watch(conversation_id, move |message| {
            let _ = live_tx.send(message);
        })
        .await
        .map_err(alert)?;

    let mut thread = ThreadState::new(conversation_id);
    client.load_older(&mut thread).await;
    for message in thread.messages() {
        println!("{}", render::message_line(message, me));
    }
    info!(%conversation_id, "watching conversation, Ctrl-C to stop");

    loop {
        tokio::select! {
            received = live_rx.recv() => {
                let Some(message) = received else {
                    warn!(%conversation_id, "live feed ended");
                    break;
                };
                let line = render::message_line(&message, me);
                if thread.apply(message) {
                    println!("{line}");
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                break;
            }
        }
    }

    thread.close();
    handle.unsubscribe();
    Ok(())
}

async fn connect(settings: &Settings, as_user: Option<UserId>) -> Result<BackendHandle> {
    match settings.backend {
        BackendMode::Local => {
            let database_url = storage::database_url_from(&settings.database_url);
            let storage = Storage::new(&database_url)
                .await
                .with_context(|| format!("failed to open local database '{database_url}'"))?;
            if let Err(err) = storage.enforce_unique_conversation_pairs().await {
                warn!(error = %err, "duplicate conversations present, pair index not installed");
            }
            let session = match as_user {
                Some(user_id) => FixedSession::signed_in(user_id),
                None => FixedSession::signed_out(),
            };
            let handle =
                storage.backend_handle(LocalObjectStore::file_urls(&settings.media_dir), session);
            Ok(match &settings.push_url {
                Some(url) => handle.with_push_gateway(Arc::new(ExpoPushGateway::new(url.clone()))),
                None => handle,
            })
        }
        BackendMode::Hosted => {
            if as_user.is_some() {
                warn!("--as is ignored by the hosted backend, the access token decides the user");
            }
            let Some(base_url) = settings.backend_url.as_deref() else {
                bail!("hosted backend needs backend_url (CHAT_BACKEND_URL)");
            };
            let Some(anon_key) = settings.anon_key.as_deref() else {
                bail!("hosted backend needs anon_key (CHAT_ANON_KEY)");
            };

            let mut rest = RestBackend::new(base_url, anon_key)?;
            let mut socket = RealtimeSocket::new(base_url, anon_key)?;
            if let Some(token) = &settings.access_token {
                rest = rest.with_access_token(token.clone());
                socket = socket.with_access_token(token.clone());
            }
            let push = match &settings.push_url {
                Some(url) => ExpoPushGateway::new(url.clone()),
                None => ExpoPushGateway::default(),
            };
            let rest = Arc::new(rest);
            Ok(BackendHandle::new(rest.clone(), rest.clone(), Arc::new(socket), rest)
                .with_push_gateway(Arc::new(push)))
        }
    }
}

fn alert(err: ChatError) -> anyhow::Error {
    eprintln!("{}", err.alert_text());
    anyhow::Error::new(err)
}

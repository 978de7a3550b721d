mod repl;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use mindscribe_client::HttpRagClient;
use mindscribe_core::{
    resolve_app_paths, AppConfig, ChatOrchestrator, ConversationStore, CredentialCache, EventBus,
    HttpConversationBackend, HttpSessionProvider, SessionStore,
};
use mindscribe_observability::init_logging;

#[derive(Parser, Debug)]
#[command(name = "mindscribe")]
#[command(about = "MindScribe wellness companion client")]
struct Cli {
    /// Chat endpoint base URL
    #[arg(long)]
    chat_url: Option<String>,
    /// Conversation store / auth base URL
    #[arg(long)]
    store_url: Option<String>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive chat session (the default)
    Chat,
    /// List saved conversations, most recently updated first
    Conversations,
    /// Delete a saved conversation
    Delete { id: String },
}

struct App {
    provider: Arc<HttpSessionProvider>,
    sessions: Arc<SessionStore>,
    store: ConversationStore,
    orchestrator: Arc<ChatOrchestrator>,
}

fn build_app(config: AppConfig, credentials: CredentialCache) -> App {
    let rag = Arc::new(HttpRagClient::new(config.chat.base_url.clone()));
    let backend = Arc::new(HttpConversationBackend::new(config.store.base_url.clone()));
    let provider = Arc::new(HttpSessionProvider::new(config.auth.base_url.clone()));

    let sessions = Arc::new(SessionStore::new(
        provider.clone(),
        credentials,
        config.sign_out_timeout(),
    ));
    let store = ConversationStore::new(
        backend,
        rag.clone(),
        config.store_timeouts(),
        config.title_timeout(),
    );
    let orchestrator = Arc::new(ChatOrchestrator::new(
        rag,
        EventBus::new(),
        config.chat_timeout(),
    ));

    App {
        provider,
        sessions,
        store,
        orchestrator,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = resolve_app_paths().context("resolving application directories")?;
    let mut config = AppConfig::load(&paths.config_path);
    config.apply_cli_overrides(cli.chat_url, cli.store_url);

    let (_log_guard, log_info) = init_logging(&paths.logs_dir, config.log_retention_days)
        .context("initializing logging")?;
    info!(logs_dir = %log_info.logs_dir, "mindscribe starting");

    let app = build_app(config, CredentialCache::new(&paths.credentials_path));

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => repl::run(app).await,
        Command::Conversations => list_conversations(app).await,
        Command::Delete { id } => delete_conversation(app, &id).await,
    }
}

async fn list_conversations(app: App) -> anyhow::Result<()> {
    let Some(session) = app.sessions.bootstrap().await else {
        anyhow::bail!("not signed in; run `mindscribe chat` and use /signin first");
    };
    let conversations = app.store.reload(&session.access_token).await?;
    if conversations.is_empty() {
        println!("No saved conversations.");
        return Ok(());
    }
    for conversation in conversations {
        println!(
            "{}  {}  {}",
            conversation.id,
            conversation.updated_at.format("%Y-%m-%d %H:%M"),
            conversation.title
        );
    }
    Ok(())
}

async fn delete_conversation(app: App, id: &str) -> anyhow::Result<()> {
    let Some(session) = app.sessions.bootstrap().await else {
        anyhow::bail!("not signed in; run `mindscribe chat` and use /signin first");
    };
    app.store.reload(&session.access_token).await?;
    repl::delete_and_reset(&app.store, &app.orchestrator, &session.access_token, id).await;
    println!("Deleted {id}.");
    Ok(())
}

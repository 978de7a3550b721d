use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use mindscribe_client::SOURCES_SENTINEL;
use mindscribe_core::{
    ChatEvent, ChatOrchestrator, ConversationStore, ANONYMOUS_WELCOME, SIGNED_IN_WELCOME,
    SIGN_OUT_GOODBYE,
};
use mindscribe_observability::redact_text;
use mindscribe_types::MessageRole;

use crate::App;

pub async fn run(app: App) -> anyhow::Result<()> {
    let session = app.sessions.bootstrap().await;

    // Keep following sign-in/sign-out notifications for the process lifetime.
    let event_follower = {
        let sessions = app.sessions.clone();
        tokio::spawn(async move { sessions.run_events().await })
    };
    spawn_renderer(&app);

    match &session {
        Some(session) => {
            app.orchestrator
                .set_user(Some(session.user.id.clone()))
                .await;
            match app.store.reload(&session.access_token).await {
                Ok(_) => {
                    if let Some(latest) = app.store.activate_latest().await {
                        app.orchestrator.set_history(latest.messages).await;
                        println!("(resumed \"{}\")", latest.title);
                    } else {
                        app.orchestrator.push_notice(SIGNED_IN_WELCOME).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "could not load conversations");
                    app.orchestrator.push_notice(SIGNED_IN_WELCOME).await;
                }
            }
            println!("Welcome back, {}.", session.user.preferred_name());
        }
        None => {
            app.orchestrator.push_notice(ANONYMOUS_WELCOME).await;
            println!("{ANONYMOUS_WELCOME}");
        }
    }
    println!("Commands: /save /new /list /delete <id> /signin <email> <password> /signout /quit");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        print!("you> ");
        std::io::stdout().flush().ok();
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if let Some(command) = line.strip_prefix('/') {
            if !handle_command(&app, command).await? {
                break;
            }
            continue;
        }

        tracing::info!(message = %redact_text(&line), "sending chat turn");
        app.orchestrator.send_message(&line).await;
        print_sources(&app).await;
    }

    event_follower.abort();
    Ok(())
}

async fn handle_command(app: &App, command: &str) -> anyhow::Result<bool> {
    let mut parts = command.split_whitespace();
    match parts.next().unwrap_or_default() {
        "quit" | "exit" => return Ok(false),
        "new" => {
            app.store.set_active(None).await;
            app.orchestrator.start_new_conversation().await;
            println!("Started a new conversation.");
        }
        "save" => {
            let token = app.sessions.access_token().await;
            let outcome =
                save_working_copy(&app.store, &app.orchestrator, token.as_deref()).await;
            println!("{outcome}");
        }
        "list" => match app.sessions.access_token().await {
            Some(token) => match app.store.reload(&token).await {
                Ok(conversations) => {
                    for conversation in conversations {
                        println!(
                            "{}  {}  {}",
                            conversation.id,
                            conversation.updated_at.format("%Y-%m-%d %H:%M"),
                            conversation.title
                        );
                    }
                }
                Err(err) => println!("Could not list conversations: {err}"),
            },
            None => println!("Sign in first to list conversations."),
        },
        "delete" => match (app.sessions.access_token().await, parts.next()) {
            (Some(token), Some(id)) => {
                delete_and_reset(&app.store, &app.orchestrator, &token, id).await;
                println!("Deleted {id}.");
            }
            (None, _) => println!("Sign in first."),
            (_, None) => println!("Usage: /delete <conversation-id>"),
        },
        "signin" => match (parts.next(), parts.next()) {
            (Some(email), Some(password)) => match app.provider.sign_in(email, password).await {
                Ok(session) => {
                    app.orchestrator
                        .set_user(Some(session.user.id.clone()))
                        .await;
                    println!("Signed in as {}.", session.user.email);
                    if app.store.reload(&session.access_token).await.is_ok() {
                        if let Some(latest) = app.store.activate_latest().await {
                            app.orchestrator.set_history(latest.messages).await;
                            println!("(resumed \"{}\")", latest.title);
                        }
                    }
                }
                Err(err) => println!("Sign-in failed: {err}"),
            },
            _ => println!("Usage: /signin <email> <password>"),
        },
        "signout" => {
            app.sessions.sign_out().await;
            app.store.clear().await;
            app.orchestrator.set_user(None).await;
            app.orchestrator.set_history(Vec::new()).await;
            app.orchestrator.push_notice(SIGN_OUT_GOODBYE).await;
            println!("{SIGN_OUT_GOODBYE}");
        }
        other => println!("Unknown command: /{other}"),
    }
    Ok(true)
}

/// Save the working history, returning the line to show the user. An empty
/// working copy is a quiet no-op, not a failure.
async fn save_working_copy(
    store: &ConversationStore,
    orchestrator: &ChatOrchestrator,
    token: Option<&str>,
) -> String {
    let history = orchestrator.history().await;
    if history.is_empty() {
        return "Nothing to save yet.".to_string();
    }
    let Some(token) = token else {
        return "Sign in first to save conversations.".to_string();
    };
    match store.save(token, history).await {
        Ok(id) => format!("Saved as {id}."),
        // Explicit saves surface their failures.
        Err(err) => format!("Save failed: {err}"),
    }
}

/// Delete a conversation; if it was the active one, the deleted transcript
/// must not survive as the working copy, so start a fresh conversation.
pub(crate) async fn delete_and_reset(
    store: &ConversationStore,
    orchestrator: &ChatOrchestrator,
    token: &str,
    id: &str,
) {
    let was_active = store.delete(token, id).await;
    if was_active {
        orchestrator.start_new_conversation().await;
    }
}

/// Incremental stdout writer for assistant text. A tail the length of the
/// sentinel is held back so a partially received sentinel never flashes on
/// screen. Streamed text is untrimmed until the decoder settles while the
/// settled prose is trimmed, so offsets are tracked against the start-trimmed
/// form to keep them stable across that transition.
struct StreamPrinter {
    holdback: usize,
    printed: usize,
    last_text: String,
}

impl StreamPrinter {
    fn new() -> Self {
        Self {
            holdback: SOURCES_SENTINEL.chars().count(),
            printed: 0,
            last_text: String::new(),
        }
    }

    fn reset(&mut self) {
        self.printed = 0;
        self.last_text.clear();
    }

    fn on_delta(&mut self, text: &str, settled: bool) -> String {
        let text = text.trim_start();
        let total = text.chars().count();
        let visible = if settled {
            total
        } else {
            total.saturating_sub(self.holdback)
        };
        let out = if visible > self.printed {
            text.chars()
                .skip(self.printed)
                .take(visible - self.printed)
                .collect()
        } else {
            String::new()
        };
        self.printed = self.printed.max(visible);
        self.last_text = text.to_string();
        out
    }

    /// Remainder of the final text beyond what streaming already emitted.
    fn on_finalized(&mut self) -> String {
        let total = self.last_text.chars().count();
        if total > self.printed {
            self.last_text.chars().skip(self.printed).collect()
        } else {
            String::new()
        }
    }
}

fn spawn_renderer(app: &App) {
    let mut events = app.orchestrator.events().subscribe();
    tokio::spawn(async move {
        let mut printer = StreamPrinter::new();
        loop {
            match events.recv().await {
                Ok(ChatEvent::Typing { .. }) => printer.reset(),
                Ok(ChatEvent::AssistantDelta {
                    text, citations, ..
                }) => {
                    let out = printer.on_delta(&text, !citations.is_empty());
                    if !out.is_empty() {
                        print!("{out}");
                        std::io::stdout().flush().ok();
                    }
                }
                Ok(ChatEvent::TurnFinalized { .. }) => {
                    let out = printer.on_finalized();
                    if !out.is_empty() {
                        print!("{out}");
                    }
                    println!();
                }
                Ok(ChatEvent::TurnFailed { apology, .. }) => {
                    println!("{apology}");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "renderer missed events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn print_sources(app: &App) {
    let history = app.orchestrator.history().await;
    let Some(last) = history
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Assistant)
    else {
        return;
    };
    if last.citations.is_empty() {
        return;
    }
    let sources: Vec<&str> = last.citations.iter().map(|c| c.source.as_str()).collect();
    println!("  sources: {}", sources.join(", "));
}

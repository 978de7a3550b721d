use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use mindscribe_client::{ChatError, RagClient};
use mindscribe_types::{Citation, Message};

use crate::event_bus::{ChatEvent, EventBus};

pub const TIMEOUT_APOLOGY: &str =
    "Sorry, that took longer than expected. Please try again, maybe with a shorter message.";
pub const CONNECT_APOLOGY: &str =
    "Sorry, I'm having trouble connecting right now. Please try again later.";
pub const GENERIC_APOLOGY: &str =
    "Sorry, something went wrong on my end. Please try again.";

pub const ANONYMOUS_WELCOME: &str = "Hello! I'm your AI companion here to listen and support you. \
     To save your conversations and access them later, please sign in or create an account.";
pub const SIGNED_IN_WELCOME: &str = "Welcome back! I'm here to listen and support you. \
     Feel free to share what's on your mind today.";
pub const SIGN_OUT_GOODBYE: &str = "You've been signed out. Take care!";
pub const NEW_CONVERSATION_PROMPT: &str = "New chat started. What's on your mind?";

/// One outgoing message moves Composing -> Sent -> Streaming -> Finalized,
/// with Errored absorbing from Sent or Streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Composing,
    Sent,
    Streaming,
    Finalized,
    Errored,
}

/// Drives chat turns against the RAG endpoint and owns the working history.
///
/// The working history is a local copy; nothing here persists it. Saving is a
/// separate, explicit action through the conversation store.
pub struct ChatOrchestrator {
    rag: Arc<dyn RagClient>,
    events: EventBus,
    history: RwLock<Vec<Message>>,
    user_id: RwLock<Option<String>>,
    turn_timeout: Duration,
}

impl ChatOrchestrator {
    pub fn new(rag: Arc<dyn RagClient>, events: EventBus, turn_timeout: Duration) -> Self {
        Self {
            rag,
            events,
            history: RwLock::new(Vec::new()),
            user_id: RwLock::new(None),
            turn_timeout,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn history(&self) -> Vec<Message> {
        self.history.read().await.clone()
    }

    /// Replace the working history, e.g. with a loaded conversation.
    pub async fn set_history(&self, messages: Vec<Message>) {
        *self.history.write().await = messages;
    }

    pub async fn set_user(&self, user_id: Option<String>) {
        *self.user_id.write().await = user_id;
    }

    /// Append a synthetic assistant message (welcome text, goodbye, ...).
    pub async fn push_notice(&self, text: &str) {
        self.history.write().await.push(Message::assistant(text));
    }

    /// Drop the working copy and start over with the new-chat prompt.
    pub async fn start_new_conversation(&self) {
        let mut history = self.history.write().await;
        history.clear();
        history.push(Message::assistant(NEW_CONVERSATION_PROMPT));
    }

    /// Run one chat turn to completion. Always returns a terminal state; an
    /// error turn ends with the placeholder overwritten by an apology, never
    /// with a propagated error.
    pub async fn send_message(&self, text: &str) -> TurnState {
        let text = text.trim().to_string();
        if text.is_empty() {
            return TurnState::Composing;
        }

        let placeholder_id = {
            let mut history = self.history.write().await;
            history.push(Message::user(&text));
            let placeholder = Message::assistant("");
            let id = placeholder.id.clone();
            history.push(placeholder);
            id
        };
        self.events.publish(ChatEvent::Typing {
            message_id: placeholder_id.clone(),
        });

        // Request-scoped cancellation tied to a wall-clock deadline.
        let cancel = CancellationToken::new();
        let timer = {
            let cancel = cancel.clone();
            let limit = self.turn_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                cancel.cancel();
            })
        };

        let outcome = self.run_turn(&text, &placeholder_id, cancel).await;
        timer.abort();

        match outcome {
            Ok(()) => {
                self.events.publish(ChatEvent::TurnFinalized {
                    message_id: placeholder_id,
                });
                TurnState::Finalized
            }
            Err(err) => {
                let apology = apology_for(&err);
                tracing::warn!(error = %err, "chat turn failed");
                self.overwrite_message(&placeholder_id, apology, Vec::new())
                    .await;
                self.events.publish(ChatEvent::TurnFailed {
                    message_id: placeholder_id,
                    apology: apology.to_string(),
                });
                TurnState::Errored
            }
        }
    }

    async fn run_turn(
        &self,
        text: &str,
        placeholder_id: &str,
        cancel: CancellationToken,
    ) -> Result<(), ChatError> {
        let user_id = self.user_id.read().await.clone();

        // Sent: headers accepted and a body stream is available, or error.
        let mut stream = self
            .rag
            .stream_chat(text, user_id.as_deref(), cancel)
            .await?;

        // Streaming: snapshots applied in arrival order.
        while let Some(snapshot) = stream.next().await {
            let snapshot = snapshot?;
            self.overwrite_message(placeholder_id, &snapshot.text, snapshot.citations.clone())
                .await;
            self.events.publish(ChatEvent::AssistantDelta {
                message_id: placeholder_id.to_string(),
                text: snapshot.text,
                citations: snapshot.citations,
            });
        }

        Ok(())
    }

    async fn overwrite_message(&self, id: &str, text: &str, citations: Vec<Citation>) {
        let mut history = self.history.write().await;
        if let Some(message) = history.iter_mut().find(|m| m.id == id) {
            message.text = text.to_string();
            message.citations = citations;
        }
    }
}

fn apology_for(err: &ChatError) -> &'static str {
    if err.is_deadline() {
        return TIMEOUT_APOLOGY;
    }
    match err {
        ChatError::Connect(_) => CONNECT_APOLOGY,
        _ => GENERIC_APOLOGY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use mindscribe_client::{snapshots, SnapshotStream, SOURCES_SENTINEL};
    use mindscribe_types::MessageRole;

    enum Script {
        Chunks(Vec<Vec<u8>>),
        FailSend(fn() -> ChatError),
        HangUntilCancelled,
    }

    struct ScriptedRag {
        script: Script,
    }

    #[async_trait]
    impl RagClient for ScriptedRag {
        async fn stream_chat(
            &self,
            _message: &str,
            _user_id: Option<&str>,
            cancel: CancellationToken,
        ) -> Result<SnapshotStream, ChatError> {
            match &self.script {
                Script::Chunks(chunks) => {
                    let items: Vec<Result<Vec<u8>, ChatError>> =
                        chunks.iter().cloned().map(Ok).collect();
                    Ok(Box::pin(snapshots(futures::stream::iter(items))))
                }
                Script::FailSend(make_err) => Err(make_err()),
                Script::HangUntilCancelled => {
                    cancel.cancelled().await;
                    Err(ChatError::Cancelled)
                }
            }
        }
    }

    fn orchestrator(script: Script, turn_timeout: Duration) -> ChatOrchestrator {
        ChatOrchestrator::new(
            Arc::new(ScriptedRag { script }),
            EventBus::new(),
            turn_timeout,
        )
    }

    #[tokio::test]
    async fn successful_turn_finalizes_placeholder_with_text_and_citations() {
        let body = format!(
            "Try a short breathing exercise.{}[{{\"source\":\"breathing.md\"}}]",
            SOURCES_SENTINEL
        );
        let orch = orchestrator(
            Script::Chunks(vec![body.into_bytes()]),
            Duration::from_secs(5),
        );

        let state = orch.send_message("I feel anxious").await;
        assert_eq!(state, TurnState::Finalized);

        let history = orch.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageRole::User);
        let reply = &history[1];
        assert_eq!(reply.role, MessageRole::Assistant);
        assert_eq!(reply.text, "Try a short breathing exercise.");
        assert_eq!(reply.citations.len(), 1);
        assert_eq!(reply.citations[0].source, "breathing.md");
    }

    #[tokio::test]
    async fn blank_input_is_not_sent() {
        let orch = orchestrator(Script::Chunks(vec![]), Duration::from_secs(5));
        let state = orch.send_message("   \n").await;
        assert_eq!(state, TurnState::Composing);
        assert!(orch.history().await.is_empty());
    }

    #[tokio::test]
    async fn timeout_yields_the_timeout_apology() {
        let orch = orchestrator(Script::HangUntilCancelled, Duration::from_millis(20));

        let state = orch.send_message("hello?").await;
        assert_eq!(state, TurnState::Errored);

        let history = orch.history().await;
        assert_eq!(history[1].text, TIMEOUT_APOLOGY);
    }

    #[tokio::test]
    async fn connectivity_failure_yields_a_distinct_apology() {
        let orch = orchestrator(
            Script::FailSend(|| ChatError::Connect("refused".to_string())),
            Duration::from_secs(5),
        );

        let state = orch.send_message("hello?").await;
        assert_eq!(state, TurnState::Errored);

        let history = orch.history().await;
        assert_eq!(history[1].text, CONNECT_APOLOGY);
        assert_ne!(CONNECT_APOLOGY, TIMEOUT_APOLOGY);
    }

    #[tokio::test]
    async fn non_2xx_status_yields_the_generic_apology() {
        let orch = orchestrator(
            Script::FailSend(|| ChatError::Status(500)),
            Duration::from_secs(5),
        );

        orch.send_message("hello?").await;
        assert_eq!(orch.history().await[1].text, GENERIC_APOLOGY);
    }

    #[tokio::test]
    async fn error_turn_keeps_both_messages_in_history() {
        // Consecutive assistant messages are allowed; an error message can
        // follow the user message directly.
        let orch = orchestrator(
            Script::FailSend(|| ChatError::Status(503)),
            Duration::from_secs(5),
        );
        orch.send_message("first").await;
        orch.send_message("second").await;

        let history = orch.history().await;
        assert_eq!(history.len(), 4);
        assert!(history[1].citations.is_empty());
    }

    #[tokio::test]
    async fn deltas_are_published_in_arrival_order() {
        let orch = orchestrator(
            Script::Chunks(vec![b"one ".to_vec(), b"two ".to_vec(), b"three".to_vec()]),
            Duration::from_secs(5),
        );
        let mut events = orch.events().subscribe();

        orch.send_message("count for me").await;

        let mut texts = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ChatEvent::AssistantDelta { text, .. } = event {
                texts.push(text);
            }
        }
        // Each snapshot extends the previous one; the last is the full reply.
        assert!(texts.windows(2).all(|pair| pair[1].starts_with(pair[0].trim_end())));
        assert_eq!(texts.last().map(String::as_str), Some("one two three"));
        assert_eq!(texts.first().map(String::as_str), Some("one "));
    }

    #[tokio::test]
    async fn new_conversation_resets_history_with_prompt() {
        let orch = orchestrator(Script::Chunks(vec![b"ok".to_vec()]), Duration::from_secs(5));
        orch.send_message("something").await;
        orch.start_new_conversation().await;

        let history = orch.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text, NEW_CONVERSATION_PROMPT);
    }
}

use tokio::sync::broadcast;

use mindscribe_types::Citation;

/// Turn lifecycle notifications for whoever renders the conversation.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// Placeholder appended, nothing streamed yet.
    Typing { message_id: String },
    /// Incremental snapshot applied to the placeholder, in arrival order.
    AssistantDelta {
        message_id: String,
        text: String,
        citations: Vec<Citation>,
    },
    /// Stream exhausted; the message text and citations are now immutable.
    TurnFinalized { message_id: String },
    /// Placeholder overwritten with an apology.
    TurnFailed { message_id: String, apology: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChatEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ChatEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

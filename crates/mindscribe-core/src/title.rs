use std::time::Duration;

use mindscribe_client::{RagClient, SOURCES_SENTINEL};
use mindscribe_types::{Message, MessageRole};

pub const GENERIC_TITLE: &str = "General Chat";

const MAX_TITLE_CHARS: usize = 35;

// Longest first so "good morning" is not half-matched by a shorter word.
const GREETINGS: [&str; 10] = [
    "good afternoon",
    "good morning",
    "good evening",
    "greetings",
    "hello",
    "howdy",
    "hiya",
    "hey",
    "yo",
    "hi",
];

const FILLER_QUESTIONS: [&str; 6] = [
    "how are you",
    "what's up",
    "whats up",
    "can you help",
    "are you there",
    "anyone there",
];

/// Derive a conversation title. Total: every failure path lands on the
/// heuristic, and the heuristic always produces something in bounds.
pub async fn synthesize_title(
    client: &dyn RagClient,
    history: &[Message],
    deadline: Duration,
) -> String {
    // Fewer than two exchanges is not enough context for a model call.
    if history.len() < 4 {
        return heuristic_title(history);
    }
    match model_title(client, history, deadline).await {
        Some(title) => title,
        None => heuristic_title(history),
    }
}

async fn model_title(
    client: &dyn RagClient,
    history: &[Message],
    deadline: Duration,
) -> Option<String> {
    let transcript = history
        .iter()
        .take(6)
        .map(|m| format!("{}: {}", role_label(m.role), m.text))
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = format!(
        "Suggest a concise 3-6 word title for this conversation. \
         Reply with the title only: no quotes, no prefix.\n\n{transcript}"
    );

    let reply = match client.complete(&prompt, deadline).await {
        Ok(reply) => reply,
        Err(err) => {
            tracing::debug!(error = %err, "title generation failed, using heuristic");
            return None;
        }
    };

    let title = clean_model_title(&reply);
    let len = title.chars().count();
    if len > 3 && len < 60 {
        Some(title)
    } else {
        tracing::debug!(len, "model title out of bounds, using heuristic");
        None
    }
}

pub fn heuristic_title(history: &[Message]) -> String {
    let mut user_messages = history
        .iter()
        .filter(|m| m.role == MessageRole::User)
        .map(|m| strip_greeting(m.text.trim()));

    let Some(first) = user_messages.next() else {
        return GENERIC_TITLE.to_string();
    };

    let candidate = if first.chars().count() < 10 || is_filler(&first) {
        user_messages.find(|text| text.chars().count() > 15)
    } else {
        Some(first)
    };

    match candidate {
        Some(text) => shape_title(&text),
        None => GENERIC_TITLE.to_string(),
    }
}

fn role_label(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

/// Remove one leading greeting word plus any punctuation that follows it.
fn strip_greeting(text: &str) -> String {
    for greeting in GREETINGS {
        // ASCII prefix compare keeps the slice below on a char boundary.
        if text.len() >= greeting.len()
            && text.as_bytes()[..greeting.len()].eq_ignore_ascii_case(greeting.as_bytes())
        {
            let rest = &text[greeting.len()..];
            // "hi there" strips, "history" must not.
            if !rest.chars().next().is_some_and(|c| c.is_alphanumeric()) {
                return rest.trim_start_matches([',', '.', '!', '?', ' ']).to_string();
            }
        }
    }
    text.to_string()
}

fn is_filler(text: &str) -> bool {
    let lower = text.to_lowercase();
    FILLER_QUESTIONS
        .iter()
        .any(|pattern| lower.starts_with(pattern))
}

fn shape_title(text: &str) -> String {
    let mut title: String = text.chars().take(MAX_TITLE_CHARS).collect();
    if text.chars().count() > MAX_TITLE_CHARS {
        title = format!("{}…", title.trim_end());
    }
    let mut chars = title.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => title,
    }
}

fn clean_model_title(raw: &str) -> String {
    // A title reply can still carry a citation tail; drop it first.
    let head = raw.split(SOURCES_SENTINEL).next().unwrap_or(raw);
    let mut title = head.replace('\n', " ");
    title = title
        .trim_matches(['"', '\'', '“', '”', ' '])
        .to_string();
    for prefix in ["title:", "chat:", "conversation:"] {
        if title.len() >= prefix.len()
            && title.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
        {
            title = title[prefix.len()..].to_string();
            break;
        }
    }
    title
        .trim_matches(['"', '\'', '“', '”', ' '])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mindscribe_client::{ChatError, SnapshotStream};
    use tokio_util::sync::CancellationToken;

    struct CannedTitleClient {
        reply: Result<String, ()>,
    }

    #[async_trait]
    impl RagClient for CannedTitleClient {
        async fn stream_chat(
            &self,
            _message: &str,
            _user_id: Option<&str>,
            _cancel: CancellationToken,
        ) -> Result<SnapshotStream, ChatError> {
            unimplemented!("tests use complete()")
        }

        async fn complete(&self, _message: &str, _deadline: Duration) -> Result<String, ChatError> {
            self.reply
                .clone()
                .map_err(|_| ChatError::Connect("refused".to_string()))
        }
    }

    fn exchange(user: &str, assistant: &str) -> Vec<Message> {
        vec![Message::user(user), Message::assistant(assistant)]
    }

    fn four_message_history() -> Vec<Message> {
        let mut history = exchange("hi", "hello");
        history.extend(exchange("I'm stressed about exams and sleep", "..."));
        history
    }

    #[test]
    fn greeting_is_stripped_and_search_moves_to_substantive_message() {
        let title = heuristic_title(&four_message_history());
        assert_eq!(title, "I'm stressed about exams and sleep");
    }

    #[test]
    fn empty_history_gets_the_generic_title() {
        assert_eq!(heuristic_title(&[]), GENERIC_TITLE);
    }

    #[test]
    fn filler_opening_with_no_follow_up_gets_the_generic_title() {
        let history = exchange("hey, how are you?", "doing well!");
        assert_eq!(heuristic_title(&history), GENERIC_TITLE);
    }

    #[test]
    fn long_first_message_is_truncated_with_ellipsis_and_capitalized() {
        let history = exchange(
            "lately i cannot stop worrying about everything at work and home",
            "tell me more",
        );
        let title = heuristic_title(&history);
        assert!(title.ends_with('…'));
        assert!(title.starts_with('L'));
        assert!(title.chars().count() <= MAX_TITLE_CHARS + 1);
    }

    #[test]
    fn greeting_prefix_of_a_real_word_is_left_alone() {
        let history = exchange("history of my anxiety goes back years", "go on");
        assert!(heuristic_title(&history).starts_with("History"));
    }

    #[tokio::test]
    async fn model_title_is_preferred_when_valid() {
        let client = CannedTitleClient {
            reply: Ok("Title: \"Exam Stress And Sleep\"".to_string()),
        };
        let title = synthesize_title(&client, &four_message_history(), Duration::from_secs(1)).await;
        assert_eq!(title, "Exam Stress And Sleep");
    }

    #[tokio::test]
    async fn out_of_bounds_model_title_falls_back_to_heuristic() {
        let client = CannedTitleClient {
            reply: Ok("ok".to_string()),
        };
        let title = synthesize_title(&client, &four_message_history(), Duration::from_secs(1)).await;
        assert_eq!(title, "I'm stressed about exams and sleep");
    }

    #[tokio::test]
    async fn model_error_falls_back_to_heuristic() {
        let client = CannedTitleClient { reply: Err(()) };
        let title = synthesize_title(&client, &four_message_history(), Duration::from_secs(1)).await;
        assert_eq!(title, "I'm stressed about exams and sleep");
    }

    #[tokio::test]
    async fn short_history_never_calls_the_model() {
        // stream_chat/complete would panic if touched.
        struct Untouchable;
        #[async_trait]
        impl RagClient for Untouchable {
            async fn stream_chat(
                &self,
                _message: &str,
                _user_id: Option<&str>,
                _cancel: CancellationToken,
            ) -> Result<SnapshotStream, ChatError> {
                panic!("model must not be called for short histories")
            }
        }
        let history = exchange("hi", "hello");
        let title = synthesize_title(&Untouchable, &history, Duration::from_secs(1)).await;
        assert_eq!(title, GENERIC_TITLE);
    }

    #[test]
    fn model_title_with_citation_tail_is_cleaned() {
        let raw = format!("Managing Worry{}[{{\"source\":\"x\"}}]", SOURCES_SENTINEL);
        assert_eq!(clean_model_title(&raw), "Managing Worry");
    }
}

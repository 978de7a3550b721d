use std::pin::Pin;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::decode::{SentinelDecoder, StreamSnapshot};
use crate::error::ChatError;

pub type SnapshotStream = Pin<Box<dyn Stream<Item = Result<StreamSnapshot, ChatError>> + Send>>;

/// The RAG backend as seen from this client: one streaming chat call, plus a
/// buffered completion used for secondary calls such as title generation.
#[async_trait]
pub trait RagClient: Send + Sync {
    /// Send one user utterance and stream back decoded snapshots. The token
    /// aborts the in-flight request; the caller ties it to its deadline.
    async fn stream_chat(
        &self,
        message: &str,
        user_id: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<SnapshotStream, ChatError>;

    /// Accumulate a whole reply under a deadline. No incremental display, so
    /// only the final snapshot's text survives; any sentinel payload has
    /// already been stripped by the decoder.
    async fn complete(&self, message: &str, deadline: Duration) -> Result<String, ChatError> {
        let cancel = CancellationToken::new();
        let drive = async {
            let mut stream = self.stream_chat(message, None, cancel.clone()).await?;
            let mut last = StreamSnapshot::default();
            while let Some(snapshot) = stream.next().await {
                last = snapshot?;
            }
            Ok(last.text)
        };
        match tokio::time::timeout(deadline, drive).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(ChatError::Timeout)
            }
        }
    }
}

/// Streaming HTTP client for the `POST /chat` contract: JSON request in, raw
/// `text/plain` byte stream out, prose optionally terminated by the sentinel
/// and a citation payload.
#[derive(Clone)]
pub struct HttpRagClient {
    base_url: String,
    client: Client,
}

impl HttpRagClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl RagClient for HttpRagClient {
    async fn stream_chat(
        &self,
        message: &str,
        user_id: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<SnapshotStream, ChatError> {
        let url = format!("{}/chat", self.base_url);
        let body = json!({
            "message": message,
            "user_id": user_id,
        });

        let send = self.client.post(url).json(&body).send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            sent = send => sent.map_err(ChatError::from_send_error)?,
        };

        // Hard failure: the body of a non-2xx response is never decoded.
        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::Status(status.as_u16()));
        }

        let mut bytes = response.bytes_stream();
        let stream = try_stream! {
            let mut decoder = SentinelDecoder::new();
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    chunk = bytes.next() => Some(chunk),
                };
                let Some(next) = next else {
                    Err(ChatError::Cancelled)?;
                    break;
                };
                let Some(chunk) = next else {
                    yield decoder.finish();
                    break;
                };
                let chunk = chunk.map_err(|err| ChatError::Stream(err.to_string()))?;
                let snapshot = decoder.push(&chunk);
                let settled = decoder.is_settled();
                yield snapshot;
                if settled {
                    break;
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::SOURCES_SENTINEL;

    /// Replays canned chunks; errors after them if configured.
    struct ScriptedClient {
        chunks: Vec<Vec<u8>>,
        trailing_error: Option<fn() -> ChatError>,
    }

    #[async_trait]
    impl RagClient for ScriptedClient {
        async fn stream_chat(
            &self,
            _message: &str,
            _user_id: Option<&str>,
            _cancel: CancellationToken,
        ) -> Result<SnapshotStream, ChatError> {
            let mut items: Vec<Result<Vec<u8>, ChatError>> =
                self.chunks.iter().cloned().map(Ok).collect();
            if let Some(make_err) = self.trailing_error {
                items.push(Err(make_err()));
            }
            Ok(Box::pin(crate::decode::snapshots(futures::stream::iter(
                items,
            ))))
        }
    }

    #[tokio::test]
    async fn complete_accumulates_final_text_and_strips_sentinel_payload() {
        let client = ScriptedClient {
            chunks: vec![
                b"Short walks ".to_vec(),
                format!("help.{}[{{\"source\":\"habits.md\"}}]", SOURCES_SENTINEL).into_bytes(),
            ],
            trailing_error: None,
        };
        let text = client
            .complete("summarize", Duration::from_secs(5))
            .await
            .expect("complete");
        assert_eq!(text, "Short walks help.");
    }

    #[tokio::test]
    async fn complete_propagates_stream_errors() {
        let client = ScriptedClient {
            chunks: vec![b"partial".to_vec()],
            trailing_error: Some(|| ChatError::Stream("reset".to_string())),
        };
        let err = client
            .complete("summarize", Duration::from_secs(5))
            .await
            .expect_err("should fail");
        assert!(matches!(err, ChatError::Stream(_)));
    }

    #[test]
    fn base_url_is_normalized() {
        let client = HttpRagClient::new("http://127.0.0.1:8000/");
        assert_eq!(client.base_url(), "http://127.0.0.1:8000");
    }

    #[test]
    fn deadline_errors_group_together() {
        assert!(ChatError::Timeout.is_deadline());
        assert!(ChatError::Cancelled.is_deadline());
        assert!(!ChatError::Connect("refused".to_string()).is_deadline());
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};

use mindscribe_client::RagClient;
use mindscribe_types::{Conversation, Message};

use crate::deadline::with_deadline;
use crate::title::synthesize_title;

/// Remote persistence contract: a row store keyed by conversation id, with
/// access filtered by the owning user on every call (the bearer token carries
/// the identity).
#[async_trait]
pub trait ConversationBackend: Send + Sync {
    async fn insert(&self, token: &str, title: &str, messages: &[Message])
        -> anyhow::Result<String>;
    async fn update(
        &self,
        token: &str,
        id: &str,
        title: &str,
        messages: &[Message],
    ) -> anyhow::Result<()>;
    async fn fetch(&self, token: &str, id: &str) -> anyhow::Result<Conversation>;
    async fn list(&self, token: &str) -> anyhow::Result<Vec<Conversation>>;
    async fn remove(&self, token: &str, id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct StoreTimeouts {
    pub list: Duration,
    pub save: Duration,
    pub delete: Duration,
}

impl Default for StoreTimeouts {
    fn default() -> Self {
        Self {
            list: Duration::from_secs(8),
            save: Duration::from_secs(10),
            delete: Duration::from_secs(5),
        }
    }
}

type SharedSave = Shared<BoxFuture<'static, Result<String, String>>>;

/// Adapter between the in-memory conversation list and the remote store.
///
/// The in-memory list is a cache the UI reads; the remote rows are the source
/// of truth. Racing or failed operations reconcile by reloading the whole
/// list rather than patching it.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    backend: Arc<dyn ConversationBackend>,
    rag: Arc<dyn RagClient>,
    timeouts: StoreTimeouts,
    title_deadline: Duration,
    conversations: RwLock<Vec<Conversation>>,
    active_id: RwLock<Option<String>>,
    in_flight_save: Mutex<Option<SharedSave>>,
}

impl ConversationStore {
    pub fn new(
        backend: Arc<dyn ConversationBackend>,
        rag: Arc<dyn RagClient>,
        timeouts: StoreTimeouts,
        title_deadline: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backend,
                rag,
                timeouts,
                title_deadline,
                conversations: RwLock::new(Vec::new()),
                active_id: RwLock::new(None),
                in_flight_save: Mutex::new(None),
            }),
        }
    }

    /// Upsert the working history. At most one save is in flight per store:
    /// a call that arrives while one is running performs no second mutation
    /// and resolves to the in-flight save's eventual id.
    pub async fn save(&self, token: &str, history: Vec<Message>) -> anyhow::Result<String> {
        if history.is_empty() {
            anyhow::bail!("nothing to save");
        }

        let shared = {
            let mut guard = self.inner.in_flight_save.lock().await;
            if let Some(existing) = guard.as_ref() {
                tracing::debug!("save already in flight, adopting its outcome");
                existing.clone()
            } else {
                let this = self.clone();
                let token = token.to_string();
                let fut: SharedSave = async move {
                    let outcome = this
                        .save_inner(&token, history)
                        .await
                        .map_err(|err| err.to_string());
                    *this.inner.in_flight_save.lock().await = None;
                    outcome
                }
                .boxed()
                .shared();
                *guard = Some(fut.clone());
                fut
            }
        };

        shared.await.map_err(|detail| anyhow::anyhow!(detail))
    }

    async fn save_inner(&self, token: &str, history: Vec<Message>) -> anyhow::Result<String> {
        let title = synthesize_title(
            self.inner.rag.as_ref(),
            &history,
            self.inner.title_deadline,
        )
        .await;
        let now = Utc::now();

        let active = self.inner.active_id.read().await.clone();
        let id = match active {
            Some(id) => {
                with_deadline(
                    self.inner.backend.update(token, &id, &title, &history),
                    self.inner.timeouts.save,
                    "conversation save",
                )
                .await?;
                id
            }
            None => {
                let id = with_deadline(
                    self.inner.backend.insert(token, &title, &history),
                    self.inner.timeouts.save,
                    "conversation save",
                )
                .await?;
                *self.inner.active_id.write().await = Some(id.clone());
                id
            }
        };

        let mut conversations = self.inner.conversations.write().await;
        match conversations.iter_mut().find(|c| c.id == id) {
            Some(existing) => {
                existing.title = title;
                existing.updated_at = now;
                existing.messages = history;
            }
            None => conversations.insert(
                0,
                Conversation {
                    id: id.clone(),
                    title,
                    updated_at: now,
                    messages: history,
                },
            ),
        }
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        Ok(id)
    }

    /// Remove a conversation, optimistically: it disappears from the local
    /// list before the remote call settles. If the remote side disagrees, the
    /// whole list is reloaded rather than patched back.
    ///
    /// Returns whether the removed conversation was the active one, so the
    /// caller can substitute a fresh working copy for the deleted transcript.
    pub async fn delete(&self, token: &str, id: &str) -> bool {
        self.inner
            .conversations
            .write()
            .await
            .retain(|c| c.id != id);
        let was_active = {
            let mut active = self.inner.active_id.write().await;
            if active.as_deref() == Some(id) {
                // Deleted the active conversation; the next save starts fresh.
                *active = None;
                true
            } else {
                false
            }
        };

        let outcome = with_deadline(
            self.inner.backend.remove(token, id),
            self.inner.timeouts.delete,
            "conversation delete",
        )
        .await;
        if let Err(err) = outcome {
            tracing::warn!(error = %err, id, "delete failed, reconciling from remote");
            if let Err(err) = self.reload(token).await {
                tracing::warn!(error = %err, "reload after failed delete also failed");
            }
        }

        was_active
    }

    /// Fetch the owner's conversations, most recently updated first, and
    /// replace the local list with them.
    pub async fn reload(&self, token: &str) -> anyhow::Result<Vec<Conversation>> {
        let mut fetched = with_deadline(
            self.inner.backend.list(token),
            self.inner.timeouts.list,
            "conversation list",
        )
        .await?;
        fetched.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        *self.inner.conversations.write().await = fetched.clone();
        Ok(fetched)
    }

    pub async fn load(&self, token: &str, id: &str) -> anyhow::Result<Conversation> {
        with_deadline(
            self.inner.backend.fetch(token, id),
            self.inner.timeouts.list,
            "conversation load",
        )
        .await
    }

    /// Local view; call [`reload`](Self::reload) to refresh from remote.
    pub async fn cached(&self) -> Vec<Conversation> {
        self.inner.conversations.read().await.clone()
    }

    pub async fn active_id(&self) -> Option<String> {
        self.inner.active_id.read().await.clone()
    }

    /// Mark the most recently updated cached conversation active and return
    /// it, if any.
    pub async fn activate_latest(&self) -> Option<Conversation> {
        let latest = self.inner.conversations.read().await.first().cloned()?;
        *self.inner.active_id.write().await = Some(latest.id.clone());
        Some(latest)
    }

    pub async fn set_active(&self, id: Option<String>) {
        *self.inner.active_id.write().await = id;
    }

    /// Forget local state on sign-out.
    pub async fn clear(&self) {
        self.inner.conversations.write().await.clear();
        *self.inner.active_id.write().await = None;
    }
}

#[derive(Debug, Deserialize)]
struct ConversationRow {
    id: String,
    title: String,
    #[serde(default)]
    history: Vec<Message>,
    updated_at: DateTime<Utc>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Conversation {
            id: row.id,
            title: row.title,
            updated_at: row.updated_at,
            messages: row.history,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    conversations: Vec<ConversationRow>,
}

#[derive(Debug, Deserialize)]
struct InsertResponse {
    #[serde(rename = "conversationId")]
    conversation_id: String,
}

/// REST implementation of the row store.
pub struct HttpConversationBackend {
    base_url: String,
    client: Client,
}

impl HttpConversationBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/conversations{}", self.base_url, suffix)
    }
}

#[async_trait]
impl ConversationBackend for HttpConversationBackend {
    async fn insert(
        &self,
        token: &str,
        title: &str,
        messages: &[Message],
    ) -> anyhow::Result<String> {
        let response = self
            .client
            .post(self.url(""))
            .bearer_auth(token)
            .json(&json!({ "title": title, "history": messages }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("conversation insert returned status {status}");
        }
        let body: InsertResponse = response.json().await?;
        Ok(body.conversation_id)
    }

    async fn update(
        &self,
        token: &str,
        id: &str,
        title: &str,
        messages: &[Message],
    ) -> anyhow::Result<()> {
        let response = self
            .client
            .put(self.url(&format!("/{id}")))
            .bearer_auth(token)
            .json(&json!({ "title": title, "history": messages }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("conversation update returned status {status}");
        }
        Ok(())
    }

    async fn fetch(&self, token: &str, id: &str) -> anyhow::Result<Conversation> {
        let response = self
            .client
            .get(self.url(&format!("/{id}")))
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("conversation fetch returned status {status}");
        }
        let row: ConversationRow = response.json().await?;
        Ok(row.into())
    }

    async fn list(&self, token: &str) -> anyhow::Result<Vec<Conversation>> {
        let response = self
            .client
            .get(self.url(""))
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("conversation list returned status {status}");
        }
        let body: ListResponse = response.json().await?;
        Ok(body.conversations.into_iter().map(Into::into).collect())
    }

    async fn remove(&self, token: &str, id: &str) -> anyhow::Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/{id}")))
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("conversation delete returned status {status}");
        }
        Ok(())
    }
}

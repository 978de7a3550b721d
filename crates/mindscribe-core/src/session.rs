use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, RwLock};

use mindscribe_types::{AuthEvent, AuthSession, UserIdentity};

use crate::cache::CredentialCache;
use crate::deadline::with_deadline;

/// The remote identity provider: a session-retrieval call plus an
/// asynchronous change-notification subscription.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn current_session(&self) -> anyhow::Result<Option<AuthSession>>;
    async fn sign_out(&self) -> anyhow::Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}

/// Session lifecycle owner: resolves identity at startup, tracks auth
/// transitions, and keeps the credential cache in step.
pub struct SessionStore {
    provider: Arc<dyn SessionProvider>,
    cache: CredentialCache,
    session: RwLock<Option<AuthSession>>,
    sign_out_timeout: Duration,
}

impl SessionStore {
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        cache: CredentialCache,
        sign_out_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            cache,
            session: RwLock::new(None),
            sign_out_timeout,
        }
    }

    /// Startup resolution order: local cache, then the remote provider, then
    /// anonymous. Never errors; a failing provider reads as "no session".
    pub async fn bootstrap(&self) -> Option<AuthSession> {
        if let Some(cached) = self.cache.read() {
            tracing::info!(user = %cached.user.id, "session restored from cache");
            *self.session.write().await = Some(cached.clone());
            return Some(cached);
        }

        match self.provider.current_session().await {
            Ok(Some(session)) => {
                self.cache.write(&session);
                *self.session.write().await = Some(session.clone());
                tracing::info!(user = %session.user.id, "session resolved from provider");
                Some(session)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::debug!(error = %err, "session query failed, starting anonymous");
                None
            }
        }
    }

    pub async fn current(&self) -> Option<AuthSession> {
        self.session.read().await.clone()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.access_token.clone())
    }

    /// Apply a provider-originated auth transition.
    pub async fn handle_event(&self, event: AuthEvent) {
        match event {
            AuthEvent::SignedIn(session) => {
                self.cache.write(&session);
                *self.session.write().await = Some(session);
            }
            AuthEvent::SignedOut => {
                *self.session.write().await = None;
                self.cache.clear();
            }
        }
    }

    /// Explicit sign-out. Local state and cache are cleared synchronously;
    /// the remote call is best-effort under a short deadline and its failure
    /// never reverts the local sign-out.
    pub async fn sign_out(&self) {
        *self.session.write().await = None;
        self.cache.clear();

        let outcome = with_deadline(
            self.provider.sign_out(),
            self.sign_out_timeout,
            "remote sign-out",
        )
        .await;
        if let Err(err) = outcome {
            tracing::warn!(error = %err, "remote sign-out failed; local state already cleared");
        }
    }

    /// Follow provider notifications until the provider goes away.
    pub async fn run_events(&self) {
        let mut events = self.provider.subscribe();
        loop {
            match events.recv().await {
                Ok(event) => self.handle_event(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "missed auth events, continuing");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    access_token: Option<String>,
    user: Option<UserIdentity>,
}

/// HTTP session provider. Change notifications originate from this client's
/// own sign-in/sign-out calls and are fanned out on a broadcast channel.
pub struct HttpSessionProvider {
    base_url: String,
    client: Client,
    events: broadcast::Sender<AuthEvent>,
}

impl HttpSessionProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
            events,
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> anyhow::Result<AuthSession> {
        let response = self
            .client
            .post(format!("{}/auth/sign-in", self.base_url))
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("sign-in returned status {status}");
        }
        let body: SessionResponse = response.json().await?;
        let (Some(access_token), Some(user)) = (body.access_token, body.user) else {
            anyhow::bail!("sign-in response missing credential or identity");
        };
        let session = AuthSession { user, access_token };
        let _ = self.events.send(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }
}

#[async_trait]
impl SessionProvider for HttpSessionProvider {
    async fn current_session(&self) -> anyhow::Result<Option<AuthSession>> {
        let response = self
            .client
            .get(format!("{}/auth/session", self.base_url))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("session query returned status {status}");
        }
        let body: SessionResponse = response.json().await?;
        match (body.access_token, body.user) {
            (Some(access_token), Some(user)) => Ok(Some(AuthSession { user, access_token })),
            _ => Ok(None),
        }
    }

    async fn sign_out(&self) -> anyhow::Result<()> {
        let response = self
            .client
            .post(format!("{}/auth/sign-out", self.base_url))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("sign-out returned status {status}");
        }
        let _ = self.events.send(AuthEvent::SignedOut);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProvider {
        session: Option<AuthSession>,
        fail_query: bool,
        fail_sign_out: bool,
        queries: AtomicUsize,
        sign_outs: AtomicUsize,
        events: broadcast::Sender<AuthEvent>,
    }

    impl FakeProvider {
        fn new(session: Option<AuthSession>) -> Self {
            let (events, _) = broadcast::channel(16);
            Self {
                session,
                fail_query: false,
                fail_sign_out: false,
                queries: AtomicUsize::new(0),
                sign_outs: AtomicUsize::new(0),
                events,
            }
        }
    }

    #[async_trait]
    impl SessionProvider for FakeProvider {
        async fn current_session(&self) -> anyhow::Result<Option<AuthSession>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.fail_query {
                anyhow::bail!("provider unreachable");
            }
            Ok(self.session.clone())
        }

        async fn sign_out(&self) -> anyhow::Result<()> {
            self.sign_outs.fetch_add(1, Ordering::SeqCst);
            if self.fail_sign_out {
                anyhow::bail!("sign-out rejected");
            }
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
            self.events.subscribe()
        }
    }

    fn session_for(id: &str) -> AuthSession {
        AuthSession {
            user: UserIdentity {
                id: id.to_string(),
                email: format!("{id}@example.com"),
                display_name: None,
            },
            access_token: format!("tok-{id}"),
        }
    }

    fn cache_in(dir: &tempfile::TempDir) -> CredentialCache {
        CredentialCache::new(dir.path().join("credentials.json"))
    }

    #[tokio::test]
    async fn cache_hit_skips_the_provider() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = cache_in(&dir);
        cache.write(&session_for("cached"));

        let provider = Arc::new(FakeProvider::new(Some(session_for("remote"))));
        let store = SessionStore::new(provider.clone(), cache, Duration::from_millis(100));

        let session = store.bootstrap().await.expect("session");
        assert_eq!(session.user.id, "cached");
        assert_eq!(provider.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn corrupted_cache_behaves_like_a_miss() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, b"\x00garbage\xff").expect("write");

        let provider = Arc::new(FakeProvider::new(Some(session_for("remote"))));
        let store = SessionStore::new(
            provider.clone(),
            CredentialCache::new(&path),
            Duration::from_millis(100),
        );

        let session = store.bootstrap().await.expect("session");
        assert_eq!(session.user.id, "remote");
        assert_eq!(provider.queries.load(Ordering::SeqCst), 1);
        // Read-your-writes: the provider result is cached for next start.
        assert!(CredentialCache::new(&path).read().is_some());
    }

    #[tokio::test]
    async fn provider_error_means_anonymous() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = Arc::new(FakeProvider {
            fail_query: true,
            ..FakeProvider::new(None)
        });
        let store = SessionStore::new(provider, cache_in(&dir), Duration::from_millis(100));

        assert!(store.bootstrap().await.is_none());
        assert!(store.current().await.is_none());
    }

    #[tokio::test]
    async fn sign_out_clears_local_state_even_when_remote_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = cache_in(&dir);
        cache.write(&session_for("u"));

        let provider = Arc::new(FakeProvider {
            fail_sign_out: true,
            ..FakeProvider::new(None)
        });
        let store = SessionStore::new(provider.clone(), cache, Duration::from_millis(100));
        store.bootstrap().await;

        store.sign_out().await;

        assert!(store.current().await.is_none());
        assert!(CredentialCache::new(dir.path().join("credentials.json"))
            .read()
            .is_none());
        assert_eq!(provider.sign_outs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn signed_in_event_updates_state_and_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = Arc::new(FakeProvider::new(None));
        let store = SessionStore::new(
            provider,
            cache_in(&dir),
            Duration::from_millis(100),
        );

        store
            .handle_event(AuthEvent::SignedIn(session_for("fresh")))
            .await;

        assert_eq!(store.current().await.expect("session").user.id, "fresh");
        assert!(cache_in(&dir).read().is_some());
    }
}

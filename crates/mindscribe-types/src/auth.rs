use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: String,
    pub email: String,
    pub display_name: Option<String>,
}

impl UserIdentity {
    /// Name shown in greetings; falls back when the provider has none.
    pub fn preferred_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or("Friend")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    pub user: UserIdentity,
    pub access_token: String,
}

#[derive(Debug, Clone)]
pub enum AuthEvent {
    SignedIn(AuthSession),
    SignedOut,
}

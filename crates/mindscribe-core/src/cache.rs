use std::collections::HashMap;
use std::path::{Path, PathBuf};

use mindscribe_types::{AuthSession, UserIdentity};

pub const CACHE_KEY_USER: &str = "user";
pub const CACHE_KEY_TOKEN: &str = "token";

/// Two-entry credential cache on disk so a signed-in session survives process
/// restarts. The remote session provider stays the source of truth; anything
/// here that fails to parse is cleared and treated as a miss.
#[derive(Debug, Clone)]
pub struct CredentialCache {
    path: PathBuf,
}

impl CredentialCache {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn read(&self) -> Option<AuthSession> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        let entries = match serde_json::from_str::<HashMap<String, String>>(&raw) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, "credential cache unreadable, clearing");
                self.clear();
                return None;
            }
        };
        let (Some(user_raw), Some(token)) = (
            entries.get(CACHE_KEY_USER),
            entries.get(CACHE_KEY_TOKEN),
        ) else {
            return None;
        };
        if token.trim().is_empty() {
            self.clear();
            return None;
        }
        match serde_json::from_str::<UserIdentity>(user_raw) {
            Ok(user) => Some(AuthSession {
                user,
                access_token: token.clone(),
            }),
            Err(err) => {
                tracing::warn!(error = %err, "cached identity corrupted, clearing");
                self.clear();
                None
            }
        }
    }

    pub fn write(&self, session: &AuthSession) {
        let mut entries = HashMap::new();
        match serde_json::to_string(&session.user) {
            Ok(user_raw) => {
                entries.insert(CACHE_KEY_USER.to_string(), user_raw);
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize identity for cache");
                return;
            }
        }
        entries.insert(CACHE_KEY_TOKEN.to_string(), session.access_token.clone());

        if let Some(parent) = self.path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        match serde_json::to_string_pretty(&entries) {
            Ok(raw) => {
                if let Err(err) = std::fs::write(&self.path, raw) {
                    tracing::warn!(error = %err, "failed to persist credential cache");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to encode credential cache"),
        }
    }

    pub fn clear(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_chat_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_store_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_chat_timeout() -> u64 {
    30
}

fn default_title_timeout() -> u64 {
    15
}

fn default_list_timeout() -> u64 {
    8
}

fn default_save_timeout() -> u64 {
    10
}

fn default_delete_timeout() -> u64 {
    5
}

fn default_sign_out_timeout() -> u64 {
    5
}

fn default_log_retention_days() -> u64 {
    14
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_chat_url")]
    pub base_url: String,
    #[serde(default = "default_chat_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_title_timeout")]
    pub title_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_url")]
    pub base_url: String,
    #[serde(default = "default_list_timeout")]
    pub list_timeout_secs: u64,
    #[serde(default = "default_save_timeout")]
    pub save_timeout_secs: u64,
    #[serde(default = "default_delete_timeout")]
    pub delete_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_store_url")]
    pub base_url: String,
    #[serde(default = "default_sign_out_timeout")]
    pub sign_out_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: default_chat_url(),
            request_timeout_secs: default_chat_timeout(),
            title_timeout_secs: default_title_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: default_store_url(),
            list_timeout_secs: default_list_timeout(),
            save_timeout_secs: default_save_timeout(),
            delete_timeout_secs: default_delete_timeout(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            base_url: default_store_url(),
            sign_out_timeout_secs: default_sign_out_timeout(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            chat: ChatConfig::default(),
            store: StoreConfig::default(),
            auth: AuthConfig::default(),
            log_retention_days: default_log_retention_days(),
        }
    }
}

impl AppConfig {
    /// File, then environment, then CLI flags; later layers win.
    pub fn load(path: &Path) -> Self {
        let mut config = std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| {
                serde_json::from_str::<AppConfig>(&raw)
                    .map_err(|err| {
                        tracing::warn!(error = %err, path = %path.display(), "ignoring unreadable config file");
                        err
                    })
                    .ok()
            })
            .unwrap_or_default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("MINDSCRIBE_CHAT_URL") {
            if !url.trim().is_empty() {
                self.chat.base_url = url;
            }
        }
        if let Ok(url) = std::env::var("MINDSCRIBE_STORE_URL") {
            if !url.trim().is_empty() {
                self.store.base_url = url.clone();
                self.auth.base_url = url;
            }
        }
    }

    pub fn apply_cli_overrides(&mut self, chat_url: Option<String>, store_url: Option<String>) {
        if let Some(url) = chat_url {
            self.chat.base_url = url;
        }
        if let Some(url) = store_url {
            self.store.base_url = url.clone();
            self.auth.base_url = url;
        }
    }

    pub fn chat_timeout(&self) -> Duration {
        Duration::from_secs(self.chat.request_timeout_secs)
    }

    pub fn title_timeout(&self) -> Duration {
        Duration::from_secs(self.chat.title_timeout_secs)
    }

    pub fn store_timeouts(&self) -> crate::store::StoreTimeouts {
        crate::store::StoreTimeouts {
            list: Duration::from_secs(self.store.list_timeout_secs),
            save: Duration::from_secs(self.store.save_timeout_secs),
            delete: Duration::from_secs(self.store.delete_timeout_secs),
        }
    }

    pub fn sign_out_timeout(&self) -> Duration {
        Duration::from_secs(self.auth.sign_out_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load(Path::new("/definitely/not/here/config.json"));
        assert_eq!(config.chat.base_url, "http://127.0.0.1:8000");
        assert_eq!(config.store.list_timeout_secs, 8);
        assert_eq!(config.store.delete_timeout_secs, 5);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"chat": {"base_url": "http://10.0.0.5:9000"}}"#).expect("write");

        let config = AppConfig::load(&path);
        assert_eq!(config.chat.base_url, "http://10.0.0.5:9000");
        assert_eq!(config.chat.request_timeout_secs, 30);
        assert_eq!(config.store.save_timeout_secs, 10);
    }

    #[test]
    fn cli_overrides_win() {
        let mut config = AppConfig::default();
        config.apply_cli_overrides(Some("http://cli:1".to_string()), None);
        assert_eq!(config.chat.base_url, "http://cli:1");
        assert_eq!(config.store.base_url, "http://127.0.0.1:8000");
    }
}

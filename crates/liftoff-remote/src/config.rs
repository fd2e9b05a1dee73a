use crate::protocol::Route;
use crate::RemoteError;
use liftoff_schema::RecordKey;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteConfig {
    pub url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Tenant routing key, sent as the `account_id` query parameter.
    #[serde(default)]
    pub account_id: Option<String>,
}

impl RemoteConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_owned(),
            auth_token: None,
            account_id: None,
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_owned());
        self
    }

    #[must_use]
    pub fn with_account(mut self, account_id: &str) -> Self {
        self.account_id = Some(account_id.to_owned());
        self
    }

    /// Load config from `~/.config/liftoff/remote.json`.
    pub fn load_default() -> Result<Self, RemoteError> {
        let path = default_config_path()?;
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self, RemoteError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| RemoteError::Config(format!("invalid remote config: {e}")))?;
        config.url = config.url.trim_end_matches('/').to_owned();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), RemoteError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| RemoteError::Serialization(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Address the provisioning engine's `http` backend uses for one
    /// resource. The caller appends `lock_id`.
    pub fn engine_state_url(&self, key: &RecordKey) -> String {
        let url = format!("{}{}", self.url, Route::EngineState(key.clone()).path());
        match &self.account_id {
            Some(account) => format!("{url}?account_id={account}"),
            None => url,
        }
    }

    /// Fill unset fields from `other` (typically the user-level default file).
    #[must_use]
    pub fn or(mut self, other: Option<&RemoteConfig>) -> Self {
        if let Some(other) = other {
            if self.auth_token.is_none() {
                self.auth_token.clone_from(&other.auth_token);
            }
            if self.account_id.is_none() {
                self.account_id.clone_from(&other.account_id);
            }
        }
        self
    }
}

pub fn default_config_path() -> Result<PathBuf, RemoteError> {
    let home = std::env::var("HOME").map_err(|_| RemoteError::Config("HOME not set".to_owned()))?;
    Ok(PathBuf::from(home).join(".config/liftoff/remote.json"))
}

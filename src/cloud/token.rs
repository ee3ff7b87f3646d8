//! OAuth token persistence
//!
//! Tokens live in one JSON file under the data directory. A missing,
//! empty or unreadable file means "not connected".

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{CloudError, CloudResult};
use crate::fs_util;

/// Refresh this long before the access token actually expires
pub const REFRESH_MARGIN_SECS: i64 = 5 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl OAuthTokens {
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now + Duration::seconds(REFRESH_MARGIN_SECS)
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Option<OAuthTokens> {
        let content = fs::read_to_string(&self.path).ok()?;
        if content.trim().is_empty() {
            return None;
        }
        serde_json::from_str(&content).ok()
    }

    pub fn save(&self, tokens: &OAuthTokens) -> CloudResult<()> {
        let json = serde_json::to_vec_pretty(tokens)
            .map_err(|e| CloudError::Auth(format!("failed to encode tokens: {}", e)))?;
        fs_util::atomic_write(&self.path, &json).map_err(|e| {
            CloudError::Auth(format!(
                "failed to persist tokens to {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    pub fn clear(&self) -> bool {
        fs_util::remove_quietly(&self.path)
    }
}

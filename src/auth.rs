//! Token validation for sync sessions.
//!
//! The sync core only needs `ValidateToken(token) -> user_id, device claims`.
//! [`TokenStore`] implements it from a YAML file managed by `marksync-admin`:
//!
//! ```yaml
//! tokens:
//!   - token: "k7Qp...base64url"
//!     user_id: "alice"
//!     device_id: "firefox-laptop"   # optional, binds the token to one device
//!     expires_at: "2027-01-01T00:00:00Z"   # optional
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use crate::models::DeviceIdentity;

/// Authentication failures. Always terminal for the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("unknown token")]
    InvalidToken,
    #[error("token expired")]
    Expired,
    #[error("token is bound to device '{expected}', not '{actual}'")]
    DeviceMismatch { expected: String, actual: String },
    #[error("no credentials received before timeout")]
    Timeout,
}

/// What a valid token says about its bearer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub user_id: String,
    /// Set when the token may only be used by one device.
    pub device_id: Option<String>,
}

impl Claims {
    /// Combines the claims with the device id announced in `HELLO`.
    pub fn bind_device(&self, device_id: &str) -> Result<DeviceIdentity, AuthError> {
        if let Some(expected) = &self.device_id {
            if expected != device_id {
                return Err(AuthError::DeviceMismatch {
                    expected: expected.clone(),
                    actual: device_id.to_string(),
                });
            }
        }
        Ok(DeviceIdentity {
            user_id: self.user_id.clone(),
            device_id: device_id.to_string(),
        })
    }
}

/// Auth collaborator consumed by the sync session.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn validate_token(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Token entry in `tokens.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// On-disk token file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenFile {
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

impl TokenFile {
    /// Reads the token file, returning an empty file if it doesn't exist.
    pub fn read(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(serde_yaml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

/// In-memory token store, indexed by token string.
#[derive(Debug, Clone, Default)]
pub struct TokenStore {
    tokens: HashMap<String, TokenEntry>,
}

impl TokenStore {
    /// Loads tokens from the YAML file.
    ///
    /// A missing or unreadable file yields an empty store so the server can
    /// still start; every authentication then fails.
    pub fn load(path: &Path) -> Self {
        match TokenFile::read(path) {
            Ok(file) => {
                let store = Self::from_entries(file.tokens);
                tracing::info!("Loaded {} token(s)", store.len());
                store
            }
            Err(e) => {
                tracing::warn!("Failed to read token file {}: {}", path.display(), e);
                tracing::warn!("No tokens loaded - all sync sessions will fail to authenticate");
                Self::default()
            }
        }
    }

    pub fn from_entries(entries: impl IntoIterator<Item = TokenEntry>) -> Self {
        Self {
            tokens: entries
                .into_iter()
                .map(|entry| (entry.token.clone(), entry))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, AuthError> {
        let entry = self.tokens.get(token).ok_or(AuthError::InvalidToken)?;
        if entry.expires_at.is_some_and(|exp| exp <= now) {
            return Err(AuthError::Expired);
        }
        Ok(Claims {
            user_id: entry.user_id.clone(),
            device_id: entry.device_id.clone(),
        })
    }
}

#[async_trait]
impl AuthService for TokenStore {
    async fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        self.validate(token, Utc::now())
    }
}

/// Generates a secure random token.
///
/// Returns 32 random bytes encoded as base64url (no padding).
pub fn generate_token() -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn entry(token: &str, user: &str) -> TokenEntry {
        TokenEntry {
            token: token.to_string(),
            user_id: user.to_string(),
            device_id: None,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_valid_token() {
        let store = TokenStore::from_entries([entry("secret", "alice")]);
        let claims = store.validate_token("secret").await.unwrap();
        assert_eq!(claims.user_id, "alice");
        assert!(claims.device_id.is_none());
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let store = TokenStore::from_entries([entry("secret", "alice")]);
        assert_eq!(
            store.validate_token("nope").await,
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn test_expired_token() {
        let mut e = entry("old", "alice");
        e.expires_at = Some(Utc::now() - Duration::minutes(1));
        let store = TokenStore::from_entries([e]);
        assert_eq!(store.validate("old", Utc::now()), Err(AuthError::Expired));
    }

    #[test]
    fn test_device_bound_claims() {
        let claims = Claims {
            user_id: "alice".into(),
            device_id: Some("laptop".into()),
        };
        assert!(claims.bind_device("laptop").is_ok());
        assert!(matches!(
            claims.bind_device("phone"),
            Err(AuthError::DeviceMismatch { .. })
        ));

        let open = Claims {
            user_id: "alice".into(),
            device_id: None,
        };
        let identity = open.bind_device("phone").unwrap();
        assert_eq!(identity.user_id, "alice");
        assert_eq!(identity.device_id, "phone");
    }

    #[test]
    fn test_token_file_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("tokens.yaml");

        let file = TokenFile {
            tokens: vec![entry("abc", "alice"), entry("def", "bob")],
        };
        file.write(&path).unwrap();

        let store = TokenStore::load(&path);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_missing_token_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = TokenStore::load(&temp.path().join("absent.yaml"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_generate_token_format() {
        let token = generate_token();
        assert_eq!(token.len(), 43);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(token, generate_token());
    }
}

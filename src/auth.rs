//! Email/password accounts with email verification.
//!
//! Users live in a JSON file keyed by lowercase email. The whole map is held
//! in memory behind a `tokio::sync::Mutex` and written back after every
//! change, so concurrent signups and verifications never interleave their
//! read-modify-write cycles.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Minimum password length, counted after trimming whitespace.
pub const MIN_PASSWORD_LEN: usize = 6;

/// Random bytes in a verification token (before base64).
const TOKEN_BYTES: usize = 32;
const SALT_BYTES: usize = 16;
const HASH_SCHEME: &str = "sha256";

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid email regex")
});

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Please enter a valid email address")]
    InvalidEmail,

    #[error("Password must be at least 6 characters long")]
    WeakPassword,

    #[error("Email already registered")]
    AlreadyRegistered,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Please verify your email before logging in.")]
    NotVerified,

    #[error("Invalid or expired verification link.")]
    InvalidToken,
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

pub fn validate_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

/// Salted SHA-256, stored as `sha256$<salt hex>$<digest hex>`.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_BYTES];
    rand::thread_rng().fill_bytes(&mut salt);
    format!(
        "{}${}${}",
        HASH_SCHEME,
        hex::encode(salt),
        hex::encode(salted_digest(&salt, password))
    )
}

fn salted_digest(salt: &[u8], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Check a password against a stored hash in constant time.
///
/// Bare 64-char hex digests (unsalted SHA-256) from older user files are
/// also accepted.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let (salt, expected) = match stored.split('$').collect::<Vec<_>>().as_slice() {
        [HASH_SCHEME, salt_hex, digest_hex] => {
            match (hex::decode(salt_hex), hex::decode(digest_hex)) {
                (Ok(salt), Ok(digest)) => (salt, digest),
                _ => return false,
            }
        }
        [legacy] if legacy.len() == 64 => match hex::decode(legacy) {
            Ok(digest) => (Vec::new(), digest),
            Err(_) => return false,
        },
        _ => return false,
    };
    let actual = salted_digest(&salt, password);
    actual[..].ct_eq(expected.as_slice()).into()
}

/// 32 random bytes, URL-safe base64 without padding.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Token prefix safe to put in logs.
fn token_prefix(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(10)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    &token[..end]
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub password_hash: String,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub verification_token: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Result of redeeming a verification token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    AlreadyVerified,
}

impl VerifyOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            VerifyOutcome::Verified => "Email verified successfully! You can now log in.",
            VerifyOutcome::AlreadyVerified => "Email already verified.",
        }
    }
}

#[derive(Debug)]
pub struct UserStore {
    /// `None` keeps everything in memory.
    path: Option<PathBuf>,
    users: Mutex<BTreeMap<String, UserRecord>>,
}

impl UserStore {
    /// Load users from `path`. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let users = load_users(&path);
        info!(path = %path.display(), users = users.len(), "user store ready");
        Self {
            path: Some(path),
            users: Mutex::new(users),
        }
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            users: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn user_count(&self) -> usize {
        self.users.lock().await.len()
    }

    #[cfg(test)]
    pub async fn get(&self, email: &str) -> Option<UserRecord> {
        self.users.lock().await.get(&email.to_lowercase()).cloned()
    }

    /// Register a new unverified user. Returns the verification token.
    pub async fn signup(&self, email: &str, password: &str) -> Result<String, AuthError> {
        if !validate_email(email) {
            return Err(AuthError::InvalidEmail);
        }
        if password.trim().chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }

        let key = email.to_lowercase();
        let mut users = self.users.lock().await;
        if users.contains_key(&key) {
            info!(email = %key, "signup rejected: already registered");
            return Err(AuthError::AlreadyRegistered);
        }

        let token = generate_token();
        users.insert(
            key.clone(),
            UserRecord {
                password_hash: hash_password(password),
                is_verified: false,
                verification_token: Some(token.clone()),
                created_at: Some(chrono::Utc::now().to_rfc3339()),
            },
        );
        self.persist(&users).await;
        info!(email = %key, "user registered");
        Ok(token)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<(), AuthError> {
        if !validate_email(email) {
            return Err(AuthError::InvalidEmail);
        }
        let key = email.to_lowercase();
        let users = self.users.lock().await;
        let user = match users.get(&key) {
            Some(u) => u,
            None => {
                info!(email = %key, "login failed: unknown user");
                return Err(AuthError::InvalidCredentials);
            }
        };
        if !verify_password(password, &user.password_hash) {
            info!(email = %key, "login failed: wrong password");
            return Err(AuthError::InvalidCredentials);
        }
        if !user.is_verified {
            info!(email = %key, "login refused: email not verified");
            return Err(AuthError::NotVerified);
        }
        info!(email = %key, "login successful");
        Ok(())
    }

    /// Redeem a verification token. Tokens are single use.
    pub async fn verify(&self, token: &str) -> Result<VerifyOutcome, AuthError> {
        let mut users = self.users.lock().await;
        let Some((email, user)) = users
            .iter_mut()
            .find(|(_, u)| u.verification_token.as_deref() == Some(token))
        else {
            info!(token = %token_prefix(token), "unknown verification token");
            return Err(AuthError::InvalidToken);
        };

        let outcome = if user.is_verified {
            VerifyOutcome::AlreadyVerified
        } else {
            user.is_verified = true;
            VerifyOutcome::Verified
        };
        user.verification_token = None;
        info!(email = %email, outcome = ?outcome, "email verification");

        self.persist(&users).await;
        Ok(outcome)
    }

    /// Best-effort write-through. Failures are logged; the in-memory state
    /// stays authoritative.
    async fn persist(&self, users: &BTreeMap<String, UserRecord>) {
        let Some(path) = &self.path else {
            return;
        };
        let json = match serde_json::to_vec_pretty(users) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize users");
                return;
            }
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(path = %parent.display(), error = %e, "failed to create user store directory");
                return;
            }
        }
        let tmp = path.with_extension("json.tmp");
        let result = async {
            tokio::fs::write(&tmp, &json).await?;
            tokio::fs::rename(&tmp, path).await
        }
        .await;
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to save users");
        }
    }
}

fn load_users(path: &Path) -> BTreeMap<String, UserRecord> {
    if !path.exists() {
        return BTreeMap::new();
    }
    let parsed = std::fs::read(path)
        .map_err(|e| e.to_string())
        .and_then(|bytes| {
            serde_json::from_slice::<BTreeMap<String, UserRecord>>(&bytes)
                .map_err(|e| e.to_string())
        });
    match parsed {
        Ok(users) => users
            .into_iter()
            .map(|(email, record)| (email.to_lowercase(), record))
            .collect(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load users, starting empty");
            BTreeMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_validation() {
        assert!(validate_email("analyst@example.com"));
        assert!(validate_email("first.last+ids@sub.example.org"));
        assert!(!validate_email("no-at-sign.example.com"));
        assert!(!validate_email("user@host"));
        assert!(!validate_email("user@example.c"));
        assert!(!validate_email(" user@example.com"));
    }

    #[test]
    fn test_password_hash_is_salted() {
        let a = hash_password("hunter22");
        let b = hash_password("hunter22");
        assert_ne!(a, b);
        assert!(a.starts_with("sha256$"));
        assert!(verify_password("hunter22", &a));
        assert!(verify_password("hunter22", &b));
        assert!(!verify_password("hunter23", &a));
    }

    #[test]
    fn test_legacy_unsalted_hash_accepted() {
        let legacy = hex::encode(Sha256::digest(b"secret123"));
        assert!(verify_password("secret123", &legacy));
        assert!(!verify_password("secret124", &legacy));
        assert!(!verify_password("secret123", "garbage"));
        assert!(!verify_password("secret123", "sha256$zz$zz"));
    }

    #[test]
    fn test_token_shape() {
        let t = generate_token();
        assert_eq!(t.len(), 43);
        assert!(t
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(t, generate_token());
    }

    #[tokio::test]
    async fn test_signup_validation() {
        let store = UserStore::in_memory();
        assert_eq!(
            store.signup("bad", "password").await,
            Err(AuthError::InvalidEmail)
        );
        assert_eq!(
            store.signup("a@example.com", "  abc   ").await,
            Err(AuthError::WeakPassword)
        );
        assert!(store.signup("A@Example.com", "abcdef").await.is_ok());
        assert_eq!(
            store.signup("a@example.com", "abcdef").await,
            Err(AuthError::AlreadyRegistered)
        );
        assert_eq!(store.user_count().await, 1);
    }

    #[tokio::test]
    async fn test_login_requires_verification() {
        let store = UserStore::in_memory();
        let token = store.signup("user@example.com", "secret1").await.unwrap();

        assert_eq!(
            store.login("user@example.com", "secret1").await,
            Err(AuthError::NotVerified)
        );
        assert_eq!(
            store.login("user@example.com", "wrong").await,
            Err(AuthError::InvalidCredentials)
        );
        assert_eq!(
            store.login("other@example.com", "secret1").await,
            Err(AuthError::InvalidCredentials)
        );
        assert_eq!(
            store.login("nope", "secret1").await,
            Err(AuthError::InvalidEmail)
        );

        assert_eq!(store.verify(&token).await, Ok(VerifyOutcome::Verified));
        assert_eq!(store.login("USER@example.com", "secret1").await, Ok(()));
    }

    #[tokio::test]
    async fn test_token_is_single_use() {
        let store = UserStore::in_memory();
        let token = store.signup("user@example.com", "secret1").await.unwrap();
        assert!(store.verify(&token).await.is_ok());
        assert_eq!(store.verify(&token).await, Err(AuthError::InvalidToken));
        assert_eq!(store.verify("").await, Err(AuthError::InvalidToken));
        let user = store.get("user@example.com").await.unwrap();
        assert!(user.is_verified);
        assert!(user.verification_token.is_none());
    }

    #[tokio::test]
    async fn test_store_writes_through_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");

        let store = UserStore::open(&path);
        let token = store.signup("disk@example.com", "secret1").await.unwrap();
        store.verify(&token).await.unwrap();

        let reopened = UserStore::open(&path);
        assert_eq!(reopened.user_count().await, 1);
        assert_eq!(reopened.login("disk@example.com", "secret1").await, Ok(()));
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = UserStore::open(&path);
        assert_eq!(store.user_count().await, 0);
    }
}

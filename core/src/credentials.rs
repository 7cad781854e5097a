//! # Credential Resolution
//!
//! Decides which merchant credentials an NVP call is signed with.
//!
//! Credentials live in an explicit [`SessionContext`] owned by the caller
//! (the proxy keeps one per browser session). They get there in one of two
//! ways:
//!
//! 1. Directly, via [`SessionContext::set_credentials`].
//! 2. By unlocking a saved key from a [`CredentialRepository`] with its
//!    password, via [`unlock_saved_key`].
//!
//! A wrong password and an unknown key id are told apart internally (they
//! are traced differently) but share one public message, so callers cannot
//! probe which key ids exist.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Environment;

// ---------------------------------------------------------------------------
// CredentialSet
// ---------------------------------------------------------------------------

/// Merchant API identity: the three values every NVP call is signed with.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialSet {
    pub username: String,
    pub password: String,
    pub signature: String,
    /// Environment the credentials belong to, when known.
    pub environment: Option<Environment>,
}

impl CredentialSet {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            signature: signature.into(),
            environment: None,
        }
    }

    pub fn with_environment(mut self, env: Environment) -> Self {
        self.environment = Some(env);
        self
    }

    /// All three identity values are non-blank.
    pub fn is_complete(&self) -> bool {
        [&self.username, &self.password, &self.signature]
            .iter()
            .all(|v| !v.trim().is_empty())
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("signature", &"[REDACTED]")
            .field("environment", &self.environment)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SessionContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionContext {
    credentials: Option<CredentialSet>,
    environment: Option<String>,
    last_seen: DateTime<Utc>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            credentials: None,
            environment: None,
            last_seen: Utc::now(),
        }
    }

    /// Install credentials and the session's active environment. A missing
    /// environment falls back to the one recorded on the credentials.
    pub fn set_credentials(&mut self, credentials: CredentialSet, environment: Option<String>) {
        self.environment = environment
            .filter(|e| !e.trim().is_empty())
            .or_else(|| credentials.environment.map(|e| e.as_str().to_string()));
        self.credentials = Some(credentials);
        self.touch();
    }

    pub fn clear(&mut self) {
        self.credentials = None;
        self.environment = None;
        self.touch();
    }

    pub fn credentials(&self) -> Option<&CredentialSet> {
        self.credentials.as_ref()
    }

    /// Raw environment override, as the client supplied it.
    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Repository seam
// ---------------------------------------------------------------------------

/// Public view of a saved key. Never carries the password or its hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeySummary {
    pub id: String,
    pub name: String,
    pub username: String,
    pub environment: Environment,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct NewApiKey {
    pub name: String,
    pub username: String,
    pub password: String,
    pub signature: String,
    pub environment: Environment,
}

/// Partial update; `None` leaves the field untouched.
#[derive(Clone, Default)]
pub struct ApiKeyUpdate {
    pub name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub signature: Option<String>,
    pub environment: Option<Environment>,
}

/// Result of checking a password against a saved key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified(CredentialSet),
    WrongPassword,
    NotFound,
}

/// Storage failure surfaced through the repository trait.
#[derive(Debug, Error)]
#[error("credential repository error: {0}")]
pub struct RepositoryError(pub String);

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Saved-credential storage. Key ids are opaque strings.
pub trait CredentialRepository: Send + Sync {
    fn verify(&self, id: &str, password: &str) -> RepositoryResult<Verification>;
    fn list(&self) -> RepositoryResult<Vec<ApiKeySummary>>;
    fn get(&self, id: &str) -> RepositoryResult<Option<ApiKeySummary>>;
    fn create(&self, key: NewApiKey) -> RepositoryResult<ApiKeySummary>;
    fn update(&self, id: &str, update: ApiKeyUpdate) -> RepositoryResult<Option<ApiKeySummary>>;
    fn delete(&self, id: &str) -> RepositoryResult<bool>;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

const INVALID_KEY_MESSAGE: &str = "Invalid API key or password";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no active credentials in session")]
    Missing,

    #[error("wrong password for saved key")]
    InvalidPassword,

    #[error("saved key not found")]
    NotFound,

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl CredentialError {
    /// Message safe to hand to a client. The two unlock failures are
    /// indistinguishable here.
    pub fn public_message(&self) -> &'static str {
        match self {
            CredentialError::Missing => {
                "No credentials set. Provide API credentials or use a saved key."
            }
            CredentialError::InvalidPassword | CredentialError::NotFound => INVALID_KEY_MESSAGE,
            CredentialError::Repository(_) => "Credential store unavailable",
        }
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// The credentials a call from this session should be signed with.
pub fn resolve_active(session: &SessionContext) -> Result<CredentialSet, CredentialError> {
    session.credentials().cloned().ok_or(CredentialError::Missing)
}

/// Check `password` against saved key `key_id` without touching any
/// session. Does the hashing and storage I/O, so async callers should run
/// it off the runtime threads.
pub fn verify_saved_key(
    repo: &dyn CredentialRepository,
    key_id: &str,
    password: &str,
) -> Result<CredentialSet, CredentialError> {
    match repo.verify(key_id, password)? {
        Verification::Verified(credentials) => {
            tracing::info!(key_id, "saved key unlocked");
            Ok(credentials)
        }
        Verification::WrongPassword => {
            tracing::warn!(key_id, "saved key unlock rejected: wrong password");
            Err(CredentialError::InvalidPassword)
        }
        Verification::NotFound => {
            tracing::debug!(key_id, "saved key unlock rejected: unknown id");
            Err(CredentialError::NotFound)
        }
    }
}

/// Make verified credentials active in `session`, along with the
/// environment the key was saved for.
pub fn activate(session: &mut SessionContext, credentials: CredentialSet) {
    let env = credentials.environment.map(|e| e.as_str().to_string());
    session.set_credentials(credentials, env);
}

/// Verify `password` against saved key `key_id` and, on success, make the
/// decrypted credentials active in `session`. No other session is touched.
pub fn unlock_saved_key(
    repo: &dyn CredentialRepository,
    session: &mut SessionContext,
    key_id: &str,
    password: &str,
) -> Result<CredentialSet, CredentialError> {
    let credentials = verify_saved_key(repo, key_id, password)?;
    activate(session, credentials.clone());
    Ok(credentials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tracing_subscriber::fmt::MakeWriter;

    /// Collects formatted `tracing` output.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;
        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    /// One hard-coded key, `"7"`, password `"hunter2"`.
    #[derive(Default)]
    struct SingleKey {
        deleted: Mutex<bool>,
    }

    impl CredentialRepository for SingleKey {
        fn verify(&self, id: &str, password: &str) -> RepositoryResult<Verification> {
            if id != "7" || *self.deleted.lock() {
                return Ok(Verification::NotFound);
            }
            if password != "hunter2" {
                return Ok(Verification::WrongPassword);
            }
            Ok(Verification::Verified(
                CredentialSet::new("merchant", "hunter2", "sig").with_environment(Environment::Live),
            ))
        }
        fn list(&self) -> RepositoryResult<Vec<ApiKeySummary>> {
            Ok(Vec::new())
        }
        fn get(&self, _: &str) -> RepositoryResult<Option<ApiKeySummary>> {
            Ok(None)
        }
        fn create(&self, _: NewApiKey) -> RepositoryResult<ApiKeySummary> {
            Err(RepositoryError("read-only".into()))
        }
        fn update(&self, _: &str, _: ApiKeyUpdate) -> RepositoryResult<Option<ApiKeySummary>> {
            Ok(None)
        }
        fn delete(&self, _: &str) -> RepositoryResult<bool> {
            *self.deleted.lock() = true;
            Ok(true)
        }
    }

    #[test]
    fn empty_session_has_no_credentials() {
        let err = resolve_active(&SessionContext::new()).unwrap_err();
        assert!(matches!(err, CredentialError::Missing));
    }

    #[test]
    fn set_then_clear() {
        let mut session = SessionContext::new();
        session.set_credentials(CredentialSet::new("u", "p", "s"), Some("live".into()));
        assert_eq!(resolve_active(&session).unwrap().username, "u");
        assert_eq!(session.environment(), Some("live"));

        session.clear();
        assert!(resolve_active(&session).is_err());
        assert_eq!(session.environment(), None);
    }

    #[test]
    fn unlock_sets_credentials_and_environment() {
        let repo = SingleKey::default();
        let mut session = SessionContext::new();

        let creds = unlock_saved_key(&repo, &mut session, "7", "hunter2").unwrap();
        assert_eq!(creds.username, "merchant");
        assert_eq!(session.environment(), Some("live"));
        assert_eq!(resolve_active(&session).unwrap(), creds);
    }

    #[test]
    fn unlock_failures_share_public_message() {
        let repo = SingleKey::default();
        let mut session = SessionContext::new();

        let wrong = unlock_saved_key(&repo, &mut session, "7", "nope").unwrap_err();
        let missing = unlock_saved_key(&repo, &mut session, "99", "hunter2").unwrap_err();

        assert!(matches!(wrong, CredentialError::InvalidPassword));
        assert!(matches!(missing, CredentialError::NotFound));
        assert_eq!(wrong.public_message(), missing.public_message());
        assert!(!session.is_authenticated());
    }

    #[test]
    fn verify_leaves_sessions_alone() {
        let repo = SingleKey::default();
        let creds = verify_saved_key(&repo, "7", "hunter2").unwrap();
        assert_eq!(creds.environment, Some(Environment::Live));

        let mut session = SessionContext::new();
        activate(&mut session, creds.clone());
        assert_eq!(resolve_active(&session).unwrap(), creds);
        assert_eq!(session.environment(), Some("live"));
    }

    #[test]
    fn unlock_logs_never_name_the_merchant() {
        let out = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(out.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let repo = SingleKey::default();
            verify_saved_key(&repo, "7", "hunter2").unwrap();
            verify_saved_key(&repo, "7", "nope").unwrap_err();
        });

        let text = String::from_utf8(out.0.lock().clone()).unwrap();
        assert!(text.contains("saved key unlocked"));
        assert!(!text.contains("merchant"));
        assert!(!text.contains("hunter2"));
    }

    #[test]
    fn unlock_only_touches_given_session() {
        let repo = SingleKey::default();
        let mut ours = SessionContext::new();
        let theirs = SessionContext::new();

        unlock_saved_key(&repo, &mut ours, "7", "hunter2").unwrap();
        assert!(ours.is_authenticated());
        assert!(!theirs.is_authenticated());
    }

    #[test]
    fn debug_masks_secrets() {
        let creds = CredentialSet::new("merchant", "hunter2", "AbCdEf");
        let printed = format!("{creds:?}");
        assert!(printed.contains("merchant"));
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("AbCdEf"));
    }

    #[test]
    fn completeness_rejects_blanks() {
        assert!(CredentialSet::new("u", "p", "s").is_complete());
        assert!(!CredentialSet::new("u", " ", "s").is_complete());
    }
}

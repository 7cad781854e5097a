//! # KeyStore: Saved API Keys on Disk
//!
//! Embedded [`sled`] store for named merchant credential sets. Each entry
//! is protected by a user-chosen password; the password itself is never
//! stored, only a salted, iterated SHA-256 digest of it.
//!
//! ## Tree Layout
//!
//! | Tree       | Key             | Value                   |
//! |------------|-----------------|-------------------------|
//! | `api_keys` | `id` (8B BE)    | `bincode(ApiKeyRecord)` |
//!
//! Ids come from sled's `generate_id`, stored big-endian so that iteration
//! order is creation order. Externally they are plain decimal strings.
//!
//! ## Password Hash Format
//!
//! `hex(salt) '$' hex(digest)` where `digest = H^rounds(salt || password)`
//! and every round re-hashes `salt || previous`. Verification recomputes
//! the digest and compares in constant time. Unknown ids are checked
//! against a decoy hash so they cost the same as a wrong password.

use std::path::Path;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sled::{Db, Tree};
use subtle::ConstantTimeEq;

use crate::config::{Environment, PASSWORD_HASH_ROUNDS, PASSWORD_SALT_LENGTH};
use crate::credentials::{
    ApiKeySummary, ApiKeyUpdate, CredentialRepository, CredentialSet, NewApiKey, RepositoryError,
    RepositoryResult, Verification,
};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("malformed password hash for key {0}")]
    MalformedHash(u64),
}

pub type KeyStoreResult<T> = Result<T, KeyStoreError>;

impl From<KeyStoreError> for RepositoryError {
    fn from(err: KeyStoreError) -> Self {
        RepositoryError(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Stored Record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: u64,
    pub name: String,
    pub username: String,
    pub password_hash: String,
    pub signature: String,
    pub environment: Environment,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApiKeyRecord {
    pub fn summary(&self) -> ApiKeySummary {
        ApiKeySummary {
            id: self.id.to_string(),
            name: self.name.clone(),
            username: self.username.clone(),
            environment: self.environment,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Password hashing
// ---------------------------------------------------------------------------

fn digest(salt: &[u8], password: &[u8], rounds: u32) -> [u8; 32] {
    let mut out: [u8; 32] = Sha256::new()
        .chain_update(salt)
        .chain_update(password)
        .finalize()
        .into();
    for _ in 1..rounds {
        out = Sha256::new()
            .chain_update(salt)
            .chain_update(out)
            .finalize()
            .into();
    }
    out
}

pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; PASSWORD_SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);
    let hash = digest(&salt, password.as_bytes(), PASSWORD_HASH_ROUNDS);
    format!("{}${}", hex::encode(salt), hex::encode(hash))
}

/// `None` when `stored` is not in `salt$digest` form.
pub fn verify_password(password: &str, stored: &str) -> Option<bool> {
    let (salt_hex, digest_hex) = stored.split_once('$')?;
    let salt = hex::decode(salt_hex).ok()?;
    let expected = hex::decode(digest_hex).ok()?;
    let actual = digest(&salt, password.as_bytes(), PASSWORD_HASH_ROUNDS);
    Some(actual[..].ct_eq(&expected[..]).into())
}

/// Hash of a random throwaway password, computed once per process.
fn decoy_hash() -> &'static str {
    static DECOY: OnceLock<String> = OnceLock::new();
    DECOY.get_or_init(|| {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        hash_password(&hex::encode(secret))
    })
}

/// Spend a full verification on an id that does not exist.
fn verify_against_decoy(password: &str) {
    let _ = verify_password(password, decoy_hash());
}

// ---------------------------------------------------------------------------
// KeyStore
// ---------------------------------------------------------------------------

/// Saved-key repository backed by sled. Cheap to clone; clones share the
/// same database.
#[derive(Debug, Clone)]
pub struct KeyStore {
    db: Db,
    keys: Tree,
}

impl KeyStore {
    pub fn open<P: AsRef<Path>>(path: P) -> KeyStoreResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory store, removed on drop. For tests.
    pub fn open_temporary() -> KeyStoreResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> KeyStoreResult<Self> {
        let keys = db.open_tree("api_keys")?;
        Ok(Self { db, keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn put(&self, record: &ApiKeyRecord) -> KeyStoreResult<()> {
        let bytes =
            bincode::serialize(record).map_err(|e| KeyStoreError::Serialization(e.to_string()))?;
        self.keys.insert(record.id.to_be_bytes(), bytes)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn load(&self, id: u64) -> KeyStoreResult<Option<ApiKeyRecord>> {
        match self.keys.get(id.to_be_bytes())? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| KeyStoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn insert(&self, key: NewApiKey) -> KeyStoreResult<ApiKeyRecord> {
        let now = Utc::now();
        let record = ApiKeyRecord {
            id: self.db.generate_id()?,
            name: key.name,
            username: key.username,
            password_hash: hash_password(&key.password),
            signature: key.signature,
            environment: key.environment,
            created_at: now,
            updated_at: now,
        };
        self.put(&record)?;
        tracing::info!(id = record.id, name = %record.name, "api key saved");
        Ok(record)
    }

    /// Every record, newest first.
    pub fn records(&self) -> KeyStoreResult<Vec<ApiKeyRecord>> {
        let mut out = Vec::with_capacity(self.keys.len());
        for entry in self.keys.iter().rev() {
            let (_, bytes) = entry?;
            let record: ApiKeyRecord = bincode::deserialize(&bytes)
                .map_err(|e| KeyStoreError::Serialization(e.to_string()))?;
            out.push(record);
        }
        Ok(out)
    }

    pub fn modify(&self, id: u64, update: ApiKeyUpdate) -> KeyStoreResult<Option<ApiKeyRecord>> {
        let Some(mut record) = self.load(id)? else {
            return Ok(None);
        };
        if let Some(name) = update.name {
            record.name = name;
        }
        if let Some(username) = update.username {
            record.username = username;
        }
        if let Some(password) = update.password.filter(|p| !p.is_empty()) {
            record.password_hash = hash_password(&password);
        }
        if let Some(signature) = update.signature {
            record.signature = signature;
        }
        if let Some(environment) = update.environment {
            record.environment = environment;
        }
        record.updated_at = Utc::now();
        self.put(&record)?;
        Ok(Some(record))
    }

    pub fn remove(&self, id: u64) -> KeyStoreResult<bool> {
        let removed = self.keys.remove(id.to_be_bytes())?.is_some();
        self.db.flush()?;
        Ok(removed)
    }

    pub fn check(&self, id: u64, password: &str) -> KeyStoreResult<Verification> {
        let Some(record) = self.load(id)? else {
            verify_against_decoy(password);
            return Ok(Verification::NotFound);
        };
        match verify_password(password, &record.password_hash) {
            None => Err(KeyStoreError::MalformedHash(id)),
            Some(false) => Ok(Verification::WrongPassword),
            Some(true) => Ok(Verification::Verified(
                // The caller proved knowledge of the password; it is the
                // upstream API password too.
                CredentialSet::new(record.username, password, record.signature)
                    .with_environment(record.environment),
            )),
        }
    }
}

/// External ids are decimal; anything unparsable simply does not exist.
fn parse_id(id: &str) -> Option<u64> {
    id.trim().parse().ok()
}

impl CredentialRepository for KeyStore {
    fn verify(&self, id: &str, password: &str) -> RepositoryResult<Verification> {
        match parse_id(id) {
            Some(id) => Ok(self.check(id, password)?),
            None => {
                verify_against_decoy(password);
                Ok(Verification::NotFound)
            }
        }
    }

    fn list(&self) -> RepositoryResult<Vec<ApiKeySummary>> {
        Ok(self.records()?.iter().map(ApiKeyRecord::summary).collect())
    }

    fn get(&self, id: &str) -> RepositoryResult<Option<ApiKeySummary>> {
        match parse_id(id) {
            Some(id) => Ok(self.load(id)?.map(|r| r.summary())),
            None => Ok(None),
        }
    }

    fn create(&self, key: NewApiKey) -> RepositoryResult<ApiKeySummary> {
        Ok(self.insert(key)?.summary())
    }

    fn update(&self, id: &str, update: ApiKeyUpdate) -> RepositoryResult<Option<ApiKeySummary>> {
        match parse_id(id) {
            Some(id) => Ok(self.modify(id, update)?.map(|r| r.summary())),
            None => Ok(None),
        }
    }

    fn delete(&self, id: &str) -> RepositoryResult<bool> {
        match parse_id(id) {
            Some(id) => Ok(self.remove(id)?),
            None => Ok(false),
        }
    }
}

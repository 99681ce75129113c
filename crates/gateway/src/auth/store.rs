//! Persistence of the backend credential.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use jiff::Timestamp;
use rusqlite::{Connection, OptionalExtension, params};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::AuthError;

const TOKEN_KEY: &str = "kirocli:odic:token";
const REGISTRATION_KEY: &str = "kirocli:odic:device-registration";
const PROFILE_KEY: &str = "api.codewhisperer.profile";

/// The rotating part of the credential.
#[derive(Debug, Clone, Deserialize)]
pub struct StoredToken {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub expires_at: Timestamp,
}

/// OIDC client registration used to authenticate refresh requests.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    pub client_secret: SecretString,
    #[serde(default)]
    pub client_secret_expires_at: Option<Timestamp>,
}

#[derive(Debug, Clone)]
pub struct StoredCredential {
    pub token: StoredToken,
    pub registration: ClientRegistration,
    pub profile_arn: Option<String>,
}

/// Where the credential lives between refreshes.
///
/// The store can be rotated by other processes at any time, so implementations
/// must read fresh state on every `load`.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<StoredCredential, AuthError>;

    /// Writes back a refreshed token, leaving everything else untouched.
    async fn save_token(&self, token: &StoredToken) -> Result<(), AuthError>;
}

/// The SQLite database maintained by the vendor CLI.
pub struct SqliteCredentialStore {
    path: PathBuf,
}

impl SqliteCredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn load(&self) -> Result<StoredCredential, AuthError> {
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || load_credential(&path))
            .await
            .map_err(|error| AuthError::Store(error.to_string()))?
    }

    async fn save_token(&self, token: &StoredToken) -> Result<(), AuthError> {
        let path = self.path.clone();
        let token = token.clone();

        tokio::task::spawn_blocking(move || save_token(&path, &token))
            .await
            .map_err(|error| AuthError::Store(error.to_string()))?
    }
}

#[derive(Deserialize)]
struct ProfileRecord {
    arn: String,
}

fn open(path: &Path) -> Result<Connection, AuthError> {
    if !path.exists() {
        return Err(AuthError::Missing(format!(
            "database {} does not exist, log in with kiro-cli first",
            path.display()
        )));
    }

    Connection::open(path).map_err(store_error)
}

fn load_credential(path: &Path) -> Result<StoredCredential, AuthError> {
    let connection = open(path)?;

    let token = read_json(&connection, "auth_kv", TOKEN_KEY)?
        .ok_or_else(|| AuthError::Missing(format!("no '{TOKEN_KEY}' entry, log in with kiro-cli first")))?;

    let registration = read_json(&connection, "auth_kv", REGISTRATION_KEY)?
        .ok_or_else(|| AuthError::Missing(format!("no '{REGISTRATION_KEY}' entry, log in with kiro-cli first")))?;

    // Older databases have no state table; the profile is optional anyway.
    let profile_arn = match read_json::<ProfileRecord>(&connection, "state", PROFILE_KEY) {
        Ok(profile) => profile.map(|profile| profile.arn),
        Err(error) => {
            log::debug!("No profile in credential store: {error}");
            None
        }
    };

    Ok(StoredCredential {
        token,
        registration,
        profile_arn,
    })
}

fn read_json<T: serde::de::DeserializeOwned>(
    connection: &Connection,
    table: &str,
    key: &str,
) -> Result<Option<T>, AuthError> {
    let value: Option<String> = connection
        .query_row(&format!("SELECT value FROM {table} WHERE key = ?1"), [key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(store_error)?;

    value
        .map(|value| serde_json::from_str(&value))
        .transpose()
        .map_err(|error| AuthError::Store(format!("invalid '{key}' entry: {error}")))
}

fn save_token(path: &Path, token: &StoredToken) -> Result<(), AuthError> {
    let mut connection = open(path)?;
    let transaction = connection.transaction().map_err(store_error)?;

    let current: String = transaction
        .query_row("SELECT value FROM auth_kv WHERE key = ?1", [TOKEN_KEY], |row| row.get(0))
        .map_err(store_error)?;

    let mut record: Map<String, Value> = serde_json::from_str(&current)
        .map_err(|error| AuthError::Store(format!("invalid '{TOKEN_KEY}' entry: {error}")))?;

    record.insert(
        "access_token".to_string(),
        Value::String(token.access_token.expose_secret().to_string()),
    );
    record.insert(
        "refresh_token".to_string(),
        Value::String(token.refresh_token.expose_secret().to_string()),
    );
    record.insert("expires_at".to_string(), Value::String(token.expires_at.to_string()));

    let value = Value::Object(record).to_string();

    transaction
        .execute("UPDATE auth_kv SET value = ?1 WHERE key = ?2", params![value, TOKEN_KEY])
        .map_err(store_error)?;

    transaction.commit().map_err(store_error)
}

fn store_error(error: rusqlite::Error) -> AuthError {
    AuthError::Store(error.to_string())
}

/// In-memory store standing in for the SQLite database in tests.
#[cfg(test)]
pub(crate) mod memory {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    pub(crate) struct MemoryCredentialStore {
        state: Mutex<StoredCredential>,
        saves: AtomicUsize,
    }

    impl MemoryCredentialStore {
        pub fn new(access_token: &str, expires_at: Timestamp) -> Self {
            Self {
                state: Mutex::new(StoredCredential {
                    token: StoredToken {
                        access_token: SecretString::from(access_token),
                        refresh_token: SecretString::from("refresh-0"),
                        expires_at,
                    },
                    registration: ClientRegistration {
                        client_id: "client".to_string(),
                        client_secret: SecretString::from("secret"),
                        client_secret_expires_at: None,
                    },
                    profile_arn: Some("arn:aws:codewhisperer:us-east-1:123456789012:profile/TEST".to_string()),
                }),
                saves: AtomicUsize::new(0),
            }
        }

        /// Simulates another process rotating the token.
        pub fn rotate(&self, access_token: &str, expires_at: Timestamp) {
            let mut state = self.state.lock().unwrap();
            state.token.access_token = SecretString::from(access_token);
            state.token.expires_at = expires_at;
        }

        pub fn expire_registration(&self, at: Timestamp) {
            self.state.lock().unwrap().registration.client_secret_expires_at = Some(at);
        }

        pub fn saves(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }

        pub fn access_token(&self) -> String {
            self.state.lock().unwrap().token.access_token.expose_secret().to_string()
        }
    }

    #[async_trait]
    impl CredentialStore for MemoryCredentialStore {
        async fn load(&self) -> Result<StoredCredential, AuthError> {
            Ok(self.state.lock().unwrap().clone())
        }

        async fn save_token(&self, token: &StoredToken) -> Result<(), AuthError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.state.lock().unwrap().token = token.clone();

            Ok(())
        }
    }
}

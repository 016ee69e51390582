use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde_json::{json, Value};

use crate::types::StoredUser;

const ACCESS_TOKEN_KEY: &str = "accessToken";
const USER_KEY: &str = "user";

fn session_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join("session.json")
}

/// Durable store for the bearer access token and the last-known user.
///
/// This is the one piece of cross-component shared mutable state in the
/// client: the REST layer and the realtime manager both read the current
/// token from here on every attempt, and both write it back after a refresh.
///
/// Persistence is best effort. When the data directory is missing or writes
/// fail, operations degrade to the in-memory copy and log a warning; none of
/// the accessors ever return an error to the caller.
#[derive(Debug)]
pub struct TokenStore {
    data_dir: Option<PathBuf>,
    cache: RwLock<Value>,
}

impl TokenStore {
    /// Create a store rooted at `data_dir`, loading any persisted session.
    /// `None` keeps the whole session in memory only.
    pub fn new(data_dir: Option<&Path>) -> Self {
        let cache = match data_dir {
            Some(dir) => Self::read_session_file(dir),
            None => json!({}),
        };
        Self {
            data_dir: data_dir.map(Path::to_path_buf),
            cache: RwLock::new(cache),
        }
    }

    pub fn access_token(&self) -> Option<String> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache[ACCESS_TOKEN_KEY].as_str().map(str::to_owned)
    }

    pub fn set_access_token(&self, token: &str) {
        self.update(|session| {
            session[ACCESS_TOKEN_KEY] = json!(token);
        });
    }

    pub fn user(&self) -> Option<StoredUser> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        serde_json::from_value(cache[USER_KEY].clone()).ok()
    }

    pub fn set_user(&self, user: &StoredUser) {
        let value = match serde_json::to_value(user) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    target: "flechazo_client::token_store",
                    "Could not serialize user for persistence: {}",
                    e
                );
                return;
            }
        };
        self.update(|session| {
            session[USER_KEY] = value;
        });
    }

    /// Drop the whole session, on logout or unrecoverable auth failure.
    pub fn clear(&self) {
        self.update(|session| {
            *session = json!({});
        });
    }

    fn update(&self, mutate: impl FnOnce(&mut Value)) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        mutate(&mut cache);
        if let Some(dir) = &self.data_dir {
            Self::write_session_file(dir, &cache);
        }
    }

    fn read_session_file(data_dir: &Path) -> Value {
        let content = match fs::read_to_string(session_file_path(data_dir)) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::from("{}"),
            Err(e) => {
                tracing::warn!(
                    target: "flechazo_client::token_store",
                    "Could not read session file, starting with an empty session: {}",
                    e
                );
                String::from("{}")
            }
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!(
                target: "flechazo_client::token_store",
                "Session file is not valid JSON, starting with an empty session: {}",
                e
            );
            json!({})
        })
    }

    fn write_session_file(data_dir: &Path, session: &Value) {
        let content = match serde_json::to_string_pretty(session) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(
                    target: "flechazo_client::token_store",
                    "Could not serialize session: {}",
                    e
                );
                return;
            }
        };
        if let Err(e) = fs::write(session_file_path(data_dir), content) {
            tracing::warn!(
                target: "flechazo_client::token_store",
                "Could not persist session, keeping it in memory only: {}",
                e
            );
        }
    }
}

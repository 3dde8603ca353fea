//! Interfaces for the external collaborators the core consumes.
//!
//! Accounts, conversations, and retrieval are owned by other services; the
//! gateway only depends on these seams. [`FileUserStore`] is the one concrete
//! implementation shipped here because the `user-manager` CLI needs it —
//! a JSON file with salted SHA-256 password digests, written atomically.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::sha256_hex;

/// One stored account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub password_salt: String,
    pub password_sha256: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub disabled: bool,
    pub created_unix: i64,
}

/// Account storage seam.
pub trait UserStore {
    fn create_user(&self, username: &str, password: &str, admin: bool) -> anyhow::Result<User>;
    fn set_password(&self, username: &str, password: &str) -> anyhow::Result<()>;
    fn set_disabled(&self, username: &str, disabled: bool) -> anyhow::Result<()>;
    fn verify_password(&self, username: &str, password: &str) -> anyhow::Result<bool>;
    fn list_users(&self) -> anyhow::Result<Vec<User>>;
}

/// Conversation persistence seam (owned by the UI service).
pub trait ConversationStore {
    fn append_message(&self, conversation_id: &str, message: &Value) -> anyhow::Result<()>;
    fn load(&self, conversation_id: &str) -> anyhow::Result<Vec<Value>>;
}

/// Text embedding seam (owned by the memory service).
pub trait Embedder {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f64>>;
}

/// Long-term memory seam (owned by the memory service).
pub trait MemoryStore {
    fn upsert(&self, id: &str, text: &str, embedding: &[f64]) -> anyhow::Result<()>;
    fn search(&self, embedding: &[f64], top_k: usize) -> anyhow::Result<Vec<(String, f64)>>;
    fn delete(&self, ids: &[String]) -> anyhow::Result<usize>;
}

/// JSON-file account store used by the `user-manager` CLI.
pub struct FileUserStore {
    path: PathBuf,
}

impl FileUserStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load_all(&self) -> anyhow::Result<HashMap<String, User>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    fn save_all(&self, users: &HashMap<String, User>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let dir = self.path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        use std::io::Write as _;
        tmp.write_all(serde_json::to_string_pretty(users)?.as_bytes())?;
        tmp.persist(&self.path)?;
        Ok(())
    }

    fn digest(salt: &str, password: &str) -> String {
        sha256_hex(&format!("{salt}:{password}"))
    }
}

impl UserStore for FileUserStore {
    fn create_user(&self, username: &str, password: &str, admin: bool) -> anyhow::Result<User> {
        let username = username.trim();
        anyhow::ensure!(!username.is_empty(), "username required");
        anyhow::ensure!(!password.is_empty(), "password required");

        let mut users = self.load_all()?;
        anyhow::ensure!(!users.contains_key(username), "user {username} already exists");

        let salt = hex::encode(rand::random::<[u8; 16]>());
        let user = User {
            id: crate::ids::new_id("user"),
            username: username.to_string(),
            password_sha256: Self::digest(&salt, password),
            password_salt: salt,
            admin,
            disabled: false,
            created_unix: crate::ids::now_unix(),
        };
        users.insert(username.to_string(), user.clone());
        self.save_all(&users)?;
        Ok(user)
    }

    fn set_password(&self, username: &str, password: &str) -> anyhow::Result<()> {
        anyhow::ensure!(!password.is_empty(), "password required");
        let mut users = self.load_all()?;
        let user = users
            .get_mut(username)
            .ok_or_else(|| anyhow::anyhow!("no such user: {username}"))?;
        user.password_salt = hex::encode(rand::random::<[u8; 16]>());
        user.password_sha256 = Self::digest(&user.password_salt, password);
        self.save_all(&users)
    }

    fn set_disabled(&self, username: &str, disabled: bool) -> anyhow::Result<()> {
        let mut users = self.load_all()?;
        let user = users
            .get_mut(username)
            .ok_or_else(|| anyhow::anyhow!("no such user: {username}"))?;
        user.disabled = disabled;
        self.save_all(&users)
    }

    fn verify_password(&self, username: &str, password: &str) -> anyhow::Result<bool> {
        let users = self.load_all()?;
        let Some(user) = users.get(username) else { return Ok(false) };
        if user.disabled {
            return Ok(false);
        }
        Ok(Self::digest(&user.password_salt, password) == user.password_sha256)
    }

    fn list_users(&self) -> anyhow::Result<Vec<User>> {
        let mut users: Vec<User> = self.load_all()?.into_values().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }
}

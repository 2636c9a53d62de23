// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
//! Authentication and authorization backends.
//!
//! A user's authorization is a single topic filter (its "rights"), evaluated
//! with [`crate::topic::matches`] for both publish and subscribe.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::{PoisonError, RwLock};
use tracing::{trace, warn};

/// Rights granting every topic except `$` topics.
pub const ALL_RIGHTS: &str = "#";

/// Credential and rights lookup consumed by the session.
pub trait Auth: Send + Sync {
    /// Checks the CONNECT credentials.
    fn authenticate(&self, username: &str, password: &[u8]) -> bool;

    /// Topic filter the user may publish and subscribe to. Empty denies all.
    fn rights(&self, username: &str) -> String;

    fn user_exists(&self, username: &str) -> bool;

    /// Creates the user, or replaces its password.
    fn add_or_update_user(&self, username: &str, password: &str) -> Result<()>;

    fn set_rights(&self, username: &str, rights: &str) -> Result<()>;

    /// Users belong to at most one group.
    fn set_group(&self, username: &str, group: &str) -> Result<()>;

    fn group(&self, username: &str) -> Option<String>;
}

/// Returns true if the rights pattern allows `topic`.
pub fn is_authorized(rights: &str, topic: &str) -> bool {
    !rights.is_empty() && crate::topic::matches(rights, topic)
}

/// Backend for open brokers: everyone authenticates and gets [`ALL_RIGHTS`].
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Auth for AllowAll {
    fn authenticate(&self, _username: &str, _password: &[u8]) -> bool {
        true
    }

    fn rights(&self, _username: &str) -> String {
        ALL_RIGHTS.to_string()
    }

    fn user_exists(&self, _username: &str) -> bool {
        true
    }

    fn add_or_update_user(&self, _username: &str, _password: &str) -> Result<()> {
        Ok(())
    }

    fn set_rights(&self, _username: &str, _rights: &str) -> Result<()> {
        Ok(())
    }

    fn set_group(&self, _username: &str, _group: &str) -> Result<()> {
        Ok(())
    }

    fn group(&self, _username: &str) -> Option<String> {
        None
    }
}

/// User entry of the JSON users file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub name: String,
    /// hex SHA256 of `salt` followed by the password
    pub digest: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub salt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Topic filter, empty denies everything
    #[serde(default)]
    pub rights: String,
}

/// Root structure of the JSON users file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsersConfig {
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

/// Users file backed authentication
#[derive(Debug, Default)]
pub struct Security {
    users: RwLock<HashMap<String, UserEntry>>,
}

impl Security {
    /// Create a new empty Security instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Load users from a JSON file. `//` and `/* */` comments are allowed.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json_content = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read {}: {e}", path.display()))?;
        Self::from_json_str(&json_content)
    }

    /// Parses the users file format. The input is JSON5, so comments and
    /// trailing commas are accepted.
    pub fn from_json_str(json_content: &str) -> Result<Self> {
        let config: UsersConfig = json5::from_str(json_content)?;

        let mut users = HashMap::new();
        for entry in config.users {
            if !Self::is_valid_user_name(&entry.name) {
                return Err(anyhow!("Invalid username: {}", entry.name));
            }
            if entry.salt.is_empty() {
                warn!("User {} has no salt specified", entry.name);
            }
            if users.contains_key(&entry.name) {
                return Err(anyhow!("Duplicate user: {}", entry.name));
            }
            users.insert(entry.name.clone(), entry);
        }

        Ok(Self {
            users: RwLock::new(users),
        })
    }

    /// Write every user back as JSON, sorted by name.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut users: Vec<UserEntry> = self
            .users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));

        let writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer_pretty(writer, &UsersConfig { users })?;
        Ok(())
    }

    /// Validate user name (must be non empty and free of wildcards)
    pub fn is_valid_user_name(name: &str) -> bool {
        !name.is_empty() && !name.contains(|c: char| c == '+' || c == '#' || c == '/')
    }

    /// Calculate SHA256 hash
    pub fn sha256hash(message: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(message.as_bytes());
        let result = hasher.finalize();
        hex::encode(result)
    }

    fn update_user<F>(&self, username: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut UserEntry),
    {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        let entry = users
            .get_mut(username)
            .ok_or_else(|| anyhow!("Unknown user: {username}"))?;
        f(entry);
        Ok(())
    }
}

impl Auth for Security {
    fn authenticate(&self, username: &str, password: &[u8]) -> bool {
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = users.get(username) else {
            trace!("unknown user {username}");
            return false;
        };
        let Ok(password) = std::str::from_utf8(password) else {
            return false;
        };
        let hash = Self::sha256hash(&format!("{}{password}", entry.salt));
        entry.digest.eq_ignore_ascii_case(&hash)
    }

    fn rights(&self, username: &str) -> String {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(username)
            .map(|entry| entry.rights.clone())
            .unwrap_or_default()
    }

    fn user_exists(&self, username: &str) -> bool {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(username)
    }

    fn add_or_update_user(&self, username: &str, password: &str) -> Result<()> {
        if !Self::is_valid_user_name(username) {
            return Err(anyhow!("Invalid username: {username}"));
        }
        let salt = uuid::Uuid::new_v4().simple().to_string();
        let digest = Self::sha256hash(&format!("{salt}{password}"));

        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        users
            .entry(username.to_string())
            .and_modify(|entry| {
                entry.salt = salt.clone();
                entry.digest = digest.clone();
            })
            .or_insert_with(|| UserEntry {
                name: username.to_string(),
                digest: digest.clone(),
                salt: salt.clone(),
                group: None,
                rights: String::new(),
            });
        trace!("user {username} saved");
        Ok(())
    }

    fn set_rights(&self, username: &str, rights: &str) -> Result<()> {
        if !rights.is_empty() && !crate::topic::is_valid_filter(rights) {
            return Err(anyhow!("Invalid rights: {rights}"));
        }
        self.update_user(username, |entry| entry.rights = rights.to_string())
    }

    fn set_group(&self, username: &str, group: &str) -> Result<()> {
        self.update_user(username, |entry| entry.group = Some(group.to_string()))
    }

    fn group(&self, username: &str) -> Option<String> {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(username)
            .and_then(|entry| entry.group.clone())
    }
}

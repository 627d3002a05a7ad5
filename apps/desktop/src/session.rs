//! Signed-in session persisted between runs.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use shared::domain::LocalIdentity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub token: String,
    pub user: LocalIdentity,
}

pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/chat_client/session.json`.
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir()
            .ok_or_else(|| anyhow!("unable to resolve user config dir"))?;
        Ok(base.join("chat_client").join("session.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<StoredSession> {
        let raw = fs::read_to_string(&self.path).with_context(|| {
            format!(
                "no stored session at '{}'; sign in first",
                self.path.display()
            )
        })?;
        let session: StoredSession = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt session file '{}'", self.path.display()))?;
        if session.token.trim().is_empty() || session.user.user_id.is_blank() {
            return Err(anyhow!(
                "stored session at '{}' is incomplete; sign in again",
                self.path.display()
            ));
        }
        Ok(session)
    }

    pub fn save(&self, session: &StoredSession) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create session dir '{}'", parent.display())
            })?;
        }
        let raw = serde_json::to_string_pretty(session)?;
        fs::write(&self.path, raw)
            .with_context(|| format!("failed to write session '{}'", self.path.display()))
    }

    /// Forgets the session. Clearing an absent session is not an error.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to remove session '{}'", self.path.display())),
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;

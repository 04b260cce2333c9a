//! Persisted identity
//!
//! The authenticated identity is the only client state that survives a
//! restart; it lets a new session reconnect without asking the user to log
//! in again. Everything else rehydrates over REST.
//!
//! Writes go to a `.tmp` sibling first and are renamed into place, so a
//! crash leaves either the previous identity or the new one, never a
//! truncated file.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::ChatResult;
use crate::types::Identity;

#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted identity, if any
    ///
    /// A corrupted file is treated as "logged out" rather than an error.
    pub fn load(&self) -> ChatResult<Option<Identity>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        match serde_json::from_str::<Identity>(&content) {
            Ok(identity) => Ok(Some(identity)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring unreadable identity file");
                Ok(None)
            }
        }
    }

    /// Persist `identity`, replacing any previous one
    pub fn save(&self, identity: &Identity) -> ChatResult<()> {
        let content = serde_json::to_string_pretty(identity)?;
        let temp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.path)?;

        debug!(identity = %identity.id, role = %identity.role, "identity persisted");
        Ok(())
    }

    /// Forget the persisted identity (logout)
    pub fn clear(&self) -> ChatResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

//! Actor resolution for staff connections.
//!
//! Bearer tokens are 32 random bytes, hex encoded. The directory keeps only
//! SHA-256 digests of the tokens it knows about.

use anyhow::{anyhow, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use crate::{Actor, StaffRole, UserId};

/// Resolves a presented credential to the acting staff member.
pub trait AuthResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Result<Option<Actor>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenFileEntry {
    token: String,
    user_id: i64,
    role: StaffRole,
}

#[derive(Default)]
pub struct TokenDirectory {
    actors: RwLock<HashMap<[u8; 32], Actor>>,
}

impl TokenDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `[{"token","user_id","role"}]` from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let directory = Self::new();
        for entry in read_token_file(path)? {
            directory.register(&entry.token, Actor {
                user_id: UserId(entry.user_id),
                role: entry.role,
            })?;
        }
        Ok(directory)
    }

    pub fn register(&self, token: &str, actor: Actor) -> Result<()> {
        let digest = digest_token(token)?;
        self.actors
            .write()
            .map_err(|_| anyhow!("token directory lock poisoned"))?
            .insert(digest, actor);
        Ok(())
    }

    /// Mint a fresh token for `actor` and register it.
    pub fn mint(&self, actor: Actor) -> Result<String> {
        let token = generate_token();
        self.register(&token, actor)?;
        Ok(token)
    }

    pub fn revoke(&self, token: &str) -> Result<bool> {
        let digest = digest_token(token)?;
        Ok(self
            .actors
            .write()
            .map_err(|_| anyhow!("token directory lock poisoned"))?
            .remove(&digest)
            .is_some())
    }

    pub fn len(&self) -> usize {
        self.actors.read().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuthResolver for TokenDirectory {
    fn resolve(&self, token: &str) -> Result<Option<Actor>> {
        let Ok(digest) = digest_token(token) else {
            return Ok(None);
        };
        Ok(self
            .actors
            .read()
            .map_err(|_| anyhow!("token directory lock poisoned"))?
            .get(&digest)
            .copied())
    }
}

/// Mint a token for `actor` and append it to the token file at `path`.
pub fn mint_into_file(path: &Path, actor: Actor) -> Result<String> {
    let mut entries = if path.exists() {
        read_token_file(path)?
    } else {
        Vec::new()
    };
    let token = generate_token();
    entries.push(TokenFileEntry {
        token: token.clone(),
        user_id: actor.user_id.0,
        role: actor.role,
    });
    std::fs::write(path, serde_json::to_vec_pretty(&entries)?)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(token)
}

fn read_token_file(path: &Path) -> Result<Vec<TokenFileEntry>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read token file {}: {}", path.display(), e))?;
    serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid token file {}: {}", path.display(), e))
}

fn generate_token() -> String {
    let mut token = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut token);
    hex::encode(token)
}

fn digest_token(token: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(token.trim())?;
    if bytes.len() != 32 {
        return Err(anyhow!("token must be 32 bytes"));
    }
    Ok(Sha256::digest(&bytes).into())
}

//! Admin key verification
//!
//! Only the SHA-256 digest of the configured secret is kept in memory, and
//! presented keys are compared digest to digest.

use crate::errors::{GameError, GameResult};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Gate for the admin control surface
#[derive(Clone)]
pub struct AdminGuard {
    /// Digest of the configured secret. `None` denies every request.
    secret_digest: Option<[u8; 32]>,
}

impl AdminGuard {
    pub fn new(secret: Option<&str>) -> Self {
        let secret_digest = secret
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(hash_admin_key);
        if secret_digest.is_none() {
            warn!("No admin secret configured; admin routes will deny every request");
        }
        Self { secret_digest }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret_digest.is_some()
    }

    /// Check a presented key. Every failure looks the same to the caller.
    pub fn verify(&self, presented: Option<&str>) -> GameResult<()> {
        let (Some(expected), Some(presented)) = (self.secret_digest, presented) else {
            return Err(GameError::Authorization);
        };
        if hash_admin_key(presented) == expected {
            Ok(())
        } else {
            Err(GameError::Authorization)
        }
    }
}

fn hash_admin_key(key: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_admin_key() {
        let guard = AdminGuard::new(Some("s3cret"));
        assert!(guard.verify(Some("s3cret")).is_ok());
        assert_eq!(guard.verify(Some("s3cre")), Err(GameError::Authorization));
        assert_eq!(guard.verify(None), Err(GameError::Authorization));
    }

    #[test]
    fn test_unset_secret_denies_everything() {
        for guard in [AdminGuard::new(None), AdminGuard::new(Some("  "))] {
            assert!(!guard.is_enabled());
            assert_eq!(guard.verify(Some("")), Err(GameError::Authorization));
            assert_eq!(guard.verify(Some("anything")), Err(GameError::Authorization));
        }
    }
}

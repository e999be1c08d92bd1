//! Player Identity
//!
//! Opaque identifier for a player or dedicated-server account.
//! All per-identity caches in the auth layer key off this type.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque, comparable, hashable account identifier (16 bytes).
///
/// Implements Ord for deterministic map ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Identity(pub [u8; 16]);

impl Identity {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Derive a deterministic identity from a provider subject string.
    ///
    /// Uses SHA-256 under a fixed prefix so the same subject always maps
    /// to the same identity and different subjects never collide in practice.
    pub fn from_subject(subject: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"warden-identity:");
        hasher.update(subject.as_bytes());
        let hash = hasher.finalize();

        let mut id = [0u8; 16];
        id.copy_from_slice(&hash[..16]);
        Self(id)
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Short hex form for logging.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_derivation_is_deterministic() {
        let a = Identity::from_subject("user123");
        let b = Identity::from_subject("user123");
        assert_eq!(a, b);

        let c = Identity::from_subject("user456");
        assert_ne!(a, c);
    }

    #[test]
    fn test_display_is_full_hex() {
        let id = Identity::new([0xAB; 16]);
        assert_eq!(id.to_string(), "ab".repeat(16));
        assert_eq!(id.short(), "abababab");
    }
}

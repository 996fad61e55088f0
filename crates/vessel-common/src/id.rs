//! Container and scope identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{VesselError, VesselResult};

/// A validated container ID.
///
/// Container IDs must:
/// - Be 1-64 characters long
/// - Contain only alphanumeric characters, hyphens, and underscores
/// - Start with an alphanumeric character
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Maximum length of a container ID.
    pub const MAX_LENGTH: usize = 64;

    /// Length of the truncated form used in aliases and lookups.
    pub const SHORT_LENGTH: usize = 12;

    /// Create a new container ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID format is invalid.
    pub fn new(id: impl Into<String>) -> VesselResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Generate a new random container ID.
    ///
    /// The ID is a 32-character hex string derived from a UUID v4.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self(hex::encode(uuid.as_bytes()))
    }

    /// Get the container ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> VesselResult<()> {
        let invalid = || VesselError::InvalidContainerId { id: id.to_string() };

        if id.is_empty() || id.len() > Self::MAX_LENGTH {
            return Err(invalid());
        }

        if !id.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid());
        }

        Ok(())
    }

    /// Returns a short version of the ID (first 12 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        if self.0.len() <= Self::SHORT_LENGTH {
            &self.0
        } else {
            &self.0[..Self::SHORT_LENGTH]
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerId {
    type Err = VesselError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque identity of a network scope.
///
/// Stable across restarts: it is persisted with the scope record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(uuid::Uuid);

impl ScopeId {
    /// Generate a fresh random scope ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Whether the textual form of this ID starts with `prefix`.
    #[must_use]
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.to_string().starts_with(prefix)
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ScopeId {
    type Err = VesselError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| VesselError::invalid_config(format!("invalid scope id {}: {}", s, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_container_ids() {
        assert!(ContainerId::new("abc123").is_ok());
        assert!(ContainerId::new("my-container").is_ok());
        assert!(ContainerId::new("my_container").is_ok());
        assert!(ContainerId::new("Container-123_test").is_ok());
    }

    #[test]
    fn invalid_container_ids() {
        assert!(ContainerId::new("").is_err());
        assert!(ContainerId::new("-invalid").is_err());
        assert!(ContainerId::new("_invalid").is_err());
        assert!(ContainerId::new("invalid!").is_err());
        assert!(ContainerId::new("a".repeat(65)).is_err());
    }

    #[test]
    fn generate_container_id() {
        let id1 = ContainerId::generate();
        let id2 = ContainerId::generate();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), 32);
        assert_eq!(id1.short().len(), ContainerId::SHORT_LENGTH);
        assert!(id1.as_str().starts_with(id1.short()));
    }

    #[test]
    fn short_id_of_short_name() {
        let id = ContainerId::new("c1").unwrap();
        assert_eq!(id.short(), "c1");
    }

    #[test]
    fn scope_id_prefix() {
        let id = ScopeId::generate();
        let text = id.to_string();
        assert!(id.has_prefix(&text[..8]));
        assert!(!id.has_prefix("not-a-uuid"));
        assert_eq!(text.parse::<ScopeId>().unwrap(), id);
    }
}

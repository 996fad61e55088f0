//! Common error types for the Vessel network control plane.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`VesselError`].
pub type VesselResult<T> = Result<T, VesselError>;

/// Why a bridge link address operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrErrorKind {
    /// The address is already assigned to the link.
    Exists,
    /// The address is not assigned to the link.
    NotAvailable,
    /// Any other failure.
    Other,
}

/// Coarse classification of a [`VesselError`].
///
/// Callers match on this instead of on message text.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Duplicate,
    OverlappingAllocation,
    OutOfRange,
    ExhaustedPool,
    InvalidConfig,
    PolicyViolation,
    StateConflict,
    Persistence,
    KeyNotFound,
    Cancelled,
    LinkAddress,
    Io,
    Serialization,
    Internal,
}

/// Errors across the Vessel crates.
#[derive(Error, Diagnostic, Debug)]
pub enum VesselError {
    /// A scope, container or endpoint is not registered.
    #[error("{resource} not found")]
    #[diagnostic(code(vessel::not_found))]
    NotFound {
        /// What was looked up.
        resource: String,
    },

    /// A scope name, container membership or port is already taken.
    #[error("{resource} already exists")]
    #[diagnostic(code(vessel::duplicate))]
    Duplicate {
        /// The conflicting resource.
        resource: String,
    },

    /// A reservation overlaps an existing reservation.
    #[error("{message}")]
    #[diagnostic(
        code(vessel::ipam::overlap),
        help("Pick a subnet or address that is not used by another network")
    )]
    OverlappingAllocation {
        /// Description of the overlap.
        message: String,
    },

    /// An address or range lies outside the space it was requested from.
    #[error("{message}")]
    #[diagnostic(code(vessel::ipam::out_of_range))]
    OutOfRange {
        /// Description of the violated bound.
        message: String,
    },

    /// No free address space of the requested size is left.
    #[error("{message}")]
    #[diagnostic(
        code(vessel::ipam::exhausted),
        help("Delete unused networks or widen the bridge address range")
    )]
    ExhaustedPool {
        /// Description of the request that could not be satisfied.
        message: String,
    },

    /// Malformed or inconsistent configuration or request.
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(vessel::config))]
    InvalidConfig {
        /// The error message.
        message: String,
    },

    /// The request is well formed but forbidden by network policy.
    #[error("Policy violation: {message}")]
    #[diagnostic(code(vessel::policy))]
    PolicyViolation {
        /// The error message.
        message: String,
    },

    /// The request conflicts with the current state of the resource.
    #[error("{message}")]
    #[diagnostic(code(vessel::state_conflict))]
    StateConflict {
        /// The error message.
        message: String,
    },

    /// The key-value backend failed.
    #[error("Persistence error: {message}")]
    #[diagnostic(code(vessel::kv::persistence))]
    Persistence {
        /// The error message.
        message: String,
    },

    /// A key is absent from the key-value store.
    #[error("key not found: {key}")]
    #[diagnostic(code(vessel::kv::key_not_found))]
    KeyNotFound {
        /// The missing key.
        key: String,
    },

    /// An operation was cancelled at a suspension point.
    #[error("{operation} cancelled")]
    #[diagnostic(code(vessel::cancelled))]
    Cancelled {
        /// The cancelled operation.
        operation: String,
    },

    /// Adding or removing an address on the bridge link failed.
    #[error("Bridge link address error: {message}")]
    #[diagnostic(
        code(vessel::link),
        help("Managing bridge addresses usually requires CAP_NET_ADMIN")
    )]
    LinkAddress {
        /// Classification used to tolerate benign failures.
        kind: AddrErrorKind,
        /// The error message.
        message: String,
    },

    /// Invalid container ID format.
    #[error("Invalid container ID: {id}")]
    #[diagnostic(
        code(vessel::container::invalid_id),
        help("Container IDs must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidContainerId {
        /// The invalid container ID.
        id: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(vessel::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(vessel::serialization))]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(vessel::internal),
        help("This is a bug, please report it at https://github.com/fishmindlabs360/vessel/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl VesselError {
    /// Shorthand for [`VesselError::NotFound`].
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Shorthand for [`VesselError::Duplicate`].
    pub fn duplicate(resource: impl Into<String>) -> Self {
        Self::Duplicate {
            resource: resource.into(),
        }
    }

    /// Shorthand for [`VesselError::InvalidConfig`].
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Shorthand for [`VesselError::PolicyViolation`].
    pub fn policy(message: impl Into<String>) -> Self {
        Self::PolicyViolation {
            message: message.into(),
        }
    }

    /// Shorthand for [`VesselError::StateConflict`].
    pub fn state_conflict(message: impl Into<String>) -> Self {
        Self::StateConflict {
            message: message.into(),
        }
    }

    /// Shorthand for [`VesselError::Persistence`].
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Shorthand for [`VesselError::Cancelled`].
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// The coarse kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Duplicate { .. } => ErrorKind::Duplicate,
            Self::OverlappingAllocation { .. } => ErrorKind::OverlappingAllocation,
            Self::OutOfRange { .. } => ErrorKind::OutOfRange,
            Self::ExhaustedPool { .. } => ErrorKind::ExhaustedPool,
            Self::InvalidConfig { .. } | Self::InvalidContainerId { .. } => {
                ErrorKind::InvalidConfig
            }
            Self::PolicyViolation { .. } => ErrorKind::PolicyViolation,
            Self::StateConflict { .. } => ErrorKind::StateConflict,
            Self::Persistence { .. } => ErrorKind::Persistence,
            Self::KeyNotFound { .. } => ErrorKind::KeyNotFound,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::LinkAddress { .. } => ErrorKind::LinkAddress,
            Self::Io(_) => ErrorKind::Io,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether this is a registry miss or a missing kv key.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::KeyNotFound { .. })
    }
}

impl From<serde_json::Error> for VesselError {
    fn from(err: serde_json::Error) -> Self {
        VesselError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for VesselError {
    fn from(err: toml::de::Error) -> Self {
        VesselError::InvalidConfig {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = VesselError::duplicate("scope bridge1");
        assert_eq!(err.to_string(), "scope bridge1 already exists");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: VesselError = io_err.into();
        assert!(matches!(err, VesselError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn not_found_covers_missing_keys() {
        assert!(VesselError::not_found("scope x").is_not_found());
        assert!(
            VesselError::KeyNotFound {
                key: "context.scopes.x".to_string()
            }
            .is_not_found()
        );
        assert!(!VesselError::policy("nope").is_not_found());
    }
}

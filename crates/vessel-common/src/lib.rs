//! # vessel-common
//!
//! Shared utilities and types for the Vessel network control plane.
//!
//! This crate provides common functionality used across all Vessel crates:
//! - Container and scope identifiers
//! - Standard filesystem paths
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{AddrErrorKind, ErrorKind, VesselError, VesselResult};
pub use id::{ContainerId, ScopeId};
pub use paths::VesselPaths;

//! # vessel
//!
//! Operator CLI for the Vessel network control plane.

#![warn(missing_docs)]

pub mod cli;

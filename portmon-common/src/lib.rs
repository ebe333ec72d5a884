//! Common types and utilities for portmon.
//!
//! This crate provides shared components used by the in-path probe, the
//! userspace monitor and the command line tools.

pub mod metrics;
pub mod types;
pub mod error;

/// Reexport of common types
pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

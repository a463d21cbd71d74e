//! Device-independent building blocks for the p4ctl controller.
//!
//! This crate holds everything the controller daemon needs before it
//! talks to a single device:
//!
//! - [`error`]: the error taxonomy (config, session, install)
//! - [`types`]: the core data model (identities, election ids, entries)
//! - [`pipeline`]: the pipeline descriptor adapter
//! - [`rules`]: the declarative rule loader and resolver
//!
//! Everything here is constructed once at startup and shared
//! read-only across session tasks; no device I/O happens in this
//! crate.

pub mod error;
pub mod pipeline;
pub mod rules;
pub mod types;

// Re-export commonly used items at crate root
pub use error::{ConfigError, ConfigResult, InstallError, InstallReason, SessionError};
pub use pipeline::PipelineDescriptor;
pub use types::{DeviceIdentity, ElectionId, MatchKind, MatchValue, Role, RuleBatch, TableEntry};

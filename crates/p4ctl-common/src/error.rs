//! Error types for the p4ctl controller.
//!
//! Three families, matching how far an error reaches:
//!
//! - [`ConfigError`]: bad descriptor/rule/inventory files, detected
//!   before any device is contacted. Fatal to the whole run.
//! - [`SessionError`]: device-scoped failures. Degrade that device
//!   only; sibling devices continue.
//! - [`InstallError`]: one table entry rejected. Accumulated per
//!   entry, never fatal to the rest of the batch.
//!
//! All errors implement `std::error::Error` via `thiserror`.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for configuration-stage operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading and validating startup artifacts.
///
/// Any of these aborts the run before a single device is contacted.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a file from disk.
    #[error("Failed to read '{path}': {source}")]
    Io {
        /// The path that could not be read.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// A descriptor, rule, or inventory file failed to deserialize.
    #[error("Failed to parse '{path}': {message}")]
    Parse {
        /// The file that failed to parse.
        path: PathBuf,
        /// Deserializer error message.
        message: String,
    },

    /// A symbolic name in a rule did not resolve against the
    /// pipeline descriptor, or a value did not fit its field.
    #[error("Failed to resolve '{field}': {message}")]
    Resolution {
        /// The table, action, field, or parameter name at fault.
        field: String,
        /// What went wrong.
        message: String,
    },

    /// A prerequisite artifact (compiled program, descriptor) is
    /// missing from disk.
    #[error("Missing prerequisite artifact '{path}' (run the pipeline compiler first)")]
    MissingArtifact {
        /// The expected path.
        path: PathBuf,
    },

    /// The configured queue-depth threshold does not fit the field
    /// it programs.
    #[error("Threshold {value} out of range (max {max})")]
    ThresholdRange {
        /// The configured value.
        value: u64,
        /// The largest representable value.
        max: u64,
    },
}

impl ConfigError {
    /// Creates a parse error.
    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a resolution error.
    pub fn resolution(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resolution {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Device-scoped failures during the session lifecycle.
///
/// Every variant names the device so the final summary can report
/// the degraded set without extra bookkeeping.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The control channel could not be opened.
    #[error("Device '{device}' unreachable: {message}")]
    Connection {
        /// Device name.
        device: String,
        /// Transport-level detail.
        message: String,
    },

    /// No valid arbitration response arrived.
    #[error("Arbitration with '{device}' failed: {message}")]
    Arbitration {
        /// Device name.
        device: String,
        /// What went wrong.
        message: String,
    },

    /// A write was attempted while the session is not PRIMARY.
    /// Raised locally, without contacting the device.
    #[error("Session for '{device}' is not primary; refusing to write")]
    NotPrimary {
        /// Device name.
        device: String,
    },

    /// The device rejected the forwarding pipeline push.
    #[error("Pipeline push to '{device}' failed: {message}")]
    Pipeline {
        /// Device name.
        device: String,
        /// Rejection detail.
        message: String,
    },

    /// The underlying RPC channel failed mid-operation.
    #[error("Transport failure on '{device}': {message}")]
    Transport {
        /// Device name.
        device: String,
        /// Transport-level detail.
        message: String,
    },

    /// The session was already closed.
    #[error("Session for '{device}' is closed")]
    Closed {
        /// Device name.
        device: String,
    },
}

impl SessionError {
    /// Creates a connection error.
    pub fn connection(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Creates an arbitration error.
    pub fn arbitration(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Arbitration {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Creates a transport error.
    pub fn transport(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Returns the device this error is scoped to.
    pub fn device(&self) -> &str {
        match self {
            SessionError::Connection { device, .. }
            | SessionError::Arbitration { device, .. }
            | SessionError::NotPrimary { device }
            | SessionError::Pipeline { device, .. }
            | SessionError::Transport { device, .. }
            | SessionError::Closed { device } => device,
        }
    }
}

/// One table entry rejected by the device.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Table '{table}' rejected entry ({reason}): {message}")]
pub struct InstallError {
    /// Symbolic name of the table the entry targeted.
    pub table: String,
    /// Rejection category.
    pub reason: InstallReason,
    /// Device-provided detail.
    pub message: String,
}

impl InstallError {
    /// Creates an install error.
    pub fn new(
        table: impl Into<String>,
        reason: InstallReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            reason,
            message: message.into(),
        }
    }
}

/// Why the device rejected an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallReason {
    /// A keyed entry with the same match key already exists.
    Duplicate,
    /// The entry references an unknown table, action, or field id.
    BadReference,
    /// The table is full.
    ResourceExhausted,
    /// Anything else the device reported.
    Other,
}

impl InstallReason {
    /// Returns the reason as a short string for logs and summaries.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallReason::Duplicate => "duplicate",
            InstallReason::BadReference => "bad-reference",
            InstallReason::ResourceExhausted => "resource-exhausted",
            InstallReason::Other => "other",
        }
    }
}

impl std::fmt::Display for InstallReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

//! Core data model for the p4ctl controller.
//!
//! These types are built once at startup and shared read-only across
//! all session tasks; the only mutable lifecycle state lives inside
//! each session.

use serde::{Deserialize, Serialize};

/// Identity of one forwarding device.
///
/// Immutable once a session is created for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Human-readable name (e.g., "s1").
    pub name: String,
    /// Control-channel address (e.g., "127.0.0.1:50051").
    pub address: String,
    /// Numeric device id known to the remote runtime.
    pub device_id: u64,
}

impl DeviceIdentity {
    /// Creates a new device identity.
    pub fn new(name: impl Into<String>, address: impl Into<String>, device_id: u64) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            device_id,
        }
    }
}

/// Mastership election identifier.
///
/// An opaque 128-bit value; higher values win arbitration. The derive
/// order makes `high` the most significant word.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ElectionId {
    /// Most significant 64 bits.
    pub high: u64,
    /// Least significant 64 bits.
    pub low: u64,
}

impl ElectionId {
    /// Creates a new election id.
    pub fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }
}

impl std::fmt::Display for ElectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.high, self.low)
    }
}

/// Mastership role of one session, written only by the arbitration
/// path of the owning session task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This controller holds write authority for the device.
    Primary,
    /// Another controller holds a higher election id.
    Backup,
    /// No arbitration response observed yet.
    Unknown,
}

impl Role {
    /// Returns the role as a string for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Backup => "backup",
            Role::Unknown => "unknown",
        }
    }
}

/// Match kind of one table key field, fixed by the pipeline
/// descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    /// Exact byte match; no priority.
    Exact,
    /// Longest-prefix match; priority breaks ties.
    Lpm,
    /// Value-and-mask match; priority breaks ties.
    Ternary,
}

impl MatchKind {
    /// Returns the kind as a string for logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Exact => "exact",
            MatchKind::Lpm => "lpm",
            MatchKind::Ternary => "ternary",
        }
    }

    /// Whether entries of this kind require a priority.
    pub fn requires_priority(&self) -> bool {
        !matches!(self, MatchKind::Exact)
    }
}

/// One concrete match-key field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MatchValue {
    /// Exact bytes.
    Exact {
        /// Field value.
        value: Vec<u8>,
    },
    /// Prefix value and length.
    Lpm {
        /// Field value.
        value: Vec<u8>,
        /// Prefix length in bits.
        prefix_len: u8,
    },
    /// Value and mask.
    Ternary {
        /// Field value.
        value: Vec<u8>,
        /// Bit mask; set bits participate in the match.
        mask: Vec<u8>,
    },
}

impl MatchValue {
    /// Returns the match kind this value encodes.
    pub fn kind(&self) -> MatchKind {
        match self {
            MatchValue::Exact { .. } => MatchKind::Exact,
            MatchValue::Lpm { .. } => MatchKind::Lpm,
            MatchValue::Ternary { .. } => MatchKind::Ternary,
        }
    }
}

/// One resolved table entry, ready to send to a device.
///
/// `is_default = true` configures the table's miss action: it carries
/// no match key and installs with insert-or-replace semantics. Keyed
/// entries use pure insert; a duplicate key is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    /// Numeric table id from the descriptor.
    pub table_id: u32,
    /// Symbolic table name, kept for error reporting.
    pub table_name: String,
    /// Match key fields in descriptor-defined order; empty for
    /// default entries.
    pub match_key: Vec<MatchValue>,
    /// Numeric action id from the descriptor.
    pub action_id: u32,
    /// Action parameter values in descriptor-defined order.
    pub action_params: Vec<Vec<u8>>,
    /// Tie-break priority; required for LPM/ternary keyed entries,
    /// absent for exact and default entries.
    pub priority: Option<i32>,
    /// Whether this entry configures the table's miss action.
    pub is_default: bool,
}

impl TableEntry {
    /// Whether this is a keyed entry rather than a default entry.
    pub fn is_keyed(&self) -> bool {
        !self.is_default
    }
}

/// Ordered rule batch for exactly one device.
///
/// Built once by the rule loader, consumed by that device's session.
/// Source order is preserved; the session installs the default
/// entries before the keyed ones.
#[derive(Debug, Clone, Default)]
pub struct RuleBatch {
    /// Destination device name.
    pub device: String,
    /// Entries in source order.
    pub entries: Vec<TableEntry>,
}

impl RuleBatch {
    /// Creates an empty batch for a device.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            entries: Vec::new(),
        }
    }

    /// Number of entries in the batch.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the batch holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Default (miss-action) entries in source order.
    pub fn defaults(&self) -> impl Iterator<Item = &TableEntry> {
        self.entries.iter().filter(|e| e.is_default)
    }

    /// Keyed entries in source order.
    pub fn keyed(&self) -> impl Iterator<Item = &TableEntry> {
        self.entries.iter().filter(|e| e.is_keyed())
    }
}

//! Remote procedure transport seam.
//!
//! The controller never speaks a wire protocol directly; it drives a
//! [`DeviceChannel`] obtained from a [`DeviceTransport`]. Transport
//! failures and application-level rejections are kept distinct so the
//! session layer can map them to the right error family.

use async_trait::async_trait;
use thiserror::Error;

use p4ctl_common::{DeviceIdentity, ElectionId, PipelineDescriptor, TableEntry};

/// Application-level rejection categories, mirroring the status codes
/// a gRPC-based runtime returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    /// Caller does not hold write authority.
    PermissionDenied,
    /// A keyed entry with this match key already exists.
    AlreadyExists,
    /// Referenced object (table, action, device id) is unknown.
    NotFound,
    /// The target table is full.
    ResourceExhausted,
    /// The device is not in a state that allows the call.
    FailedPrecondition,
    /// The request itself is malformed.
    InvalidArgument,
    /// Device-internal failure.
    Internal,
}

impl RejectCode {
    /// Returns the code as a short string for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectCode::PermissionDenied => "permission-denied",
            RejectCode::AlreadyExists => "already-exists",
            RejectCode::NotFound => "not-found",
            RejectCode::ResourceExhausted => "resource-exhausted",
            RejectCode::FailedPrecondition => "failed-precondition",
            RejectCode::InvalidArgument => "invalid-argument",
            RejectCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RPC-level failure: either the channel itself broke, or the device
/// understood the request and rejected it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The channel failed before a response arrived.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The device rejected the request.
    #[error("{code}: {message}")]
    Rejected {
        /// Rejection category.
        code: RejectCode,
        /// Device-provided detail.
        message: String,
    },
}

impl RpcError {
    /// Creates a rejection.
    pub fn rejected(code: RejectCode, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
        }
    }
}

/// One arbitration message from the device: the highest election id
/// it currently recognizes as primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbitrationUpdate {
    /// Election id of the current primary.
    pub primary_election_id: ElectionId,
}

/// Factory for control channels to forwarding devices.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Opens a control channel to the device. The address must be
    /// reachable and the device id known to the remote side.
    async fn open(&self, identity: &DeviceIdentity) -> Result<Box<dyn DeviceChannel>, RpcError>;
}

/// One open control channel, owned exclusively by a single session
/// task.
#[async_trait]
pub trait DeviceChannel: Send + std::fmt::Debug {
    /// Sends a mastership claim and returns the device's first
    /// arbitration response.
    async fn arbitrate(&mut self, election_id: ElectionId) -> Result<ArbitrationUpdate, RpcError>;

    /// Waits for the next unsolicited arbitration update (another
    /// controller claiming mastership). Returns `None` when the
    /// stream closes cleanly.
    async fn recv_arbitration(&mut self) -> Result<Option<ArbitrationUpdate>, RpcError>;

    /// Installs the compiled forwarding program and its descriptor.
    /// Atomic from the controller's point of view.
    async fn set_pipeline(
        &mut self,
        descriptor: &PipelineDescriptor,
        artifact: &[u8],
    ) -> Result<(), RpcError>;

    /// Writes one table entry. Default entries modify-or-insert;
    /// keyed entries insert only.
    async fn write_entry(&mut self, entry: &TableEntry) -> Result<(), RpcError>;

    /// Releases the channel.
    async fn close(&mut self) -> Result<(), RpcError>;
}

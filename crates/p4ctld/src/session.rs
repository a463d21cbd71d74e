//! Device session: one authoritative control connection to one
//! forwarding device.
//!
//! The session owns its channel exclusively and sequences every
//! protocol step against the device: arbitration, pipeline push, and
//! entry installation. All waits on the device are bounded by the
//! configured request timeout. A session that is not PRIMARY refuses
//! writes locally, without contacting the device.

use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use p4ctl_common::{
    DeviceIdentity, ElectionId, InstallError, InstallReason, PipelineDescriptor, Role, RuleBatch,
    SessionError, TableEntry,
};

use crate::diag::DiagLog;
use crate::transport::{DeviceChannel, DeviceTransport, RejectCode, RpcError};

/// Default bound on each individual device wait.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure of a single entry write.
#[derive(Debug)]
pub enum WriteError {
    /// The session itself is unusable (closed, not primary, channel
    /// broken). Aborts the batch.
    Session(SessionError),
    /// The device rejected this entry only. The batch continues.
    Entry(InstallError),
}

/// Outcome of installing one device's batch. Failures are
/// accumulated so the caller sees the complete picture in one pass.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Device the batch targeted.
    pub device: String,
    /// Entries accepted by the device.
    pub installed: usize,
    /// Entries the device rejected, in install order.
    pub failures: Vec<InstallError>,
}

impl BatchReport {
    /// Whether every entry was accepted.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// One control session. All operations are serialized through the
/// owning task; the connection handle is never shared.
#[derive(Debug)]
pub struct DeviceSession {
    identity: DeviceIdentity,
    channel: Option<Box<dyn DeviceChannel>>,
    role: Role,
    proposed_election_id: Option<ElectionId>,
    observed_election_id: Option<ElectionId>,
    request_timeout: Duration,
    diag: Option<DiagLog>,
}

fn note(diag: &mut Option<DiagLog>, direction: &str, message: &str) {
    if let Some(log) = diag.as_mut() {
        log.record(direction, message);
    }
}

impl DeviceSession {
    /// Opens the control channel to a device.
    pub async fn connect(
        transport: &dyn DeviceTransport,
        identity: DeviceIdentity,
        request_timeout: Duration,
        mut diag: Option<DiagLog>,
    ) -> Result<Self, SessionError> {
        note(&mut diag, ">>", &format!("open address={}", identity.address));
        let channel = match timeout(request_timeout, transport.open(&identity)).await {
            Err(_) => {
                return Err(SessionError::connection(&identity.name, "connect timed out"));
            }
            Ok(Err(e)) => {
                return Err(SessionError::connection(&identity.name, e.to_string()));
            }
            Ok(Ok(channel)) => channel,
        };
        note(&mut diag, "<<", "open ok");
        debug!(device = %identity.name, address = %identity.address, "Control channel established");

        Ok(Self {
            identity,
            channel: Some(channel),
            role: Role::Unknown,
            proposed_election_id: None,
            observed_election_id: None,
            request_timeout,
            diag,
        })
    }

    /// Device identity this session controls.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Current mastership role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Last election id observed in an arbitration response.
    pub fn observed_election_id(&self) -> Option<ElectionId> {
        self.observed_election_id
    }

    /// Whether the channel is still open.
    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    fn closed_error(&self) -> SessionError {
        SessionError::Closed {
            device: self.identity.name.clone(),
        }
    }

    fn ensure_primary(&self) -> Result<(), SessionError> {
        if self.role == Role::Primary {
            Ok(())
        } else {
            Err(SessionError::NotPrimary {
                device: self.identity.name.clone(),
            })
        }
    }

    /// Sends a mastership claim and blocks (bounded) for the device's
    /// first arbitration response.
    pub async fn arbitrate(&mut self, proposed: ElectionId) -> Result<Role, SessionError> {
        let device = self.identity.name.clone();
        note(&mut self.diag, ">>", &format!("arbitrate election_id={}", proposed));
        let channel = match self.channel.as_mut() {
            Some(channel) => channel,
            None => return Err(SessionError::Closed { device }),
        };

        let update = match timeout(self.request_timeout, channel.arbitrate(proposed)).await {
            Err(_) => {
                return Err(SessionError::arbitration(device, "no arbitration response"));
            }
            Ok(Err(e)) => {
                return Err(SessionError::arbitration(device, e.to_string()));
            }
            Ok(Ok(update)) => update,
        };
        note(
            &mut self.diag,
            "<<",
            &format!("arbitration primary={}", update.primary_election_id),
        );

        self.proposed_election_id = Some(proposed);
        self.observed_election_id = Some(update.primary_election_id);
        self.role = if update.primary_election_id == proposed {
            Role::Primary
        } else {
            Role::Backup
        };
        info!(
            device = %device,
            role = self.role.as_str(),
            primary = %update.primary_election_id,
            "Arbitration settled"
        );
        Ok(self.role)
    }

    /// Pushes the compiled forwarding program and its descriptor.
    ///
    /// Must not be retried after a failure; the device's state is
    /// undefined at that point.
    pub async fn push_pipeline(
        &mut self,
        descriptor: &PipelineDescriptor,
        artifact: &[u8],
    ) -> Result<(), SessionError> {
        self.ensure_primary()?;
        let device = self.identity.name.clone();
        note(
            &mut self.diag,
            ">>",
            &format!("set_pipeline artifact_bytes={}", artifact.len()),
        );
        let channel = match self.channel.as_mut() {
            Some(channel) => channel,
            None => return Err(self.closed_error()),
        };

        let result = match timeout(
            self.request_timeout,
            channel.set_pipeline(descriptor, artifact),
        )
        .await
        {
            Err(_) => Err(SessionError::Pipeline {
                device: device.clone(),
                message: "pipeline push timed out".to_string(),
            }),
            Ok(Err(RpcError::Transport(message))) => {
                Err(SessionError::transport(device.clone(), message))
            }
            Ok(Err(e @ RpcError::Rejected { .. })) => Err(SessionError::Pipeline {
                device: device.clone(),
                message: e.to_string(),
            }),
            Ok(Ok(())) => Ok(()),
        };
        note(
            &mut self.diag,
            "<<",
            match result {
                Ok(()) => "set_pipeline ok",
                Err(_) => "set_pipeline failed",
            },
        );
        if result.is_ok() {
            info!(device = %device, "Forwarding pipeline installed");
        }
        result
    }

    /// Writes one table entry.
    pub async fn install(&mut self, entry: &TableEntry) -> Result<(), WriteError> {
        self.ensure_primary().map_err(WriteError::Session)?;
        let device = self.identity.name.clone();
        note(
            &mut self.diag,
            ">>",
            &format!(
                "write table={} default={} action={}",
                entry.table_name, entry.is_default, entry.action_id
            ),
        );
        let channel = match self.channel.as_mut() {
            Some(channel) => channel,
            None => {
                return Err(WriteError::Session(SessionError::Closed { device }));
            }
        };

        let result = match timeout(self.request_timeout, channel.write_entry(entry)).await {
            Err(_) => Err(WriteError::Session(SessionError::transport(
                device,
                "entry write timed out",
            ))),
            Ok(Err(RpcError::Transport(message))) => {
                Err(WriteError::Session(SessionError::transport(device, message)))
            }
            Ok(Err(RpcError::Rejected { code, message })) => match code {
                RejectCode::PermissionDenied => {
                    Err(WriteError::Session(SessionError::NotPrimary { device }))
                }
                RejectCode::AlreadyExists => Err(WriteError::Entry(InstallError::new(
                    &entry.table_name,
                    InstallReason::Duplicate,
                    message,
                ))),
                RejectCode::NotFound | RejectCode::InvalidArgument => {
                    Err(WriteError::Entry(InstallError::new(
                        &entry.table_name,
                        InstallReason::BadReference,
                        message,
                    )))
                }
                RejectCode::ResourceExhausted => Err(WriteError::Entry(InstallError::new(
                    &entry.table_name,
                    InstallReason::ResourceExhausted,
                    message,
                ))),
                RejectCode::FailedPrecondition | RejectCode::Internal => {
                    Err(WriteError::Entry(InstallError::new(
                        &entry.table_name,
                        InstallReason::Other,
                        message,
                    )))
                }
            },
            Ok(Ok(())) => Ok(()),
        };
        note(
            &mut self.diag,
            "<<",
            match result {
                Ok(()) => "write ok",
                Err(_) => "write failed",
            },
        );
        result
    }

    /// Installs a whole batch: default entries first (in source
    /// order), then keyed entries (in source order). Entry rejections
    /// are accumulated; only session-level failures abort the batch.
    pub async fn install_batch(&mut self, batch: &RuleBatch) -> Result<BatchReport, SessionError> {
        let mut report = BatchReport {
            device: batch.device.clone(),
            ..Default::default()
        };

        let ordered: Vec<&TableEntry> = batch.defaults().chain(batch.keyed()).collect();
        for entry in ordered {
            match self.install(entry).await {
                Ok(()) => report.installed += 1,
                Err(WriteError::Entry(e)) => {
                    warn!(
                        device = %self.identity.name,
                        table = %e.table,
                        reason = %e.reason,
                        "Entry rejected; continuing with remaining entries"
                    );
                    report.failures.push(e);
                }
                Err(WriteError::Session(e)) => return Err(e),
            }
        }

        info!(
            device = %self.identity.name,
            installed = report.installed,
            failed = report.failures.len(),
            "Rule batch installed"
        );
        Ok(report)
    }

    /// Waits for the next unsolicited arbitration update and applies
    /// the role transition. Returns the new role, or `None` when the
    /// stream closed. Unbounded; cancel externally.
    pub async fn next_mastership_change(&mut self) -> Result<Option<Role>, SessionError> {
        let device = self.identity.name.clone();
        let channel = match self.channel.as_mut() {
            Some(channel) => channel,
            None => return Err(self.closed_error()),
        };

        match channel.recv_arbitration().await {
            Err(e) => Err(SessionError::transport(device, e.to_string())),
            Ok(None) => Ok(None),
            Ok(Some(update)) => {
                note(
                    &mut self.diag,
                    "<<",
                    &format!("arbitration primary={}", update.primary_election_id),
                );
                self.observed_election_id = Some(update.primary_election_id);
                if self.role == Role::Primary
                    && Some(update.primary_election_id) != self.proposed_election_id
                {
                    // Another controller won; ownership has changed.
                    // Not retried.
                    warn!(
                        device = %device,
                        primary = %update.primary_election_id,
                        "Mastership lost to a higher election id; now backup"
                    );
                    self.role = Role::Backup;
                }
                Ok(Some(self.role))
            }
        }
    }

    /// Releases the channel. Safe to call repeatedly; subsequent
    /// operations fail with a closed-session error.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        let mut channel = match self.channel.take() {
            Some(channel) => channel,
            None => return Ok(()),
        };
        note(&mut self.diag, ">>", "close");
        let device = self.identity.name.clone();
        match timeout(self.request_timeout, channel.close()).await {
            Err(_) => Err(SessionError::transport(device, "close timed out")),
            Ok(Err(e)) => Err(SessionError::transport(device, e.to_string())),
            Ok(Ok(())) => {
                debug!(device = %self.identity.name, "Session closed");
                Ok(())
            }
        }
    }
}

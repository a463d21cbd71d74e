//! Session pool and lifecycle controller.
//!
//! Drives every device session through the startup sequence with one
//! task per device and a join barrier between stages:
//!
//! ```text
//! INIT -> CONNECTING -> ARBITRATING -> PIPELINE_PUSH -> RULE_INSTALL
//!      -> STEADY_STATE -> SHUTTING_DOWN -> TERMINATED
//! ```
//!
//! A device that fails a stage is marked degraded and excluded from
//! later stages without stopping its siblings. The steady-state wait
//! exists to keep the control channels alive (dropping a channel can
//! make a device fall back to fail-safe forwarding) and is cancelled
//! by the shutdown token.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use p4ctl_common::{
    DeviceIdentity, ElectionId, InstallError, PipelineDescriptor, Role, RuleBatch, SessionError,
};

use crate::diag::DiagLog;
use crate::session::{BatchReport, DeviceSession, DEFAULT_REQUEST_TIMEOUT};
use crate::transport::DeviceTransport;

/// Controller lifecycle stage. Ordering follows the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Artifacts loaded, no device contacted yet.
    Init,
    /// Opening control channels.
    Connecting,
    /// Mastership arbitration settled.
    Arbitrating,
    /// Forwarding pipeline pushed.
    PipelinePush,
    /// Rule batch installed.
    RuleInstall,
    /// Holding mastership, waiting.
    SteadyState,
    /// Closing all sessions.
    ShuttingDown,
    /// All sessions released.
    Terminated,
}

impl Stage {
    /// Returns the stage name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "INIT",
            Stage::Connecting => "CONNECTING",
            Stage::Arbitrating => "ARBITRATING",
            Stage::PipelinePush => "PIPELINE_PUSH",
            Stage::RuleInstall => "RULE_INSTALL",
            Stage::SteadyState => "STEADY_STATE",
            Stage::ShuttingDown => "SHUTTING_DOWN",
            Stage::Terminated => "TERMINATED",
        }
    }
}

/// Final per-device outcome.
#[derive(Debug)]
pub struct DeviceReport {
    /// Device name.
    pub device: String,
    /// Furthest stage the device completed.
    pub stage_reached: Stage,
    /// Mastership role at the end of the run.
    pub role: Role,
    /// Whether RULE_INSTALL finished with every entry accepted.
    pub install_complete: bool,
    /// The error that degraded the device, if any.
    pub degraded: Option<SessionError>,
    /// Entries the device rejected during RULE_INSTALL.
    pub install_failures: Vec<InstallError>,
}

impl DeviceReport {
    fn new(device: String) -> Self {
        Self {
            device,
            stage_reached: Stage::Init,
            role: Role::Unknown,
            install_complete: false,
            degraded: None,
            install_failures: Vec::new(),
        }
    }

    /// Whether this device completed RULE_INSTALL with every entry
    /// accepted. A later demotion to backup does not undo this.
    pub fn completed_install(&self) -> bool {
        self.install_complete && self.degraded.is_none() && self.install_failures.is_empty()
    }

    /// Whether anything went wrong on this device.
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some() || !self.install_failures.is_empty()
    }
}

/// Outcome of one controller run.
#[derive(Debug)]
pub struct RunSummary {
    /// One report per configured device.
    pub devices: Vec<DeviceReport>,
}

impl RunSummary {
    /// Overall success: at least one device completed RULE_INSTALL
    /// cleanly.
    pub fn succeeded(&self) -> bool {
        self.devices.iter().any(|d| d.completed_install())
    }

    /// Devices with a degrading error or rejected entries.
    pub fn degraded(&self) -> impl Iterator<Item = &DeviceReport> {
        self.devices.iter().filter(|d| d.is_degraded())
    }
}

struct Slot {
    session: Option<DeviceSession>,
    report: DeviceReport,
}

/// Owns the device sessions and runs the lifecycle.
pub struct Controller {
    transport: Arc<dyn DeviceTransport>,
    descriptor: Arc<PipelineDescriptor>,
    artifact: Arc<Vec<u8>>,
    devices: Vec<DeviceIdentity>,
    batches: HashMap<String, RuleBatch>,
    election_id: ElectionId,
    request_timeout: Duration,
    log_dir: Option<PathBuf>,
}

impl Controller {
    /// Creates a controller over pre-validated startup artifacts.
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        descriptor: Arc<PipelineDescriptor>,
        artifact: Vec<u8>,
        devices: Vec<DeviceIdentity>,
        batches: HashMap<String, RuleBatch>,
        election_id: ElectionId,
    ) -> Self {
        Self {
            transport,
            descriptor,
            artifact: Arc::new(artifact),
            devices,
            batches,
            election_id,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            log_dir: None,
        }
    }

    /// Sets the bound for each individual device wait.
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Enables per-device diagnostic request logs under a directory.
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    /// Runs the full lifecycle until the shutdown token fires, then
    /// tears everything down and reports per-device outcomes.
    pub async fn run(&self, shutdown: CancellationToken) -> RunSummary {
        let mut slots: Vec<Slot> = self
            .devices
            .iter()
            .map(|d| Slot {
                session: None,
                report: DeviceReport::new(d.name.clone()),
            })
            .collect();

        self.connect_and_arbitrate(&mut slots).await;
        if !shutdown.is_cancelled() {
            self.push_pipelines(&mut slots).await;
        }
        if !shutdown.is_cancelled() {
            self.install_rules(&mut slots).await;
        }

        // Degraded devices keep their session for teardown, so gate on
        // slots that are both open and healthy.
        let any_healthy = slots
            .iter()
            .any(|s| s.session.is_some() && s.report.degraded.is_none());
        if any_healthy && !shutdown.is_cancelled() {
            info!(stage = Stage::SteadyState.as_str(), "Holding mastership; press Ctrl-C to stop");
            self.steady_state(&mut slots, &shutdown).await;
        } else if !any_healthy {
            error!("Every device degraded before steady state; shutting down");
        }

        self.shut_down(&mut slots).await;

        RunSummary {
            devices: slots.into_iter().map(|s| s.report).collect(),
        }
    }

    /// CONNECTING + ARBITRATING, one task per device, joined before
    /// the next stage.
    async fn connect_and_arbitrate(&self, slots: &mut [Slot]) {
        info!(
            stage = Stage::Connecting.as_str(),
            devices = self.devices.len(),
            "Opening control channels and arbitrating mastership"
        );

        let mut tasks: JoinSet<(usize, Result<DeviceSession, SessionError>)> = JoinSet::new();
        for (idx, identity) in self.devices.iter().cloned().enumerate() {
            let transport = Arc::clone(&self.transport);
            let election_id = self.election_id;
            let request_timeout = self.request_timeout;
            let diag = self.open_diag(&identity.name);
            tasks.spawn(async move {
                let mut session = match DeviceSession::connect(
                    transport.as_ref(),
                    identity,
                    request_timeout,
                    diag,
                )
                .await
                {
                    Ok(session) => session,
                    Err(e) => return (idx, Err(e)),
                };
                if let Err(e) = session.arbitrate(election_id).await {
                    // Release the channel; the device must not keep a
                    // half-established session open.
                    let _ = session.close().await;
                    return (idx, Err(e));
                }
                (idx, Ok(session))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, Ok(session))) => {
                    slots[idx].report.role = session.role();
                    slots[idx].report.stage_reached = Stage::Arbitrating;
                    slots[idx].session = Some(session);
                }
                Ok((idx, Err(e))) => {
                    warn!(device = %e.device(), error = %e, "Device degraded during startup");
                    slots[idx].report.stage_reached = Stage::Connecting;
                    slots[idx].report.degraded = Some(e);
                }
                Err(e) => {
                    error!(error = %e, "Session task failed to complete");
                }
            }
        }

        // A panicked task leaves its slot empty; account for it.
        for slot in slots.iter_mut() {
            if slot.session.is_none() && slot.report.degraded.is_none() {
                slot.report.degraded = Some(SessionError::transport(
                    slot.report.device.clone(),
                    "session task did not complete",
                ));
            }
        }
    }

    /// PIPELINE_PUSH for every healthy PRIMARY session.
    async fn push_pipelines(&self, slots: &mut [Slot]) {
        info!(stage = Stage::PipelinePush.as_str(), "Pushing forwarding pipelines");

        let mut tasks: JoinSet<(usize, DeviceSession, Result<(), SessionError>)> = JoinSet::new();
        for (idx, slot) in slots.iter_mut().enumerate() {
            if slot.report.degraded.is_some() {
                continue;
            }
            let Some(session) = slot.session.take() else {
                continue;
            };
            if session.role() != Role::Primary {
                info!(
                    device = %session.identity().name,
                    "Backup for this device; skipping pipeline push"
                );
                slot.session = Some(session);
                continue;
            }

            let descriptor = Arc::clone(&self.descriptor);
            let artifact = Arc::clone(&self.artifact);
            tasks.spawn(async move {
                let mut session = session;
                let result = session.push_pipeline(&descriptor, &artifact).await;
                (idx, session, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, session, Ok(()))) => {
                    slots[idx].report.stage_reached = Stage::PipelinePush;
                    slots[idx].session = Some(session);
                }
                Ok((idx, session, Err(e))) => {
                    warn!(device = %e.device(), error = %e, "Pipeline push failed; device degraded");
                    slots[idx].report.degraded = Some(e);
                    // Keep the session so teardown still closes it.
                    slots[idx].session = Some(session);
                }
                Err(e) => {
                    error!(error = %e, "Pipeline push task failed to complete");
                }
            }
        }
    }

    /// RULE_INSTALL for every device that completed PIPELINE_PUSH.
    async fn install_rules(&self, slots: &mut [Slot]) {
        info!(stage = Stage::RuleInstall.as_str(), "Installing rule batches");

        let mut tasks: JoinSet<(usize, DeviceSession, Result<BatchReport, SessionError>)> =
            JoinSet::new();
        for (idx, slot) in slots.iter_mut().enumerate() {
            if slot.report.degraded.is_some() || slot.report.stage_reached < Stage::PipelinePush {
                continue;
            }
            let Some(session) = slot.session.take() else {
                continue;
            };

            let batch = self
                .batches
                .get(&session.identity().name)
                .cloned()
                .unwrap_or_else(|| RuleBatch::new(session.identity().name.clone()));
            tasks.spawn(async move {
                let mut session = session;
                let result = session.install_batch(&batch).await;
                (idx, session, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, session, Ok(report))) => {
                    slots[idx].report.stage_reached = Stage::RuleInstall;
                    slots[idx].report.install_complete = report.failures.is_empty();
                    slots[idx].report.install_failures = report.failures;
                    slots[idx].session = Some(session);
                }
                Ok((idx, session, Err(e))) => {
                    warn!(device = %e.device(), error = %e, "Batch aborted; device degraded");
                    slots[idx].report.degraded = Some(e);
                    slots[idx].session = Some(session);
                }
                Err(e) => {
                    error!(error = %e, "Install task failed to complete");
                }
            }
        }
    }

    /// STEADY_STATE: hold every open channel until shutdown,
    /// reacting to mastership changes and per-device transport
    /// failures without disturbing other devices.
    async fn steady_state(&self, slots: &mut [Slot], shutdown: &CancellationToken) {
        let mut tasks: JoinSet<(usize, DeviceSession, Role)> = JoinSet::new();
        for (idx, slot) in slots.iter_mut().enumerate() {
            if slot.report.degraded.is_some() {
                continue;
            }
            let Some(session) = slot.session.take() else {
                continue;
            };
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let mut session = session;
                let mut lost = false;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        change = session.next_mastership_change() => match change {
                            Ok(Some(_)) => continue,
                            Ok(None) => {
                                warn!(
                                    device = %session.identity().name,
                                    "Arbitration stream closed by device"
                                );
                                lost = true;
                                break;
                            }
                            Err(e) => {
                                warn!(
                                    device = %session.identity().name,
                                    error = %e,
                                    "Transport failure in steady state; shutting this device down"
                                );
                                lost = true;
                                break;
                            }
                        }
                    }
                }
                // This device only; its siblings keep holding.
                if lost {
                    if let Err(e) = session.close().await {
                        warn!(device = %e.device(), error = %e, "Session close failed");
                    }
                }
                let role = session.role();
                (idx, session, role)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, session, role)) => {
                    slots[idx].report.role = role;
                    slots[idx].session = Some(session);
                }
                Err(e) => {
                    error!(error = %e, "Steady-state task failed to complete");
                }
            }
        }
    }

    /// SHUTTING_DOWN: close every session regardless of its state,
    /// collecting close failures without raising them.
    async fn shut_down(&self, slots: &mut [Slot]) {
        info!(stage = Stage::ShuttingDown.as_str(), "Closing all sessions");
        for slot in slots.iter_mut() {
            if let Some(mut session) = slot.session.take() {
                if let Err(e) = session.close().await {
                    warn!(device = %e.device(), error = %e, "Session close failed");
                }
            }
        }
        info!(stage = Stage::Terminated.as_str(), "All sessions released");
    }

    fn open_diag(&self, device: &str) -> Option<DiagLog> {
        let dir = self.log_dir.as_ref()?;
        match DiagLog::create(dir, device) {
            Ok(log) => Some(log),
            Err(e) => {
                warn!(device = %device, error = %e, "Diagnostic log unavailable; continuing without");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::{EmulatedSwitch, EmulatedTransport};

    const DESCRIPTOR: &str = r#"{
        "tables": [
            {
                "name": "t",
                "id": 1,
                "match_fields": [{"name": "dst", "id": 1, "bits": 32, "match_type": "exact"}]
            }
        ],
        "actions": [
            {"name": "fwd", "id": 10, "params": [{"name": "port", "id": 1, "bits": 9}]}
        ]
    }"#;

    fn controller_for(
        transport: EmulatedTransport,
        devices: Vec<DeviceIdentity>,
    ) -> Controller {
        let descriptor = Arc::new(PipelineDescriptor::from_json(DESCRIPTOR).unwrap());
        Controller::new(
            Arc::new(transport),
            descriptor,
            b"program".to_vec(),
            devices,
            HashMap::new(),
            ElectionId::new(0, 1),
        )
        .with_request_timeout(Duration::from_millis(200))
    }

    fn cancel_after(ms: u64) -> CancellationToken {
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            trigger.cancel();
        });
        shutdown
    }

    #[tokio::test]
    async fn test_run_all_devices_healthy() {
        let transport = EmulatedTransport::new();
        let mut devices = Vec::new();
        for (i, name) in ["s1", "s2", "s3"].iter().enumerate() {
            let address = format!("127.0.0.1:{}", 50051 + i);
            transport.add_switch(address.clone(), EmulatedSwitch::new(i as u64));
            devices.push(DeviceIdentity::new(*name, address, i as u64));
        }
        let controller = controller_for(transport.clone(), devices);

        let summary = controller.run(cancel_after(100)).await;

        assert!(summary.succeeded());
        assert_eq!(summary.degraded().count(), 0);
        for report in &summary.devices {
            assert!(report.completed_install());
        }
        assert!(transport.switch("127.0.0.1:50051").unwrap().has_pipeline());
    }

    #[tokio::test]
    async fn test_unreachable_device_does_not_block_siblings() {
        let transport = EmulatedTransport::new();
        let healthy = EmulatedSwitch::new(0);
        let dead = EmulatedSwitch::new(1);
        dead.set_reachable(false);
        transport.add_switch("127.0.0.1:50051", healthy.clone());
        transport.add_switch("127.0.0.1:50052", dead);

        let controller = controller_for(
            transport,
            vec![
                DeviceIdentity::new("s1", "127.0.0.1:50051", 0),
                DeviceIdentity::new("s2", "127.0.0.1:50052", 1),
            ],
        );

        let summary = controller.run(cancel_after(100)).await;

        assert!(summary.succeeded());
        let s1 = summary.devices.iter().find(|d| d.device == "s1").unwrap();
        let s2 = summary.devices.iter().find(|d| d.device == "s2").unwrap();
        assert!(s1.completed_install());
        assert!(matches!(s2.degraded, Some(SessionError::Connection { .. })));
        assert!(healthy.has_pipeline());
    }

    #[test]
    fn test_demotion_does_not_erase_install_success() {
        let mut report = DeviceReport::new("s1".to_string());
        report.stage_reached = Stage::RuleInstall;
        report.install_complete = true;
        report.role = Role::Backup;
        assert!(report.completed_install());

        let summary = RunSummary {
            devices: vec![report],
        };
        assert!(summary.succeeded());
    }

    #[tokio::test]
    async fn test_all_degraded_at_push_shuts_down() {
        let transport = EmulatedTransport::new();
        let switch = EmulatedSwitch::new(0);
        transport.add_switch("127.0.0.1:50051", switch.clone());

        let descriptor = Arc::new(PipelineDescriptor::from_json(DESCRIPTOR).unwrap());
        let controller = Controller::new(
            Arc::new(transport),
            descriptor,
            Vec::new(), // empty artifact: every push is rejected
            vec![DeviceIdentity::new("s1", "127.0.0.1:50051", 0)],
            HashMap::new(),
            ElectionId::new(0, 1),
        )
        .with_request_timeout(Duration::from_millis(200));

        let summary = tokio::time::timeout(
            Duration::from_secs(1),
            controller.run(CancellationToken::new()),
        )
        .await
        .expect("run did not shut down with every device degraded");

        assert!(!summary.succeeded());
        assert!(matches!(
            summary.devices[0].degraded,
            Some(SessionError::Pipeline { .. })
        ));
        assert_eq!(switch.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_all_degraded_is_overall_failure() {
        let transport = EmulatedTransport::new();
        let dead = EmulatedSwitch::new(0);
        dead.set_reachable(false);
        transport.add_switch("127.0.0.1:50051", dead);

        let controller = controller_for(
            transport,
            vec![DeviceIdentity::new("s1", "127.0.0.1:50051", 0)],
        );

        let summary = controller.run(CancellationToken::new()).await;
        assert!(!summary.succeeded());
        assert_eq!(summary.degraded().count(), 1);
    }

    #[test]
    fn test_stage_ordering() {
        assert!(Stage::Init < Stage::Connecting);
        assert!(Stage::PipelinePush < Stage::RuleInstall);
        assert!(Stage::SteadyState < Stage::Terminated);
        assert_eq!(Stage::RuleInstall.as_str(), "RULE_INSTALL");
    }
}

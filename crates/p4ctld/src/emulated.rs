//! In-process software switch.
//!
//! Emulates the device side of the control protocol: the arbitration
//! ladder, the pipeline gate, and per-table keyed/default entry state
//! with the insert semantics a real runtime enforces. The daemon and
//! the test suite both drive sessions against it; a production build
//! would register a gRPC-backed [`DeviceTransport`] here instead.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use p4ctl_common::{DeviceIdentity, ElectionId, MatchValue, PipelineDescriptor, TableEntry};

use crate::transport::{
    ArbitrationUpdate, DeviceChannel, DeviceTransport, RejectCode, RpcError,
};

/// The action programmed by one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSpec {
    /// Numeric action id.
    pub action_id: u32,
    /// Encoded parameter values in order.
    pub params: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
struct TableState {
    default_action: Option<ActionSpec>,
    entries: HashMap<Vec<MatchValue>, ActionSpec>,
}

#[derive(Debug)]
struct PipelineSnapshot {
    table_ids: HashSet<u32>,
    action_ids: HashSet<u32>,
}

#[derive(Debug)]
struct SwitchCore {
    device_id: u64,
    reachable: bool,
    silent: bool,
    stream_broken: bool,
    table_capacity: Option<usize>,
    max_election: Option<ElectionId>,
    pipeline: Option<PipelineSnapshot>,
    tables: HashMap<u32, TableState>,
    open_channels: usize,
    // Accepted writes in arrival order, for install-order assertions.
    write_sequence: Vec<(u32, bool)>,
}

/// One emulated forwarding device. Cloning yields another handle to
/// the same device state, so multiple controller processes can target
/// it.
#[derive(Debug, Clone)]
pub struct EmulatedSwitch {
    inner: Arc<Mutex<SwitchCore>>,
    mastership_tx: watch::Sender<ElectionId>,
}

impl EmulatedSwitch {
    /// Creates a device with the given runtime device id.
    pub fn new(device_id: u64) -> Self {
        let (mastership_tx, _) = watch::channel(ElectionId::default());
        Self {
            inner: Arc::new(Mutex::new(SwitchCore {
                device_id,
                reachable: true,
                silent: false,
                stream_broken: false,
                table_capacity: None,
                max_election: None,
                pipeline: None,
                tables: HashMap::new(),
                open_channels: 0,
                write_sequence: Vec::new(),
            })),
            mastership_tx,
        }
    }

    /// Toggles reachability; an unreachable device refuses new
    /// channels.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().unwrap().reachable = reachable;
    }

    /// When silent, the device never answers arbitration. Used to
    /// exercise timeout handling.
    pub fn set_silent(&self, silent: bool) {
        self.inner.lock().unwrap().silent = silent;
    }

    /// Caps the number of keyed entries per table.
    pub fn set_table_capacity(&self, capacity: usize) {
        self.inner.lock().unwrap().table_capacity = Some(capacity);
    }

    /// Breaks the arbitration stream of every open channel; the next
    /// stream read fails with a transport error.
    pub fn break_stream(&self) {
        self.inner.lock().unwrap().stream_broken = true;
        // Wake channels blocked on the stream.
        let current = *self.mastership_tx.borrow();
        self.mastership_tx.send_replace(current);
    }

    /// Election id of the current primary, if any controller has
    /// claimed mastership.
    pub fn primary_election_id(&self) -> Option<ElectionId> {
        self.inner.lock().unwrap().max_election
    }

    /// Whether a forwarding pipeline has been pushed.
    pub fn has_pipeline(&self) -> bool {
        self.inner.lock().unwrap().pipeline.is_some()
    }

    /// The table's configured default (miss) action.
    pub fn default_action(&self, table_id: u32) -> Option<ActionSpec> {
        let core = self.inner.lock().unwrap();
        core.tables
            .get(&table_id)
            .and_then(|t| t.default_action.clone())
    }

    /// Looks up a keyed entry.
    pub fn lookup(&self, table_id: u32, key: &[MatchValue]) -> Option<ActionSpec> {
        let core = self.inner.lock().unwrap();
        core.tables
            .get(&table_id)
            .and_then(|t| t.entries.get(key).cloned())
    }

    /// Looks up a keyed entry, falling back to the default action on
    /// a miss, the way the data plane resolves a packet.
    pub fn lookup_or_default(&self, table_id: u32, key: &[MatchValue]) -> Option<ActionSpec> {
        self.lookup(table_id, key)
            .or_else(|| self.default_action(table_id))
    }

    /// Number of keyed entries in a table.
    pub fn keyed_entry_count(&self, table_id: u32) -> usize {
        let core = self.inner.lock().unwrap();
        core.tables.get(&table_id).map_or(0, |t| t.entries.len())
    }

    /// Accepted writes as `(table_id, is_default)` in arrival order.
    pub fn write_sequence(&self) -> Vec<(u32, bool)> {
        self.inner.lock().unwrap().write_sequence.clone()
    }

    /// Control channels currently open.
    pub fn open_channel_count(&self) -> usize {
        self.inner.lock().unwrap().open_channels
    }
}

#[derive(Debug)]
struct EmulatedChannel {
    switch: EmulatedSwitch,
    election_id: Option<ElectionId>,
    mastership_rx: watch::Receiver<ElectionId>,
    closed: bool,
}

impl EmulatedChannel {
    fn ensure_open(&self) -> Result<(), RpcError> {
        if self.closed {
            Err(RpcError::Transport("channel closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn is_primary(&self, core: &SwitchCore) -> bool {
        self.election_id.is_some() && self.election_id == core.max_election
    }
}

#[async_trait]
impl DeviceChannel for EmulatedChannel {
    async fn arbitrate(&mut self, election_id: ElectionId) -> Result<ArbitrationUpdate, RpcError> {
        self.ensure_open()?;

        let silent = self.switch.inner.lock().unwrap().silent;
        if silent {
            // Device never responds; the session's timeout fires.
            std::future::pending::<()>().await;
            unreachable!();
        }

        let (primary, changed) = {
            let mut core = self.switch.inner.lock().unwrap();
            match core.max_election {
                Some(max) if election_id == max => {
                    return Err(RpcError::rejected(
                        RejectCode::InvalidArgument,
                        "election id already in use",
                    ));
                }
                Some(max) if election_id < max => {
                    self.election_id = Some(election_id);
                    (max, false)
                }
                _ => {
                    core.max_election = Some(election_id);
                    self.election_id = Some(election_id);
                    (election_id, true)
                }
            }
        };
        if changed {
            self.mastership_tx_update(primary);
        }

        Ok(ArbitrationUpdate {
            primary_election_id: primary,
        })
    }

    async fn recv_arbitration(&mut self) -> Result<Option<ArbitrationUpdate>, RpcError> {
        self.ensure_open()?;
        if self.mastership_rx.changed().await.is_err() {
            return Ok(None);
        }
        if self.switch.inner.lock().unwrap().stream_broken {
            return Err(RpcError::Transport("stream reset by device".to_string()));
        }
        let primary_election_id = *self.mastership_rx.borrow_and_update();
        Ok(Some(ArbitrationUpdate {
            primary_election_id,
        }))
    }

    async fn set_pipeline(
        &mut self,
        descriptor: &PipelineDescriptor,
        artifact: &[u8],
    ) -> Result<(), RpcError> {
        self.ensure_open()?;
        if artifact.is_empty() {
            return Err(RpcError::rejected(
                RejectCode::InvalidArgument,
                "empty compiled artifact",
            ));
        }

        let mut core = self.switch.inner.lock().unwrap();
        if !self.is_primary(&core) {
            return Err(RpcError::rejected(
                RejectCode::PermissionDenied,
                "not the primary controller",
            ));
        }
        core.pipeline = Some(PipelineSnapshot {
            table_ids: descriptor.table_ids().collect(),
            action_ids: descriptor.action_ids().collect(),
        });
        // A new program starts with empty tables.
        core.tables.clear();
        Ok(())
    }

    async fn write_entry(&mut self, entry: &TableEntry) -> Result<(), RpcError> {
        self.ensure_open()?;

        let mut core = self.switch.inner.lock().unwrap();
        if !self.is_primary(&core) {
            return Err(RpcError::rejected(
                RejectCode::PermissionDenied,
                "not the primary controller",
            ));
        }
        let pipeline = core.pipeline.as_ref().ok_or_else(|| {
            RpcError::rejected(RejectCode::FailedPrecondition, "no pipeline installed")
        })?;
        if !pipeline.table_ids.contains(&entry.table_id) {
            return Err(RpcError::rejected(RejectCode::NotFound, "unknown table id"));
        }
        if !pipeline.action_ids.contains(&entry.action_id) {
            return Err(RpcError::rejected(RejectCode::NotFound, "unknown action id"));
        }

        let capacity = core.table_capacity;
        let table = core.tables.entry(entry.table_id).or_default();
        let action = ActionSpec {
            action_id: entry.action_id,
            params: entry.action_params.clone(),
        };

        if entry.is_default {
            table.default_action = Some(action);
            core.write_sequence.push((entry.table_id, true));
            return Ok(());
        }
        if table.entries.contains_key(&entry.match_key) {
            return Err(RpcError::rejected(
                RejectCode::AlreadyExists,
                "an entry with this match key exists",
            ));
        }
        if let Some(cap) = capacity {
            if table.entries.len() >= cap {
                return Err(RpcError::rejected(RejectCode::ResourceExhausted, "table full"));
            }
        }
        table.entries.insert(entry.match_key.clone(), action);
        core.write_sequence.push((entry.table_id, false));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RpcError> {
        if !self.closed {
            self.closed = true;
            self.switch.inner.lock().unwrap().open_channels -= 1;
        }
        Ok(())
    }
}

impl EmulatedChannel {
    fn mastership_tx_update(&mut self, primary: ElectionId) {
        self.switch.mastership_tx.send_replace(primary);
        // Our own claim is not an external mastership change.
        let _ = self.mastership_rx.borrow_and_update();
    }
}

/// Transport over a registry of emulated switches, keyed by address.
#[derive(Debug, Clone, Default)]
pub struct EmulatedTransport {
    switches: Arc<Mutex<HashMap<String, EmulatedSwitch>>>,
}

impl EmulatedTransport {
    /// Creates an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a switch at an address.
    pub fn add_switch(&self, address: impl Into<String>, switch: EmulatedSwitch) {
        self.switches
            .lock()
            .unwrap()
            .insert(address.into(), switch);
    }

    /// Returns the switch registered at an address.
    pub fn switch(&self, address: &str) -> Option<EmulatedSwitch> {
        self.switches.lock().unwrap().get(address).cloned()
    }
}

#[async_trait]
impl DeviceTransport for EmulatedTransport {
    async fn open(&self, identity: &DeviceIdentity) -> Result<Box<dyn DeviceChannel>, RpcError> {
        let switch = self
            .switch(&identity.address)
            .ok_or_else(|| RpcError::Transport("connection refused".to_string()))?;

        {
            let mut core = switch.inner.lock().unwrap();
            if !core.reachable {
                return Err(RpcError::Transport("connection refused".to_string()));
            }
            if core.device_id != identity.device_id {
                return Err(RpcError::rejected(RejectCode::NotFound, "unknown device id"));
            }
            core.open_channels += 1;
        }

        let mastership_rx = switch.mastership_tx.subscribe();
        Ok(Box::new(EmulatedChannel {
            switch,
            election_id: None,
            mastership_rx,
            closed: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("s1", "127.0.0.1:50051", 0)
    }

    fn keyed_entry(key: u8) -> TableEntry {
        TableEntry {
            table_id: 1,
            table_name: "t".to_string(),
            match_key: vec![MatchValue::Exact {
                value: vec![10, 0, 0, key],
            }],
            action_id: 10,
            action_params: vec![vec![0, 2]],
            priority: None,
            is_default: false,
        }
    }

    async fn primary_channel(switch: &EmulatedSwitch) -> Box<dyn DeviceChannel> {
        let transport = EmulatedTransport::new();
        transport.add_switch("127.0.0.1:50051", switch.clone());
        let mut channel = transport.open(&identity()).await.unwrap();
        channel.arbitrate(ElectionId::new(0, 1)).await.unwrap();
        let descriptor = PipelineDescriptor::from_json(DESCRIPTOR).unwrap();
        channel.set_pipeline(&descriptor, b"program").await.unwrap();
        channel
    }

    #[tokio::test]
    async fn test_arbitration_ladder() {
        let switch = EmulatedSwitch::new(0);
        let transport = EmulatedTransport::new();
        transport.add_switch("127.0.0.1:50051", switch.clone());

        let mut low = transport.open(&identity()).await.unwrap();
        let resp = low.arbitrate(ElectionId::new(0, 5)).await.unwrap();
        assert_eq!(resp.primary_election_id, ElectionId::new(0, 5));

        let mut high = transport.open(&identity()).await.unwrap();
        let resp = high.arbitrate(ElectionId::new(0, 9)).await.unwrap();
        assert_eq!(resp.primary_election_id, ElectionId::new(0, 9));

        // The losing channel is told who won.
        let update = low.recv_arbitration().await.unwrap().unwrap();
        assert_eq!(update.primary_election_id, ElectionId::new(0, 9));

        // Re-using the winning id is rejected.
        let mut dup = transport.open(&identity()).await.unwrap();
        let err = dup.arbitrate(ElectionId::new(0, 9)).await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::Rejected {
                code: RejectCode::InvalidArgument,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_keyed_insert_rejected() {
        let switch = EmulatedSwitch::new(0);
        let mut channel = primary_channel(&switch).await;

        channel.write_entry(&keyed_entry(1)).await.unwrap();
        let err = channel.write_entry(&keyed_entry(1)).await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::Rejected {
                code: RejectCode::AlreadyExists,
                ..
            }
        ));
        assert_eq!(switch.keyed_entry_count(1), 1);
    }

    #[tokio::test]
    async fn test_default_entry_replaces() {
        let switch = EmulatedSwitch::new(0);
        let mut channel = primary_channel(&switch).await;

        let mut default = keyed_entry(0);
        default.match_key.clear();
        default.is_default = true;

        channel.write_entry(&default).await.unwrap();
        default.action_params = vec![vec![0, 7]];
        channel.write_entry(&default).await.unwrap();

        let action = switch.default_action(1).unwrap();
        assert_eq!(action.params, vec![vec![0, 7]]);
    }

    #[tokio::test]
    async fn test_write_requires_pipeline_and_mastership() {
        let switch = EmulatedSwitch::new(0);
        let transport = EmulatedTransport::new();
        transport.add_switch("127.0.0.1:50051", switch.clone());

        let mut channel = transport.open(&identity()).await.unwrap();
        let err = channel.write_entry(&keyed_entry(1)).await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::Rejected {
                code: RejectCode::PermissionDenied,
                ..
            }
        ));

        channel.arbitrate(ElectionId::new(0, 1)).await.unwrap();
        let err = channel.write_entry(&keyed_entry(1)).await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::Rejected {
                code: RejectCode::FailedPrecondition,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_capacity_exhaustion() {
        let switch = EmulatedSwitch::new(0);
        switch.set_table_capacity(1);
        let mut channel = primary_channel(&switch).await;

        channel.write_entry(&keyed_entry(1)).await.unwrap();
        let err = channel.write_entry(&keyed_entry(2)).await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::Rejected {
                code: RejectCode::ResourceExhausted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_break_stream_fails_recv() {
        let switch = EmulatedSwitch::new(0);
        let transport = EmulatedTransport::new();
        transport.add_switch("127.0.0.1:50051", switch.clone());

        let mut channel = transport.open(&identity()).await.unwrap();
        channel.arbitrate(ElectionId::new(0, 1)).await.unwrap();

        switch.break_stream();
        let err = channel.recv_arbitration().await.unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }

    #[tokio::test]
    async fn test_unreachable_and_wrong_device_id() {
        let switch = EmulatedSwitch::new(0);
        let transport = EmulatedTransport::new();
        transport.add_switch("127.0.0.1:50051", switch.clone());

        switch.set_reachable(false);
        assert!(matches!(
            transport.open(&identity()).await.unwrap_err(),
            RpcError::Transport(_)
        ));

        switch.set_reachable(true);
        let wrong = DeviceIdentity::new("s1", "127.0.0.1:50051", 42);
        assert!(matches!(
            transport.open(&wrong).await.unwrap_err(),
            RpcError::Rejected {
                code: RejectCode::NotFound,
                ..
            }
        ));
    }
}

//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use dsrepl_topology::{
    Command, CommandGateway, ControllerConfig, EntityKind, Entry, Operation, Payload,
    ReplicationController, Snapshot, TopologyObserver,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub const SUFFIX: &str = "dc=example,dc=com";
pub const MANAGER_DN: &str = "cn=replication manager,cn=config";

type Reply = Result<Payload, String>;

/// In-memory gateway answering from per-operation scripts and recording
/// every command it receives.
#[derive(Default)]
pub struct MockGateway {
    queued: Mutex<HashMap<Operation, VecDeque<Reply>>>,
    fallback: Mutex<HashMap<Operation, Reply>>,
    calls: Mutex<Vec<Command>>,
    gates: Mutex<HashMap<Operation, Arc<Notify>>>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer the next `op` with `reply`. Queued replies are used in order
    /// before the fallback.
    pub fn push(&self, op: Operation, reply: Reply) {
        self.queued
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(reply);
    }

    pub fn push_ok(&self, op: Operation, payload: Payload) {
        self.push(op, Ok(payload));
    }

    pub fn push_err(&self, op: Operation, message: &str) {
        self.push(op, Err(message.to_string()));
    }

    /// Answer every unscripted `op` with `reply`.
    pub fn always(&self, op: Operation, reply: Reply) {
        self.fallback.lock().unwrap().insert(op, reply);
    }

    /// Park every `op` after recording it until the returned gate is
    /// notified, once per call.
    pub fn hold(&self, op: Operation) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().unwrap().insert(op, Arc::clone(&gate));
        gate
    }

    pub fn calls(&self) -> Vec<Command> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ops(&self) -> Vec<Operation> {
        self.calls().iter().map(|c| c.operation).collect()
    }

    pub fn count(&self, op: Operation) -> usize {
        self.calls().iter().filter(|c| c.operation == op).count()
    }

    /// Last command issued for `op`.
    pub fn last(&self, op: Operation) -> Option<Command> {
        self.calls().into_iter().rev().find(|c| c.operation == op)
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl CommandGateway for MockGateway {
    async fn execute(&self, cmd: Command) -> Result<Payload, String> {
        let op = cmd.operation;
        self.calls.lock().unwrap().push(cmd);
        let gate = self.gates.lock().unwrap().get(&op).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(reply) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        self.fallback
            .lock()
            .unwrap()
            .get(&op)
            .cloned()
            .unwrap_or_else(|| Ok(Payload::empty()))
    }
}

/// Observer keeping every notification.
#[derive(Default)]
pub struct RecordingObserver {
    changes: Mutex<Vec<(EntityKind, Snapshot)>>,
    errors: Mutex<Vec<(String, String)>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn changes(&self) -> Vec<(EntityKind, Snapshot)> {
        self.changes.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().unwrap().clone()
    }

    pub fn initializations(&self) -> usize {
        self.changes()
            .iter()
            .filter(|(_, s)| matches!(s, Snapshot::Initialization { .. }))
            .count()
    }
}

impl TopologyObserver for RecordingObserver {
    fn on_state_changed(&self, kind: EntityKind, snapshot: &Snapshot) {
        self.changes.lock().unwrap().push((kind, snapshot.clone()));
    }

    fn on_error(&self, operation: &str, message: &str) {
        self.errors
            .lock()
            .unwrap()
            .push((operation.to_string(), message.to_string()));
    }
}

/// Controller over `gateway` with the default 2s poll interval.
pub fn controller(gateway: &Arc<MockGateway>, observer: &Arc<RecordingObserver>) -> ReplicationController {
    controller_with(gateway, observer, &ControllerConfig::default())
}

pub fn controller_with(
    gateway: &Arc<MockGateway>,
    observer: &Arc<RecordingObserver>,
    config: &ControllerConfig,
) -> ReplicationController {
    let gateway: Arc<dyn CommandGateway> = gateway.clone();
    let observer: Arc<dyn TopologyObserver> = observer.clone();
    ReplicationController::new(gateway, observer, config)
}

/// Gateway where replication is enabled but no changelog exists.
pub fn gateway() -> Arc<MockGateway> {
    let gw = MockGateway::new();
    gw.always(Operation::GetChangelog, Err("No such object".to_string()));
    gw
}

pub fn master_entry(rid: &str, managers: &[&str]) -> Payload {
    let mut entry = Entry::new()
        .with("nsds5replicaroot", [SUFFIX])
        .with("nsds5replicatype", ["3"])
        .with("nsds5flags", ["1"])
        .with("nsds5replicaid", [rid]);
    if !managers.is_empty() {
        entry = entry.with("nsds5replicabinddn", managers.iter().copied());
    }
    Payload::from_entry(&entry)
}

pub fn hub_entry(managers: &[&str]) -> Payload {
    let mut entry = Entry::new()
        .with("nsds5replicaroot", [SUFFIX])
        .with("nsds5replicatype", ["2"])
        .with("nsds5flags", ["1"])
        .with("nsds5replicaid", ["65535"]);
    if !managers.is_empty() {
        entry = entry.with("nsds5replicabinddn", managers.iter().copied());
    }
    Payload::from_entry(&entry)
}

pub fn consumer_entry(managers: &[&str]) -> Payload {
    let mut entry = Entry::new()
        .with("nsds5replicaroot", [SUFFIX])
        .with("nsds5replicatype", ["2"])
        .with("nsds5flags", ["0"])
        .with("nsds5replicaid", ["65535"]);
    if !managers.is_empty() {
        entry = entry.with("nsds5replicabinddn", managers.iter().copied());
    }
    Payload::from_entry(&entry)
}

pub fn agreement_entry(name: &str, host: &str) -> Entry {
    Entry::new()
        .with("cn", [name])
        .with("nsds5replicahost", [host])
        .with("nsds5replicaport", ["389"])
        .with("nsds5replicatransportinfo", ["LDAP"])
        .with("nsds5replicabindmethod", ["SIMPLE"])
        .with("nsds5replicabinddn", [MANAGER_DN])
        .with("nsds5replicacredentials", ["password"])
        .with("nsds5replicaenabled", ["on"])
        .with("nsds5replicalastinitstart", ["19700101000000Z"])
}

pub fn list_of(entries: &[Entry]) -> Payload {
    Payload::from_entries(entries.iter())
}

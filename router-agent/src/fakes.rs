// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory implementations of the agent's external collaborators.
//!
//! These implement the same traits as the CLI-backed types in
//! [`crate::backends`] but never touch the host, so a whole fleet of units
//! can be driven from one test process.

use crate::backends::ExecutionError;
use crate::health::{ClusterConnection, ClusterConnector, ConnectionError};
use crate::peer_state::{PeerRelation, PeerStateError, ReadScope, WriteScope};
use crate::service::{RouterService, RouterServiceError};
use crate::status::{StatusChannel, StatusError};
use router_agent_types::{Status, UnitName};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

type Bag = BTreeMap<String, String>;

#[derive(Debug, Default)]
struct NetworkInner {
    established: bool,
    leader: Option<UnitName>,
    units: BTreeMap<UnitName, Bag>,
    app: Bag,
    writes: usize,
}

/// Peer state shared by every unit of a simulated application.
#[derive(Debug, Clone)]
pub struct FakePeerNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl Default for FakePeerNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePeerNetwork {
    pub fn new() -> Self {
        let inner = NetworkInner { established: true, ..Default::default() };
        Self { inner: Arc::new(Mutex::new(inner)) }
    }

    /// Add `unit` to the relation with an empty bag and return its view.
    pub fn join(&self, unit: UnitName) -> FakePeerRelation {
        self.inner.lock().unwrap().units.entry(unit.clone()).or_default();
        FakePeerRelation { unit, network: self.clone() }
    }

    /// Remove `unit` and its bag, as when a unit departs.
    pub fn depart(&self, unit: &UnitName) {
        self.inner.lock().unwrap().units.remove(unit);
    }

    pub fn set_established(&self, established: bool) {
        self.inner.lock().unwrap().established = established;
    }

    pub fn set_leader(&self, unit: &UnitName) {
        self.inner.lock().unwrap().leader = Some(unit.clone());
    }

    pub fn unit_bag(&self, unit: &UnitName) -> Bag {
        self.inner.lock().unwrap().units.get(unit).cloned().unwrap_or_default()
    }

    pub fn app_bag(&self) -> Bag {
        self.inner.lock().unwrap().app.clone()
    }

    /// Seed a value in any unit's bag, bypassing write scoping.
    pub fn set_unit_value(&self, unit: &UnitName, key: &str, value: &str) {
        self.inner
            .lock()
            .unwrap()
            .units
            .entry(unit.clone())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn set_app_value(&self, key: &str, value: &str) {
        self.inner
            .lock()
            .unwrap()
            .app
            .insert(key.to_string(), value.to_string());
    }

    /// Number of writes made through [`PeerRelation::write`].
    pub fn write_count(&self) -> usize {
        self.inner.lock().unwrap().writes
    }
}

/// One unit's view of a [`FakePeerNetwork`].
#[derive(Debug, Clone)]
pub struct FakePeerRelation {
    unit: UnitName,
    network: FakePeerNetwork,
}

impl FakePeerRelation {
    pub fn unit(&self) -> &UnitName {
        &self.unit
    }
}

impl PeerRelation for FakePeerRelation {
    async fn relation_established(&self) -> Result<bool, PeerStateError> {
        Ok(self.network.inner.lock().unwrap().established)
    }

    async fn is_leader(&self) -> Result<bool, PeerStateError> {
        let inner = self.network.inner.lock().unwrap();
        Ok(inner.leader.as_ref() == Some(&self.unit))
    }

    async fn peer_units(&self) -> Result<BTreeSet<UnitName>, PeerStateError> {
        let inner = self.network.inner.lock().unwrap();
        Ok(inner.units.keys().filter(|u| **u != self.unit).cloned().collect())
    }

    async fn read(&self, scope: ReadScope) -> Result<Bag, PeerStateError> {
        let inner = self.network.inner.lock().unwrap();
        let bag = match scope {
            ReadScope::Unit(unit) => inner.units.get(&unit).cloned(),
            ReadScope::App => Some(inner.app.clone()),
        };
        Ok(bag.unwrap_or_default())
    }

    async fn write(
        &self,
        scope: WriteScope,
        key: &str,
        value: &str,
    ) -> Result<(), PeerStateError> {
        let mut inner = self.network.inner.lock().unwrap();
        if !inner.established {
            return Err(PeerStateError::NotReady);
        }
        let bag = match scope {
            WriteScope::LocalUnit => {
                inner.units.entry(self.unit.clone()).or_default()
            }
            WriteScope::App => {
                if inner.leader.as_ref() != Some(&self.unit) {
                    return Err(PeerStateError::NotLeader);
                }
                &mut inner.app
            }
        };
        bag.insert(key.to_string(), value.to_string());
        inner.writes += 1;
        Ok(())
    }
}

fn injected_failure(command: &str) -> ExecutionError {
    ExecutionError::ExecutionStart {
        command: command.to_string(),
        err: std::io::Error::other("injected failure"),
    }
}

/// A service operation recorded by [`FakeRouterService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCall {
    Stop,
    Install(String),
    Start,
}

#[derive(Debug)]
struct ServiceInner {
    running: bool,
    installed: String,
    calls: Vec<ServiceCall>,
    fail_install: bool,
    /// When set, `start` leaves the service stopped.
    stay_down: bool,
}

#[derive(Debug, Clone)]
pub struct FakeRouterService {
    inner: Arc<Mutex<ServiceInner>>,
}

impl FakeRouterService {
    /// A running service at `installed` revision.
    pub fn new(installed: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ServiceInner {
                running: true,
                installed: installed.to_string(),
                calls: Vec::new(),
                fail_install: false,
                stay_down: false,
            })),
        }
    }

    pub fn installed(&self) -> String {
        self.inner.lock().unwrap().installed.clone()
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn set_running(&self, running: bool) {
        self.inner.lock().unwrap().running = running;
    }

    pub fn fail_install(&self, fail: bool) {
        self.inner.lock().unwrap().fail_install = fail;
    }

    pub fn stay_down(&self, stay_down: bool) {
        self.inner.lock().unwrap().stay_down = stay_down;
    }

    pub fn is_stuck_down(&self) -> bool {
        self.inner.lock().unwrap().stay_down
    }
}

impl RouterService for FakeRouterService {
    async fn stop(&self) -> Result<(), RouterServiceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(ServiceCall::Stop);
        inner.running = false;
        Ok(())
    }

    async fn install(&self, revision: &str) -> Result<(), RouterServiceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(ServiceCall::Install(revision.to_string()));
        if inner.fail_install {
            return Err(RouterServiceError::Install {
                revision: revision.to_string(),
                err: injected_failure("install"),
            });
        }
        inner.installed = revision.to_string();
        Ok(())
    }

    async fn start(&self) -> Result<(), RouterServiceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(ServiceCall::Start);
        inner.running = !inner.stay_down;
        Ok(())
    }

    async fn is_running(&self) -> Result<bool, RouterServiceError> {
        Ok(self.inner.lock().unwrap().running)
    }
}

#[derive(Debug, Default)]
struct ClusterInner {
    configured: bool,
    reachable: bool,
    fail_reads: bool,
    /// Number of upcoming reads that see no documents.
    hidden_reads: usize,
    find_calls: usize,
    collections: BTreeMap<(String, String), Vec<Value>>,
    dropped: Vec<String>,
    admin_commands: Vec<Value>,
}

/// A cluster reachable through the router, holding documents in memory.
#[derive(Debug, Clone)]
pub struct FakeCluster {
    inner: Arc<Mutex<ClusterInner>>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    /// A configured, reachable, well-behaved cluster.
    pub fn new() -> Self {
        let inner = ClusterInner {
            configured: true,
            reachable: true,
            ..Default::default()
        };
        Self { inner: Arc::new(Mutex::new(inner)) }
    }

    pub fn set_configured(&self, configured: bool) {
        self.inner.lock().unwrap().configured = configured;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().unwrap().reachable = reachable;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.inner.lock().unwrap().fail_reads = fail;
    }

    /// Make the next `reads` reads come back empty, as if the write had not
    /// propagated yet.
    pub fn hide_writes_for_reads(&self, reads: usize) {
        self.inner.lock().unwrap().hidden_reads = reads;
    }

    pub fn insert(&self, database: &str, collection: &str, document: Value) {
        self.inner
            .lock()
            .unwrap()
            .collections
            .entry((database.to_string(), collection.to_string()))
            .or_default()
            .push(document);
    }

    /// Names of the collections currently present in `database`.
    pub fn collections(&self, database: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .collections
            .keys()
            .filter(|(db, _)| db == database)
            .map(|(_, collection)| collection.clone())
            .collect()
    }

    pub fn dropped(&self) -> Vec<String> {
        self.inner.lock().unwrap().dropped.clone()
    }

    pub fn find_calls(&self) -> usize {
        self.inner.lock().unwrap().find_calls
    }

    pub fn admin_commands(&self) -> Vec<Value> {
        self.inner.lock().unwrap().admin_commands.clone()
    }
}

impl ClusterConnector for FakeCluster {
    type Connection = FakeCluster;

    async fn is_configured(&self) -> bool {
        self.inner.lock().unwrap().configured
    }

    async fn connect(&self) -> Result<FakeCluster, ConnectionError> {
        if !self.inner.lock().unwrap().reachable {
            return Err(ConnectionError::Unavailable(
                "connection refused".to_string(),
            ));
        }
        Ok(self.clone())
    }
}

impl ClusterConnection for FakeCluster {
    async fn insert_one(
        &self,
        database: &str,
        collection: &str,
        document: Value,
    ) -> Result<(), ConnectionError> {
        self.insert(database, collection, document);
        Ok(())
    }

    async fn find(
        &self,
        database: &str,
        collection: &str,
        _filter: Value,
        projection: Value,
    ) -> Result<Vec<Value>, ConnectionError> {
        let mut inner = self.inner.lock().unwrap();
        inner.find_calls += 1;
        if inner.fail_reads {
            return Err(ConnectionError::Unavailable(
                "read timed out".to_string(),
            ));
        }
        if inner.hidden_reads > 0 {
            inner.hidden_reads -= 1;
            return Ok(Vec::new());
        }
        let key = (database.to_string(), collection.to_string());
        let documents = inner.collections.get(&key).cloned().unwrap_or_default();
        let Some(fields) = projection.as_object() else {
            return Ok(documents);
        };
        Ok(documents
            .into_iter()
            .map(|doc| {
                let projected: serde_json::Map<String, Value> = fields
                    .keys()
                    .filter_map(|field| {
                        doc.get(field).map(|v| (field.clone(), v.clone()))
                    })
                    .collect();
                Value::Object(projected)
            })
            .collect())
    }

    async fn drop_collection(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .collections
            .remove(&(database.to_string(), collection.to_string()));
        inner.dropped.push(collection.to_string());
        Ok(())
    }

    async fn run_admin_command(
        &self,
        command: Value,
    ) -> Result<Value, ConnectionError> {
        self.inner.lock().unwrap().admin_commands.push(command);
        Ok(json!({ "ok": 1 }))
    }
}

#[derive(Debug, Default)]
struct StatusInner {
    unit: Status,
    app: Status,
    unit_publishes: usize,
    app_publishes: usize,
}

/// A status channel that remembers what was published.
#[derive(Debug, Clone, Default)]
pub struct RecordingStatus {
    inner: Arc<Mutex<StatusInner>>,
}

impl RecordingStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unit(&self) -> Status {
        self.inner.lock().unwrap().unit.clone()
    }

    pub fn app(&self) -> Status {
        self.inner.lock().unwrap().app.clone()
    }

    /// Set the unit status as another subsystem would, without counting it
    /// as a publish.
    pub fn set_unit(&self, status: Status) {
        self.inner.lock().unwrap().unit = status;
    }

    pub fn unit_publishes(&self) -> usize {
        self.inner.lock().unwrap().unit_publishes
    }

    pub fn app_publishes(&self) -> usize {
        self.inner.lock().unwrap().app_publishes
    }
}

impl StatusChannel for RecordingStatus {
    async fn unit_status(&self) -> Result<Status, StatusError> {
        Ok(self.unit())
    }

    async fn set_unit_status(&self, status: &Status) -> Result<(), StatusError> {
        let mut inner = self.inner.lock().unwrap();
        inner.unit = status.clone();
        inner.unit_publishes += 1;
        Ok(())
    }

    async fn app_status(&self) -> Result<Status, StatusError> {
        Ok(self.app())
    }

    async fn set_app_status(&self, status: &Status) -> Result<(), StatusError> {
        let mut inner = self.inner.lock().unwrap();
        inner.app = status.clone();
        inner.app_publishes += 1;
        Ok(())
    }
}

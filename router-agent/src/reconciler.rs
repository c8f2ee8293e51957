// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The upgrade control loop run on every lifecycle signal.
//!
//! A reconcile pass snapshots peer state, keeps the group's recorded
//! versions current, refuses incompatible upgrades, upgrades the local unit
//! when it is outdated and its turn has come, and republishes status. Passes
//! are idempotent: repeating one with no change in peer state writes
//! nothing.

use crate::authorization::{AuthorizationSequencer, PrecheckFailed};
use crate::compatibility::{self, Incompatibility};
use crate::config::ProbeConfig;
use crate::health::{
    ClusterConnection, ClusterConnector, ConnectionError, HealthProbe,
    command_succeeded,
};
use crate::peer_state::{PeerRelation, PeerState, PeerStateError, UnitKey};
use crate::service::{RouterService, RouterServiceError};
use crate::status::{self, StatusChannel, StatusError};
use crate::unit_state::{UnitStateError, UnitStateMachine};
use crate::versions::VersionStore;
use router_agent_types::{Status, UnitName, UnitState, Versions};
use serde_json::json;
use slog::{Logger, debug, error, info, o, warn};
use slog_error_chain::InlineErrorChain;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("peer relation is not ready")]
    PeerRelationNotReady,
    #[error("upgrade is incompatible with the group's recorded versions")]
    IncompatibleVersion(#[source] Incompatibility),
    #[error("pre-upgrade check failed")]
    PrecheckFailed(#[from] PrecheckFailed),
    #[error("router is unhealthy after upgrade")]
    UnhealthyAfterUpgrade,
    #[error(transparent)]
    PeerState(PeerStateError),
    #[error(transparent)]
    UnitState(UnitStateError),
    #[error(transparent)]
    RouterService(#[from] RouterServiceError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl From<PeerStateError> for ReconcileError {
    fn from(err: PeerStateError) -> Self {
        match err {
            PeerStateError::NotReady => ReconcileError::PeerRelationNotReady,
            err => ReconcileError::PeerState(err),
        }
    }
}

impl From<UnitStateError> for ReconcileError {
    fn from(err: UnitStateError) -> Self {
        match err {
            UnitStateError::PeerState(err) => err.into(),
            err => ReconcileError::UnitState(err),
        }
    }
}

impl ReconcileError {
    /// The status this error is surfaced as, for the conditions an operator
    /// is expected to act on.
    pub fn status(&self) -> Option<Status> {
        match self {
            ReconcileError::IncompatibleVersion(_) => {
                Some(status::incompatible())
            }
            ReconcileError::PrecheckFailed(failed) => Some(failed.status()),
            ReconcileError::UnhealthyAfterUpgrade => {
                Some(status::unhealthy_after_upgrade())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ForceUpgradeError {
    #[error("No upgrade in progress")]
    NoUpgradeInProgress,
    #[error("Unit already upgraded")]
    AlreadyUpgraded,
    #[error("failed to upgrade unit")]
    Upgrade(#[source] ReconcileError),
}

/// What a reconcile pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    NoPeerRelation,
    /// The group has no recorded versions yet (first install).
    VersionsUnset,
    /// Only the leader reconciles on this signal.
    NotLeader,
    Incompatible,
    PrecheckFailed,
    /// Waiting for a higher unit to finish upgrading.
    Waiting,
    /// The local unit was upgraded; its post-upgrade check is due.
    Upgraded,
    Settled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostUpgradeCheck {
    Done,
    /// The check could not pass yet and must be retried later.
    Deferred,
}

/// Identity and versions of the unit being reconciled.
#[derive(Debug, Clone)]
pub struct UpgradeContext {
    pub unit: UnitName,
    /// The binary revision this build installs.
    pub target_revision: String,
    /// The charm and workload versions of this build.
    pub current_versions: Versions,
}

pub struct UpgradeReconciler<P, S, C, T> {
    log: Logger,
    unit: UnitName,
    target_revision: String,
    versions: VersionStore,
    sequencer: AuthorizationSequencer,
    relation: P,
    service: S,
    probe: HealthProbe<C>,
    status: T,
}

impl<P, S, C, T> UpgradeReconciler<P, S, C, T>
where
    P: PeerRelation,
    S: RouterService,
    C: ClusterConnector,
    T: StatusChannel,
{
    pub fn new(
        log: &Logger,
        context: UpgradeContext,
        probe_config: &ProbeConfig,
        relation: P,
        service: S,
        connector: C,
        status: T,
    ) -> Self {
        let log = log.new(o!(
            "component" => "UpgradeReconciler",
            "unit" => context.unit.to_string(),
        ));
        Self {
            versions: VersionStore::new(&log, context.current_versions),
            sequencer: AuthorizationSequencer::new(&log),
            probe: HealthProbe::new(&log, connector, probe_config),
            log,
            unit: context.unit,
            target_revision: context.target_revision,
            relation,
            service,
            status,
        }
    }

    pub fn unit(&self) -> &UnitName {
        &self.unit
    }

    async fn load_state(&self) -> Result<PeerState<'_, P>, ReconcileError> {
        let state =
            PeerState::load(&self.relation, &self.unit, &self.target_revision)
                .await?;
        for err in state.unreadable_records() {
            warn!(
                self.log,
                "ignoring unreadable peer state; treating unit state as unknown";
                "error" => InlineErrorChain::new(err),
            );
        }
        Ok(state)
    }

    /// Advance the upgrade as far as the current peer state allows.
    pub async fn reconcile(&self) -> Result<Reconciled, ReconcileError> {
        let mut state = match self.load_state().await {
            Ok(state) => state,
            Err(ReconcileError::PeerRelationNotReady) => {
                debug!(self.log, "peer relation not available");
                return Ok(Reconciled::NoPeerRelation);
            }
            Err(err) => return Err(err),
        };
        if !self.versions.group_versions_recorded(&state) {
            debug!(self.log, "group versions not recorded yet");
            return Ok(Reconciled::VersionsUnset);
        }
        if let Some(token) = state.leader_token() {
            // Done before the compatibility check so that an incompatible
            // upgrade forced through on every unit is accepted once complete.
            if !state.in_progress() {
                self.versions.set_group_versions(&mut state, &token).await?;
            }
        }

        match self.advance(&mut state).await {
            Ok(reconciled) => Ok(reconciled),
            Err(ReconcileError::IncompatibleVersion(reason)) => {
                info!(
                    self.log,
                    "upgrade incompatible with recorded versions. If you \
                     accept potential data loss and downtime, you can \
                     continue by running the `force-upgrade` action on each \
                     remaining unit";
                    "reason" => InlineErrorChain::new(&reason),
                );
                self.publish_status(&state, None).await?;
                Ok(Reconciled::Incompatible)
            }
            Err(ReconcileError::PrecheckFailed(failed)) => {
                let status = failed.status();
                error!(self.log, "{}", status.message);
                self.publish_status(&state, Some(status)).await?;
                Ok(Reconciled::PrecheckFailed)
            }
            Err(err) => Err(err),
        }
    }

    async fn advance(
        &self,
        state: &mut PeerState<'_, P>,
    ) -> Result<Reconciled, ReconcileError> {
        compatibility::check_peer_state(state, self.versions.current())
            .map_err(ReconcileError::IncompatibleVersion)?;

        if state.local_state() != Some(UnitState::Outdated) {
            self.publish_status(state, None).await?;
            return Ok(Reconciled::Settled);
        }

        let authorized = self
            .sequencer
            .is_authorized(state, self.versions.current(), || {
                self.pre_upgrade_check()
            })
            .await?;
        if !authorized {
            self.publish_status(state, Some(status::waiting_for_higher_units()))
                .await?;
            return Ok(Reconciled::Waiting);
        }

        self.publish_status(state, None).await?;
        self.upgrade_unit(state).await?;
        Ok(Reconciled::Upgraded)
    }

    /// Swap the local router binary for the target revision.
    ///
    /// The caller must schedule the post-upgrade check afterwards.
    async fn upgrade_unit(
        &self,
        state: &mut PeerState<'_, P>,
    ) -> Result<(), ReconcileError> {
        info!(
            self.log,
            "upgrading router";
            "from" => state.local().binary_revision.as_deref(),
            "to" => &self.target_revision,
        );
        UnitStateMachine::new(state).begin_upgrade().await?;
        self.service.stop().await?;
        self.service.install(&self.target_revision).await?;
        self.service.start().await?;

        state.set_local(UnitKey::BinaryRevision, &self.target_revision).await?;
        let workload = self.versions.current().workload().unwrap_or_default();
        state.set_local(UnitKey::WorkloadVersion, workload).await?;
        info!(self.log, "router upgraded"; "revision" => &self.target_revision);
        Ok(())
    }

    /// Verify the local router after an upgrade and mark the unit healthy.
    ///
    /// Returns [`PostUpgradeCheck::Deferred`] when the router is not yet
    /// running or not yet serving reads and writes.
    pub async fn post_upgrade_check(
        &self,
    ) -> Result<PostUpgradeCheck, ReconcileError> {
        let mut state = match self.load_state().await {
            Ok(state) => state,
            Err(ReconcileError::PeerRelationNotReady) => {
                return Ok(PostUpgradeCheck::Done);
            }
            Err(err) => return Err(err),
        };
        if state.local_state() != Some(UnitState::Upgrading) {
            debug!(
                self.log,
                "no upgrade awaiting a health check";
                "state" => ?state.local_state(),
            );
            return Ok(PostUpgradeCheck::Done);
        }

        if self.probe.connector().is_configured().await {
            if !self.service.is_running().await? {
                warn!(self.log, "router not running yet; deferring check");
                let current = self.status.unit_status().await?;
                if status::replaceable(&current)
                    || status::set_by_post_upgrade_check(&current)
                {
                    status::publish_unit(
                        &self.status,
                        &status::waiting_for_router(),
                    )
                    .await?;
                }
                return Ok(PostUpgradeCheck::Deferred);
            }
            if !self.probe.is_able_to_read_write().await {
                let err = ReconcileError::UnhealthyAfterUpgrade;
                error!(self.log, "{err}; deferring check");
                if let Some(status) = err.status() {
                    status::publish_unit(&self.status, &status).await?;
                }
                return Ok(PostUpgradeCheck::Deferred);
            }
        } else {
            debug!(self.log, "no upstream cluster configured; nothing to check");
        }

        let current = self.status.unit_status().await?;
        if status::set_by_post_upgrade_check(&current) {
            self.status.set_unit_status(&Status::active("")).await?;
        }
        UnitStateMachine::new(&mut state).mark_healthy().await?;
        info!(self.log, "unit healthy after upgrade");

        self.reconcile().await?;
        Ok(PostUpgradeCheck::Done)
    }

    /// Check that the cluster can take an upgrade.
    ///
    /// Passes trivially until the router has an upstream cluster.
    pub async fn pre_upgrade_check(&self) -> Result<(), PrecheckFailed> {
        if !self.probe.connector().is_configured().await {
            debug!(self.log, "no upstream cluster configured; allowing upgrade");
            return Ok(());
        }
        if !self.probe.is_able_to_read_write().await {
            return Err(PrecheckFailed::new("router is not able to read/write."));
        }
        Ok(())
    }

    /// Upgrade the local unit now, bypassing authorization.
    ///
    /// On success the caller must schedule the post-upgrade check.
    pub async fn force_upgrade(&self) -> Result<String, ForceUpgradeError> {
        let mut state = match self.load_state().await {
            Ok(state) => state,
            Err(ReconcileError::PeerRelationNotReady) => {
                return Err(ForceUpgradeError::NoUpgradeInProgress);
            }
            Err(err) => return Err(ForceUpgradeError::Upgrade(err)),
        };
        if !state.in_progress() {
            let err = ForceUpgradeError::NoUpgradeInProgress;
            debug!(self.log, "force upgrade failed"; "reason" => %err);
            return Err(err);
        }
        if state.local_state() != Some(UnitState::Outdated) {
            let err = ForceUpgradeError::AlreadyUpgraded;
            debug!(self.log, "force upgrade failed"; "reason" => %err);
            return Err(err);
        }

        warn!(self.log, "forcing upgrade");
        self.upgrade_unit(&mut state)
            .await
            .map_err(ForceUpgradeError::Upgrade)?;
        Ok(format!("Forcefully upgraded {}", self.unit))
    }

    /// Record initial versions when the local unit joins the peer group.
    pub async fn on_peer_relation_created(&self) -> Result<(), ReconcileError> {
        let mut state = self.load_state().await?;
        self.versions.record_initial_versions(&mut state).await?;
        if let Some(token) = state.leader_token() {
            if !state.in_progress() {
                self.versions.set_group_versions(&mut state, &token).await?;
            }
        }
        Ok(())
    }

    /// Handle new charm code. Only the leader reconciles here; the other
    /// units follow on the peer changes the leader causes.
    pub async fn on_charm_upgraded(&self) -> Result<Reconciled, ReconcileError> {
        let state = match self.load_state().await {
            Ok(state) => state,
            Err(ReconcileError::PeerRelationNotReady) => {
                return Ok(Reconciled::NoPeerRelation);
            }
            Err(err) => return Err(err),
        };
        if !state.is_leader() {
            return Ok(Reconciled::NotLeader);
        }
        if !state.in_progress() {
            info!(self.log, "charm upgraded; router binary revision unchanged");
        }
        self.reconcile().await
    }

    /// Raise the cluster's feature compatibility version, normally once
    /// every unit runs the new major version.
    pub async fn set_feature_compatibility_version(
        &self,
        version: &str,
    ) -> Result<(), ReconcileError> {
        let conn = self.probe.connector().connect().await?;
        let reply = conn
            .run_admin_command(json!({ "setFeatureCompatibilityVersion": version }))
            .await?;
        if !command_succeeded(&reply) {
            return Err(ConnectionError::UnexpectedReply {
                operation: "setFeatureCompatibilityVersion",
                reply: reply.to_string(),
            }
            .into());
        }
        info!(self.log, "set feature compatibility version"; "version" => version);
        Ok(())
    }

    /// Publish the upgrade's unit and application status.
    ///
    /// `unit_status` replaces the routine unit status. Either is only shown
    /// if the current unit status is one the upgrade may overwrite.
    async fn publish_status(
        &self,
        state: &PeerState<'_, P>,
        unit_status: Option<Status>,
    ) -> Result<(), ReconcileError> {
        let compatible =
            compatibility::check_peer_state(state, self.versions.current())
                .is_ok();

        if state.is_leader() {
            let app_status = if !compatible {
                status::incompatible()
            } else if state.in_progress() {
                status::upgrade_in_progress()
            } else {
                Status::active("")
            };
            status::publish_app(&self.status, &app_status).await?;
        }

        let current = self.status.unit_status().await?;
        if !status::replaceable(&current) {
            debug!(
                self.log,
                "leaving higher-priority unit status in place";
                "status" => %current,
            );
            return Ok(());
        }
        let desired = unit_status.unwrap_or_else(|| self.routine_status(state));
        status::publish_unit(&self.status, &desired).await?;
        Ok(())
    }

    fn routine_status(&self, state: &PeerState<'_, P>) -> Status {
        if !state.in_progress() {
            return Status::active("");
        }
        let local = state.local();
        let revision = local.binary_revision.as_deref().unwrap_or("unknown");
        status::running_during_upgrade(
            local.workload_version.as_deref().unwrap_or("unknown"),
            revision,
            revision != self.target_revision,
            self.versions.current().charm().unwrap_or("unknown"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{
        FakeCluster, FakePeerNetwork, FakePeerRelation, FakeRouterService,
        RecordingStatus, ServiceCall,
    };
    use crate::peer_state::APP_VERSIONS_KEY;
    use crate::test_util::{test_health_check_config, test_setup_log};

    const OLD: &str = "110";
    const TARGET: &str = "120";
    const OLD_VERSIONS: &str = r#"{"charm":"1.0.0","workload":"6.0.6"}"#;

    type TestReconciler = UpgradeReconciler<
        FakePeerRelation,
        FakeRouterService,
        FakeCluster,
        RecordingStatus,
    >;

    struct Harness {
        reconciler: TestReconciler,
        service: FakeRouterService,
        cluster: FakeCluster,
        status: RecordingStatus,
    }

    fn unit(n: u32) -> UnitName {
        UnitName::new("mongos", n)
    }

    fn harness(
        log: &Logger,
        network: &FakePeerNetwork,
        n: u32,
        charm: &str,
        workload: &str,
    ) -> Harness {
        let service = FakeRouterService::new(OLD);
        let cluster = FakeCluster::new();
        let status = RecordingStatus::new();
        let reconciler = UpgradeReconciler::new(
            log,
            UpgradeContext {
                unit: unit(n),
                target_revision: TARGET.to_string(),
                current_versions: Versions::new(charm, workload),
            },
            &test_health_check_config(),
            network.join(unit(n)),
            service.clone(),
            cluster.clone(),
            status.clone(),
        );
        Harness { reconciler, service, cluster, status }
    }

    /// Units at the old revision, with old versions recorded for the group.
    fn outdated_fleet(units: &[u32]) -> FakePeerNetwork {
        let network = FakePeerNetwork::new();
        for n in units {
            network.join(unit(*n));
            network.set_unit_value(&unit(*n), "binary_revision", OLD);
            network.set_unit_value(&unit(*n), "workload_version", "6.0.6");
            network.set_unit_value(&unit(*n), "state", "healthy");
        }
        network.set_app_value(APP_VERSIONS_KEY, OLD_VERSIONS);
        network
    }

    #[tokio::test]
    async fn fresh_install_without_group_versions_is_a_noop() {
        let logctx =
            test_setup_log("fresh_install_without_group_versions_is_a_noop");
        let network = FakePeerNetwork::new();
        let h = harness(&logctx.log, &network, 0, "1.0.0", "6.0.6");

        assert_eq!(
            h.reconciler.reconcile().await.unwrap(),
            Reconciled::VersionsUnset
        );
        assert_eq!(h.status.unit_publishes(), 0);
        assert_eq!(network.write_count(), 0);

        network.set_established(false);
        assert_eq!(
            h.reconciler.reconcile().await.unwrap(),
            Reconciled::NoPeerRelation
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn first_join_records_versions() {
        let logctx = test_setup_log("first_join_records_versions");
        let network = FakePeerNetwork::new();
        network.set_leader(&unit(0));
        let h = harness(&logctx.log, &network, 0, "1.0.0", "6.0.6");

        h.reconciler.on_peer_relation_created().await.unwrap();
        let bag = network.unit_bag(&unit(0));
        assert_eq!(bag["binary_revision"], TARGET);
        assert_eq!(bag["workload_version"], "6.0.6");
        assert_eq!(bag["state"], "healthy");
        assert_eq!(network.app_bag()[APP_VERSIONS_KEY], OLD_VERSIONS);

        assert_eq!(h.reconciler.reconcile().await.unwrap(), Reconciled::Settled);
        assert!(h.service.calls().is_empty());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn highest_unit_upgrades_and_passes_health_check() {
        let logctx =
            test_setup_log("highest_unit_upgrades_and_passes_health_check");
        let network = outdated_fleet(&[2, 1, 0]);
        network.set_leader(&unit(0));
        let h = harness(&logctx.log, &network, 2, "1.1.0", "6.0.7");

        assert_eq!(
            h.reconciler.reconcile().await.unwrap(),
            Reconciled::Upgraded
        );
        assert_eq!(
            h.service.calls(),
            [
                ServiceCall::Stop,
                ServiceCall::Install(TARGET.to_string()),
                ServiceCall::Start
            ]
        );
        let bag = network.unit_bag(&unit(2));
        assert_eq!(bag["state"], "upgrading");
        assert_eq!(bag["binary_revision"], TARGET);
        assert_eq!(bag["workload_version"], "6.0.7");
        // The precheck probed the cluster and cleaned up after itself.
        assert_eq!(h.cluster.dropped().len(), 1);

        assert_eq!(
            h.reconciler.post_upgrade_check().await.unwrap(),
            PostUpgradeCheck::Done
        );
        assert_eq!(network.unit_bag(&unit(2))["state"], "healthy");
        assert_eq!(
            h.status.unit(),
            status::running_during_upgrade("6.0.7", TARGET, false, "1.1.0")
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn lower_unit_waits_for_its_turn() {
        let logctx = test_setup_log("lower_unit_waits_for_its_turn");
        let network = outdated_fleet(&[2, 1, 0]);
        let h = harness(&logctx.log, &network, 1, "1.1.0", "6.0.7");

        assert_eq!(h.reconciler.reconcile().await.unwrap(), Reconciled::Waiting);
        assert!(h.service.calls().is_empty());
        assert_eq!(h.status.unit(), status::waiting_for_higher_units());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn reconcile_twice_publishes_once() {
        let logctx = test_setup_log("reconcile_twice_publishes_once");
        let network = outdated_fleet(&[2, 1, 0]);
        network.set_leader(&unit(1));
        let h = harness(&logctx.log, &network, 1, "1.1.0", "6.0.7");

        h.reconciler.reconcile().await.unwrap();
        let unit_publishes = h.status.unit_publishes();
        let app_publishes = h.status.app_publishes();
        let writes = network.write_count();
        let unit_status = h.status.unit();

        h.reconciler.reconcile().await.unwrap();
        assert_eq!(h.status.unit_publishes(), unit_publishes);
        assert_eq!(h.status.app_publishes(), app_publishes);
        assert_eq!(network.write_count(), writes);
        assert_eq!(h.status.unit(), unit_status);
        assert_eq!(h.status.app(), status::upgrade_in_progress());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn incompatible_upgrade_is_blocked() {
        let logctx = test_setup_log("incompatible_upgrade_is_blocked");
        let network = outdated_fleet(&[1, 0]);
        network.set_leader(&unit(1));
        let h = harness(&logctx.log, &network, 1, "1.1.0", "7.0.2");

        assert_eq!(
            h.reconciler.reconcile().await.unwrap(),
            Reconciled::Incompatible
        );
        assert!(h.service.calls().is_empty());
        assert_eq!(h.status.app(), status::incompatible());
        assert_eq!(network.app_bag()[APP_VERSIONS_KEY], OLD_VERSIONS);
        logctx.cleanup_successful();
    }

    /// Collects the message of every record logged through it.
    #[derive(Clone, Default)]
    struct CapturedMessages(std::sync::Arc<std::sync::Mutex<Vec<String>>>);

    impl slog::Drain for CapturedMessages {
        type Ok = ();
        type Err = slog::Never;

        fn log(
            &self,
            record: &slog::Record<'_>,
            _: &slog::OwnedKVList,
        ) -> Result<(), slog::Never> {
            self.0.lock().unwrap().push(record.msg().to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn incompatible_upgrade_tells_operator_how_to_force() {
        let messages = CapturedMessages::default();
        let log = Logger::root(messages.clone(), o!());
        let network = outdated_fleet(&[1, 0]);
        network.set_leader(&unit(1));
        let h = harness(&log, &network, 1, "1.1.0", "7.0.2");

        assert_eq!(
            h.reconciler.reconcile().await.unwrap(),
            Reconciled::Incompatible
        );
        let messages = messages.0.lock().unwrap();
        let hint = messages
            .iter()
            .find(|msg| msg.starts_with("upgrade incompatible"))
            .expect("incompatibility was logged");
        assert!(hint.contains("data loss"), "{hint}");
        assert!(hint.contains("`force-upgrade` action on each remaining unit"));
    }

    #[tokio::test]
    async fn unreadable_higher_unit_state_keeps_lower_unit_waiting() {
        let messages = CapturedMessages::default();
        let log = Logger::root(messages.clone(), o!());
        let network = outdated_fleet(&[2, 1, 0]);
        network.set_unit_value(&unit(2), "binary_revision", TARGET);
        network.set_unit_value(&unit(2), "state", "half-upgraded");
        let h = harness(&log, &network, 1, "1.1.0", "6.0.7");

        assert_eq!(h.reconciler.reconcile().await.unwrap(), Reconciled::Waiting);
        assert!(h.service.calls().is_empty());
        assert!(
            messages
                .0
                .lock()
                .unwrap()
                .iter()
                .any(|msg| msg.starts_with("ignoring unreadable peer state"))
        );

        // Once the higher unit reports a valid state the lower one proceeds.
        network.set_unit_value(&unit(2), "state", "healthy");
        assert_eq!(
            h.reconciler.reconcile().await.unwrap(),
            Reconciled::Upgraded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_precheck_blocks_the_first_unit() {
        let logctx = test_setup_log("failed_precheck_blocks_the_first_unit");
        let network = outdated_fleet(&[1, 0]);
        let h = harness(&logctx.log, &network, 1, "1.1.0", "6.0.7");
        h.cluster.fail_reads(true);

        assert_eq!(
            h.reconciler.reconcile().await.unwrap(),
            Reconciled::PrecheckFailed
        );
        assert!(h.service.calls().is_empty());
        assert_eq!(
            h.status.unit(),
            status::precheck_failed("router is not able to read/write.")
        );

        // Once the cluster recovers the precheck passes on the next pass.
        h.cluster.fail_reads(false);
        assert_eq!(
            h.reconciler.reconcile().await.unwrap(),
            Reconciled::Upgraded
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn precheck_is_skipped_without_upstream_cluster() {
        let logctx =
            test_setup_log("precheck_is_skipped_without_upstream_cluster");
        let network = outdated_fleet(&[0]);
        let h = harness(&logctx.log, &network, 0, "1.1.0", "6.0.7");
        h.cluster.set_configured(false);
        h.cluster.set_reachable(false);

        h.reconciler.pre_upgrade_check().await.unwrap();
        assert_eq!(
            h.reconciler.reconcile().await.unwrap(),
            Reconciled::Upgraded
        );
        assert_eq!(
            h.reconciler.post_upgrade_check().await.unwrap(),
            PostUpgradeCheck::Done
        );
        assert_eq!(network.unit_bag(&unit(0))["state"], "healthy");
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_router_defers_the_post_upgrade_check() {
        let logctx =
            test_setup_log("unhealthy_router_defers_the_post_upgrade_check");
        let network = outdated_fleet(&[0]);
        let h = harness(&logctx.log, &network, 0, "1.1.0", "6.0.7");
        assert_eq!(
            h.reconciler.reconcile().await.unwrap(),
            Reconciled::Upgraded
        );

        h.service.set_running(false);
        assert_eq!(
            h.reconciler.post_upgrade_check().await.unwrap(),
            PostUpgradeCheck::Deferred
        );
        assert_eq!(h.status.unit(), status::waiting_for_router());

        h.service.set_running(true);
        h.cluster.fail_reads(true);
        assert_eq!(
            h.reconciler.post_upgrade_check().await.unwrap(),
            PostUpgradeCheck::Deferred
        );
        assert_eq!(h.status.unit(), status::unhealthy_after_upgrade());
        assert_eq!(network.unit_bag(&unit(0))["state"], "upgrading");

        // The unhealthy status outranks routine upgrade status.
        h.reconciler.reconcile().await.unwrap();
        assert_eq!(h.status.unit(), status::unhealthy_after_upgrade());

        h.cluster.fail_reads(false);
        assert_eq!(
            h.reconciler.post_upgrade_check().await.unwrap(),
            PostUpgradeCheck::Done
        );
        assert_eq!(network.unit_bag(&unit(0))["state"], "healthy");
        assert_eq!(h.status.unit(), Status::active(""));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn other_subsystem_status_is_left_alone() {
        let logctx = test_setup_log("other_subsystem_status_is_left_alone");
        let network = outdated_fleet(&[1, 0]);
        let h = harness(&logctx.log, &network, 0, "1.1.0", "6.0.7");
        let tls = Status::blocked("missing TLS certificate");
        h.status.set_unit(tls.clone());

        assert_eq!(h.reconciler.reconcile().await.unwrap(), Reconciled::Waiting);
        assert_eq!(h.status.unit(), tls);
        assert_eq!(h.status.unit_publishes(), 0);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn force_upgrade_requires_an_upgrade_in_progress() {
        let logctx =
            test_setup_log("force_upgrade_requires_an_upgrade_in_progress");
        let network = FakePeerNetwork::new();
        network.join(unit(0));
        network.set_unit_value(&unit(0), "binary_revision", TARGET);
        network.set_unit_value(&unit(0), "state", "healthy");
        let h = harness(&logctx.log, &network, 0, "1.0.0", "6.0.6");

        let err = h.reconciler.force_upgrade().await.unwrap_err();
        assert_eq!(err.to_string(), "No upgrade in progress");
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn force_upgrade_bypasses_sequencing() {
        let logctx = test_setup_log("force_upgrade_bypasses_sequencing");
        let network = outdated_fleet(&[2, 1, 0]);
        let h = harness(&logctx.log, &network, 0, "1.1.0", "6.0.7");
        assert_eq!(h.reconciler.reconcile().await.unwrap(), Reconciled::Waiting);

        let message = h.reconciler.force_upgrade().await.unwrap();
        assert_eq!(message, "Forcefully upgraded mongos/0");
        assert_eq!(h.service.installed(), TARGET);

        let err = h.reconciler.force_upgrade().await.unwrap_err();
        assert_eq!(err.to_string(), "Unit already upgraded");
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn failed_install_leaves_unit_outdated() {
        let logctx = test_setup_log("failed_install_leaves_unit_outdated");
        let network = outdated_fleet(&[0]);
        let h = harness(&logctx.log, &network, 0, "1.1.0", "6.0.7");
        h.cluster.set_configured(false);
        h.service.fail_install(true);

        let err = h.reconciler.reconcile().await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::RouterService(RouterServiceError::Install { .. })
        ));
        let bag = network.unit_bag(&unit(0));
        assert_eq!(bag["state"], "upgrading");
        assert_eq!(bag["binary_revision"], OLD);

        // Nothing is verified until the new revision is in place.
        assert_eq!(
            h.reconciler.post_upgrade_check().await.unwrap(),
            PostUpgradeCheck::Done
        );
        assert_eq!(network.unit_bag(&unit(0))["state"], "upgrading");

        h.service.fail_install(false);
        assert_eq!(
            h.reconciler.reconcile().await.unwrap(),
            Reconciled::Upgraded
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn charm_upgrade_only_reconciles_on_leader() {
        let logctx = test_setup_log("charm_upgrade_only_reconciles_on_leader");
        let network = outdated_fleet(&[1, 0]);
        network.set_leader(&unit(0));
        let follower = harness(&logctx.log, &network, 1, "1.1.0", "6.0.7");
        let leader = harness(&logctx.log, &network, 0, "1.1.0", "6.0.7");

        assert_eq!(
            follower.reconciler.on_charm_upgraded().await.unwrap(),
            Reconciled::NotLeader
        );
        assert!(follower.service.calls().is_empty());
        assert_eq!(
            leader.reconciler.on_charm_upgraded().await.unwrap(),
            Reconciled::Waiting
        );
        assert_eq!(leader.status.app(), status::upgrade_in_progress());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn leader_records_new_versions_once_upgrade_completes() {
        let logctx = test_setup_log(
            "leader_records_new_versions_once_upgrade_completes",
        );
        let network = FakePeerNetwork::new();
        network.set_leader(&unit(0));
        for n in [1, 0] {
            network.join(unit(n));
            network.set_unit_value(&unit(n), "binary_revision", TARGET);
            network.set_unit_value(&unit(n), "state", "healthy");
        }
        network.set_app_value(APP_VERSIONS_KEY, OLD_VERSIONS);
        let h = harness(&logctx.log, &network, 0, "1.1.0", "6.0.7");

        assert_eq!(h.reconciler.reconcile().await.unwrap(), Reconciled::Settled);
        assert_eq!(
            network.app_bag()[APP_VERSIONS_KEY],
            r#"{"charm":"1.1.0","workload":"6.0.7"}"#
        );
        assert_eq!(h.status.app(), Status::active(""));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn feature_compatibility_version_is_set_through_router() {
        let logctx = test_setup_log(
            "feature_compatibility_version_is_set_through_router",
        );
        let network = FakePeerNetwork::new();
        let h = harness(&logctx.log, &network, 0, "1.1.0", "7.0.2");

        h.reconciler.set_feature_compatibility_version("7.0").await.unwrap();
        assert_eq!(
            h.cluster.admin_commands(),
            [json!({ "setFeatureCompatibilityVersion": "7.0" })]
        );
        logctx.cleanup_successful();
    }
}

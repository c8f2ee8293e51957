// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A runnable async task that owns a unit's [`UpgradeReconciler`].
//!
//! Signals and operator actions reach the reconciler one at a time through
//! an [`UpgradeTaskHandle`], so no two reconcile passes on the same unit
//! ever overlap. Work that cannot finish yet (a post-upgrade check on a
//! router that is still starting) is deferred and retried on a timer.

use crate::authorization::PrecheckFailed;
use crate::health::ClusterConnector;
use crate::peer_state::PeerRelation;
use crate::reconciler::{
    ForceUpgradeError, PostUpgradeCheck, ReconcileError, Reconciled,
    UpgradeReconciler,
};
use crate::service::RouterService;
use crate::status::StatusChannel;
use serde::{Deserialize, Serialize};
use slog::{Logger, debug, error, info, o, warn};
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::oneshot::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// We only expect a handful of requests at a time.
const API_CHANNEL_BOUND: usize = 32;

/// A lifecycle event delivered to the unit by the orchestrator.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Signal {
    /// The unit joined the peer relation.
    PeerRelationCreated,
    /// Some unit's or the application's peer state changed.
    PeerRelationChanged,
    /// New agent code was installed on this unit.
    CharmUpgraded,
    /// Periodic status refresh.
    UpdateStatus,
    /// Verify the router after this unit's binary swap.
    PostUpgradeCheck,
}

/// A request sent to the [`UpgradeTask`] from an [`UpgradeTaskHandle`]
pub enum UpgradeApiRequest {
    /// Handle a signal and any follow-up work it causes
    Signal { signal: Signal, tx: oneshot::Sender<Result<(), ReconcileError>> },

    /// Upgrade the local unit now, bypassing authorization
    ForceUpgrade { tx: oneshot::Sender<Result<String, ForceUpgradeError>> },

    /// Check whether the cluster can take an upgrade
    PreUpgradeCheck { tx: oneshot::Sender<Result<(), PrecheckFailed>> },

    SetFeatureCompatibilityVersion {
        version: String,
        tx: oneshot::Sender<Result<(), ReconcileError>>,
    },

    /// List signals waiting to be retried
    Deferred { tx: oneshot::Sender<Vec<Signal>> },

    /// Stop the task, returning the signals that were still deferred
    Shutdown { tx: oneshot::Sender<Vec<Signal>> },
}

/// An error response from an [`UpgradeApiRequest`]
#[derive(Debug, Error)]
pub enum TaskApiError {
    #[error("failed to send request to upgrade task")]
    Send,
    #[error("failed to receive response from upgrade task")]
    Recv,
    #[error(transparent)]
    ForceUpgrade(#[from] ForceUpgradeError),
    #[error("pre-upgrade check failed: {0}")]
    Precheck(#[from] PrecheckFailed),
    #[error("failed to reconcile upgrade")]
    Reconcile(#[from] ReconcileError),
}

impl<T> From<SendError<T>> for TaskApiError {
    fn from(_: SendError<T>) -> Self {
        TaskApiError::Send
    }
}

impl From<RecvError> for TaskApiError {
    fn from(_: RecvError) -> Self {
        TaskApiError::Recv
    }
}

#[derive(Debug, Clone)]
pub struct UpgradeTaskHandle {
    tx: mpsc::Sender<UpgradeApiRequest>,
}

impl UpgradeTaskHandle {
    /// Deliver `signal` and wait until it and its follow-up work are handled.
    pub async fn signal(&self, signal: Signal) -> Result<(), TaskApiError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(UpgradeApiRequest::Signal { signal, tx }).await?;
        rx.await??;
        Ok(())
    }

    /// Returns the message reported to the operator on success.
    pub async fn force_upgrade(&self) -> Result<String, TaskApiError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(UpgradeApiRequest::ForceUpgrade { tx }).await?;
        let message = rx.await??;
        Ok(message)
    }

    pub async fn pre_upgrade_check(&self) -> Result<(), TaskApiError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(UpgradeApiRequest::PreUpgradeCheck { tx }).await?;
        rx.await??;
        Ok(())
    }

    pub async fn set_feature_compatibility_version(
        &self,
        version: &str,
    ) -> Result<(), TaskApiError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(UpgradeApiRequest::SetFeatureCompatibilityVersion {
                version: version.to_string(),
                tx,
            })
            .await?;
        rx.await??;
        Ok(())
    }

    pub async fn deferred(&self) -> Result<Vec<Signal>, TaskApiError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(UpgradeApiRequest::Deferred { tx }).await?;
        let res = rx.await?;
        Ok(res)
    }

    /// Stop the task. Returns the signals that were deferred and never
    /// retried, so that they can be persisted for the next run.
    pub async fn shutdown(&self) -> Result<Vec<Signal>, TaskApiError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(UpgradeApiRequest::Shutdown { tx }).await?;
        let res = rx.await?;
        Ok(res)
    }
}

pub struct UpgradeTask<P, S, C, T> {
    shutdown: bool,
    log: Logger,
    reconciler: UpgradeReconciler<P, S, C, T>,
    retry_interval: Duration,
    /// Signals to retry, with when to retry them.
    deferred: BTreeMap<Signal, Instant>,

    // Handle requests received from `UpgradeTaskHandle`
    rx: mpsc::Receiver<UpgradeApiRequest>,
}

impl<P, S, C, T> UpgradeTask<P, S, C, T>
where
    P: PeerRelation,
    S: RouterService,
    C: ClusterConnector,
    T: StatusChannel,
{
    /// `retry_interval` is how long a deferred signal waits before it is
    /// retried.
    pub fn new(
        log: &Logger,
        reconciler: UpgradeReconciler<P, S, C, T>,
        retry_interval: Duration,
    ) -> (UpgradeTask<P, S, C, T>, UpgradeTaskHandle) {
        let log = log.new(o!(
            "component" => "UpgradeTask",
            "unit" => reconciler.unit().to_string(),
        ));
        let (tx, rx) = mpsc::channel(API_CHANNEL_BOUND);
        (
            UpgradeTask {
                shutdown: false,
                log,
                reconciler,
                retry_interval,
                deferred: BTreeMap::new(),
                rx,
            },
            UpgradeTaskHandle { tx },
        )
    }

    /// Run the main loop of the task
    ///
    /// This should be spawned into its own tokio task. It returns once
    /// shut down or once every handle has been dropped.
    pub async fn run(mut self) {
        while !self.shutdown {
            let due = self.next_deferred();
            tokio::select! {
                request = self.rx.recv() => {
                    let Some(request) = request else {
                        debug!(self.log, "all handles dropped; exiting");
                        break;
                    };
                    self.on_api_request(request).await;
                }
                signal = wait_for(due) => {
                    self.deferred.remove(&signal);
                    debug!(self.log, "retrying deferred signal"; "signal" => ?signal);
                    // Failures are logged and, where retryable, re-deferred.
                    let _ = self.handle_signal(signal).await;
                }
            }
        }
    }

    fn next_deferred(&self) -> Option<(Signal, Instant)> {
        self.deferred
            .iter()
            .min_by_key(|(_, at)| **at)
            .map(|(signal, at)| (*signal, *at))
    }

    fn defer(&mut self, signal: Signal) {
        let at = Instant::now() + self.retry_interval;
        let at = *self.deferred.entry(signal).or_insert(at);
        info!(
            self.log,
            "deferring signal";
            "signal" => ?signal,
            "retry_in" => ?at.saturating_duration_since(Instant::now()),
        );
    }

    async fn on_api_request(&mut self, request: UpgradeApiRequest) {
        match request {
            UpgradeApiRequest::Signal { signal, tx } => {
                // A delivered signal supersedes a pending retry of itself.
                self.deferred.remove(&signal);
                let res = self.handle_signal(signal).await;
                let _ = tx.send(res);
            }
            UpgradeApiRequest::ForceUpgrade { tx } => {
                let res = self.reconciler.force_upgrade().await;
                let upgraded = res.is_ok();
                let _ = tx.send(res);
                if upgraded {
                    let _ = self.handle_signal(Signal::PostUpgradeCheck).await;
                }
            }
            UpgradeApiRequest::PreUpgradeCheck { tx } => {
                let _ = tx.send(self.reconciler.pre_upgrade_check().await);
            }
            UpgradeApiRequest::SetFeatureCompatibilityVersion {
                version,
                tx,
            } => {
                let res = self
                    .reconciler
                    .set_feature_compatibility_version(&version)
                    .await;
                let _ = tx.send(res);
            }
            UpgradeApiRequest::Deferred { tx } => {
                let _ = tx.send(self.deferred.keys().copied().collect());
            }
            UpgradeApiRequest::Shutdown { tx } => {
                info!(self.log, "shutting down");
                self.shutdown = true;
                let _ = tx.send(self.deferred.keys().copied().collect());
            }
        }
    }

    /// Handle `signal` and then whatever follow-up it produces.
    ///
    /// Returns the first error hit along the way.
    async fn handle_signal(
        &mut self,
        signal: Signal,
    ) -> Result<(), ReconcileError> {
        let mut result = Ok(());
        let mut next = Some(signal);
        while let Some(signal) = next.take() {
            match self.dispatch(signal).await {
                Ok(follow_up) => next = follow_up,
                Err(err) => {
                    error!(
                        self.log,
                        "failed to handle signal";
                        "signal" => ?signal,
                        "error" => InlineErrorChain::new(&err),
                    );
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }
        result
    }

    async fn dispatch(
        &mut self,
        signal: Signal,
    ) -> Result<Option<Signal>, ReconcileError> {
        debug!(self.log, "handling signal"; "signal" => ?signal);
        let reconciled = match signal {
            Signal::PeerRelationCreated => {
                self.reconciler.on_peer_relation_created().await?;
                return Ok(None);
            }
            Signal::PeerRelationChanged | Signal::UpdateStatus => {
                self.reconciler.reconcile().await?
            }
            Signal::CharmUpgraded => self.reconciler.on_charm_upgraded().await?,
            Signal::PostUpgradeCheck => {
                match self.reconciler.post_upgrade_check().await {
                    Ok(PostUpgradeCheck::Done) => {}
                    Ok(PostUpgradeCheck::Deferred) => self.defer(signal),
                    Err(err) => {
                        warn!(self.log, "post-upgrade check failed; will retry");
                        self.defer(signal);
                        return Err(err);
                    }
                }
                return Ok(None);
            }
        };
        debug!(self.log, "reconciled"; "outcome" => ?reconciled);
        Ok((reconciled == Reconciled::Upgraded)
            .then_some(Signal::PostUpgradeCheck))
    }
}

/// Resolve with `due`'s signal once its time comes, or never if nothing is
/// deferred.
async fn wait_for(due: Option<(Signal, Instant)>) -> Signal {
    match due {
        Some((signal, at)) => {
            tokio::time::sleep_until(at).await;
            signal
        }
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{
        FakeCluster, FakePeerNetwork, FakeRouterService, RecordingStatus,
    };
    use crate::peer_state::APP_VERSIONS_KEY;
    use crate::reconciler::UpgradeContext;
    use crate::test_util::{test_health_check_config, test_setup_log};
    use router_agent_types::{UnitName, Versions};

    const RETRY: Duration = Duration::from_secs(30);

    struct Harness {
        handle: UpgradeTaskHandle,
        service: FakeRouterService,
        cluster: FakeCluster,
    }

    fn unit(n: u32) -> UnitName {
        UnitName::new("mongos", n)
    }

    /// A single outdated unit whose upgrade is ready to go.
    fn outdated_unit() -> FakePeerNetwork {
        let network = FakePeerNetwork::new();
        network.join(unit(0));
        network.set_unit_value(&unit(0), "binary_revision", "110");
        network.set_unit_value(&unit(0), "state", "healthy");
        network
            .set_app_value(APP_VERSIONS_KEY, r#"{"charm":"1.0.0","workload":"6.0.6"}"#);
        network
    }

    fn spawn_task(log: &Logger, network: &FakePeerNetwork) -> Harness {
        let service = FakeRouterService::new("110");
        let cluster = FakeCluster::new();
        let reconciler = UpgradeReconciler::new(
            log,
            UpgradeContext {
                unit: unit(0),
                target_revision: "120".to_string(),
                current_versions: Versions::new("1.1.0", "6.0.7"),
            },
            &test_health_check_config(),
            network.join(unit(0)),
            service.clone(),
            cluster.clone(),
            RecordingStatus::new(),
        );
        let (task, handle) = UpgradeTask::new(log, reconciler, RETRY);
        tokio::spawn(task.run());
        Harness { handle, service, cluster }
    }

    #[tokio::test(start_paused = true)]
    async fn post_upgrade_check_is_retried_until_router_is_up() {
        let logctx =
            test_setup_log("post_upgrade_check_is_retried_until_router_is_up");
        let network = outdated_unit();
        let h = spawn_task(&logctx.log, &network);
        h.service.stay_down(true);

        h.handle.signal(Signal::PeerRelationChanged).await.unwrap();
        assert_eq!(network.unit_bag(&unit(0))["state"], "upgrading");
        assert_eq!(
            h.handle.deferred().await.unwrap(),
            [Signal::PostUpgradeCheck]
        );

        // Still down at the first retry.
        tokio::time::sleep(RETRY + Duration::from_secs(1)).await;
        assert_eq!(
            h.handle.deferred().await.unwrap(),
            [Signal::PostUpgradeCheck]
        );

        h.service.set_running(true);
        tokio::time::sleep(RETRY).await;
        assert!(h.handle.deferred().await.unwrap().is_empty());
        assert_eq!(network.unit_bag(&unit(0))["state"], "healthy");

        assert!(h.handle.shutdown().await.unwrap().is_empty());
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_returns_pending_retries() {
        let logctx = test_setup_log("shutdown_returns_pending_retries");
        let network = outdated_unit();
        network.set_leader(&unit(0));
        let h = spawn_task(&logctx.log, &network);
        h.service.stay_down(true);

        h.handle.signal(Signal::CharmUpgraded).await.unwrap();
        assert_eq!(
            h.handle.shutdown().await.unwrap(),
            [Signal::PostUpgradeCheck]
        );
        // The task is gone.
        assert!(matches!(
            h.handle.signal(Signal::UpdateStatus).await,
            Err(TaskApiError::Send | TaskApiError::Recv)
        ));
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn force_upgrade_runs_post_upgrade_check() {
        let logctx = test_setup_log("force_upgrade_runs_post_upgrade_check");
        let network = outdated_unit();
        // A higher unit that never upgrades holds this one back.
        network.join(unit(1));
        network.set_unit_value(&unit(1), "binary_revision", "110");
        network.set_unit_value(&unit(1), "state", "healthy");
        let h = spawn_task(&logctx.log, &network);

        h.handle.signal(Signal::UpdateStatus).await.unwrap();
        assert!(h.service.calls().is_empty());

        let message = h.handle.force_upgrade().await.unwrap();
        assert_eq!(message, "Forcefully upgraded mongos/0");
        // The check runs before the next request is served.
        assert!(h.handle.deferred().await.unwrap().is_empty());
        assert_eq!(network.unit_bag(&unit(0))["state"], "healthy");

        let err = h.handle.force_upgrade().await.unwrap_err();
        assert_eq!(err.to_string(), "Unit already upgraded");
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn action_errors_reach_the_caller() {
        let logctx = test_setup_log("action_errors_reach_the_caller");
        let network = outdated_unit();
        let h = spawn_task(&logctx.log, &network);
        h.cluster.fail_reads(true);

        let err = h.handle.pre_upgrade_check().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "pre-upgrade check failed: router is not able to read/write."
        );

        h.cluster.set_reachable(false);
        let err = h
            .handle
            .set_feature_compatibility_version("7.0")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TaskApiError::Reconcile(ReconcileError::Connection(_))
        ));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn task_exits_when_handles_are_dropped() {
        let logctx = test_setup_log("task_exits_when_handles_are_dropped");
        let network = outdated_unit();
        let service = FakeRouterService::new("110");
        let reconciler = UpgradeReconciler::new(
            &logctx.log,
            UpgradeContext {
                unit: unit(0),
                target_revision: "120".to_string(),
                current_versions: Versions::new("1.1.0", "6.0.7"),
            },
            &test_health_check_config(),
            network.join(unit(0)),
            service,
            FakeCluster::new(),
            RecordingStatus::new(),
        );
        let (task, handle) = UpgradeTask::new(&logctx.log, reconciler, RETRY);
        let join = tokio::spawn(task.run());
        drop(handle);
        join.await.unwrap();
        logctx.cleanup_successful();
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sequencing upgrades across units.
//!
//! Units upgrade strictly one at a time, highest unit number first. A unit
//! is authorized only when every unit numbered above it has recorded the
//! target binary revision and reports healthy. The highest unit goes first,
//! after a pre-upgrade check of the cluster unless the group is rolling back.

use crate::peer_state::{PeerRelation, PeerState};
use crate::status;
use router_agent_types::{Status, UnitName, UnitState, Versions};
use slog::{Logger, debug, info, o};
use std::future::Future;
use thiserror::Error;

/// The cluster is not ready for the first unit to upgrade.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct PrecheckFailed {
    pub reason: String,
}

impl PrecheckFailed {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    /// The blocked status shown to the operator.
    pub fn status(&self) -> Status {
        status::precheck_failed(&self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// This unit is the highest-numbered unit and goes first.
    First {
        /// False when the group's recorded charm version is the one this
        /// unit is running, which only happens on rollback.
        run_precheck: bool,
    },
    /// Every higher unit is upgraded and healthy.
    Authorized,
    /// `on` is a higher unit that has not finished upgrading.
    Waiting { on: UnitName },
    /// The local unit is missing from peer state.
    NotFound,
}

/// Decide whether the local unit may upgrade now.
///
/// Only the units above the local one are consulted; the caller decides
/// whether the local unit needs an upgrade at all.
pub fn decide<P: PeerRelation>(
    state: &PeerState<'_, P>,
    current: &Versions,
) -> Decision {
    let target = state.target_revision();
    for (index, (unit, record)) in state.units_descending().into_iter().enumerate()
    {
        if unit == state.local_unit() {
            if index > 0 {
                return Decision::Authorized;
            }
            let recorded_charm = state
                .app_versions()
                .ok()
                .flatten()
                .and_then(|versions| versions.charm().map(str::to_string));
            let rollback = recorded_charm.is_some()
                && recorded_charm.as_deref() == current.charm();
            return Decision::First { run_precheck: !rollback };
        }

        let upgraded = record.binary_revision.as_deref() == Some(target);
        let healthy = record.state == Some(UnitState::Healthy);
        if !upgraded || !healthy {
            return Decision::Waiting { on: unit.clone() };
        }
    }
    Decision::NotFound
}

pub struct AuthorizationSequencer {
    log: Logger,
}

impl AuthorizationSequencer {
    pub fn new(log: &Logger) -> Self {
        Self { log: log.new(o!("component" => "AuthorizationSequencer")) }
    }

    /// Returns whether the local unit may upgrade now, running `precheck`
    /// first when it is the first unit to go.
    pub async fn is_authorized<P, F, Fut>(
        &self,
        state: &PeerState<'_, P>,
        current: &Versions,
        precheck: F,
    ) -> Result<bool, PrecheckFailed>
    where
        P: PeerRelation,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), PrecheckFailed>>,
    {
        match decide(state, current) {
            Decision::First { run_precheck: false } => {
                debug!(self.log, "rollback detected; skipping pre-upgrade check");
                Ok(true)
            }
            Decision::First { run_precheck: true } => {
                precheck().await?;
                info!(self.log, "pre-upgrade check passed");
                Ok(true)
            }
            Decision::Authorized => Ok(true),
            Decision::Waiting { on } => {
                debug!(
                    self.log,
                    "waiting for higher unit to upgrade";
                    "unit" => %on,
                );
                Ok(false)
            }
            Decision::NotFound => {
                debug!(self.log, "local unit missing from peer state");
                Ok(false)
            }
        }
    }
}

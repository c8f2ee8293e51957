// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recording this unit's and the group's software versions in peer state.

use crate::peer_state::{
    LeaderToken, PeerRelation, PeerState, PeerStateError, UnitKey,
};
use router_agent_types::{UnitState, Versions};
use slog::{Logger, debug, info, o};

pub struct VersionStore {
    log: Logger,
    current: Versions,
}

impl VersionStore {
    /// `current` is the charm and workload versions of this build.
    pub fn new(log: &Logger, current: Versions) -> Self {
        Self { log: log.new(o!("component" => "VersionStore")), current }
    }

    pub fn current(&self) -> &Versions {
        &self.current
    }

    /// Record this unit's binary revision and workload version the first
    /// time it joins the peer group.
    ///
    /// Does nothing if a revision is already recorded. Returns whether
    /// anything was written.
    pub async fn record_initial_versions<P: PeerRelation>(
        &self,
        state: &mut PeerState<'_, P>,
    ) -> Result<bool, PeerStateError> {
        if state.local().binary_revision.is_some() {
            return Ok(false);
        }

        let revision = state.target_revision().to_string();
        let workload = self.current.workload().unwrap_or_default().to_string();
        state.set_local(UnitKey::BinaryRevision, &revision).await?;
        state.set_local(UnitKey::WorkloadVersion, &workload).await?;
        if state.local().state.is_none() {
            state.set_local_state(UnitState::Healthy).await?;
        }
        info!(
            self.log,
            "recorded versions after first install";
            "binary_revision" => revision,
            "workload_version" => workload,
        );
        Ok(true)
    }

    /// Record this build's versions as the group's versions.
    ///
    /// The recorded versions are what the next upgrade is checked against,
    /// so they must never move while an upgrade is in progress.
    ///
    /// # Panics
    ///
    /// Panics if an upgrade is in progress.
    pub async fn set_group_versions<P: PeerRelation>(
        &self,
        state: &mut PeerState<'_, P>,
        token: &LeaderToken,
    ) -> Result<(), PeerStateError> {
        assert!(
            !state.in_progress(),
            "group versions must not change while an upgrade is in progress"
        );
        if state.app_versions().ok().flatten().as_ref() == Some(&self.current) {
            return Ok(());
        }
        debug!(self.log, "setting group versions"; "versions" => ?self.current);
        state.set_app_versions(token, &self.current).await?;
        info!(self.log, "set group versions"; "versions" => ?self.current);
        Ok(())
    }

    pub fn group_versions_recorded<P: PeerRelation>(
        &self,
        state: &PeerState<'_, P>,
    ) -> bool {
        state.app_versions_recorded()
    }
}

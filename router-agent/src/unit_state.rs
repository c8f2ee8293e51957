// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transitions of the local unit's published upgrade state.

use crate::peer_state::{PeerRelation, PeerState, PeerStateError};
use router_agent_types::UnitState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UnitStateError {
    #[error("invalid unit state transition from {} to {to}", display_state(.from))]
    InvalidTransition { from: Option<UnitState>, to: UnitState },
    #[error(transparent)]
    PeerState(#[from] PeerStateError),
}

fn display_state(state: &Option<UnitState>) -> &'static str {
    state.map_or("<unset>", |state| state.as_str())
}

/// Whether the local unit may move from `from` (its effective state) to
/// `to`.
pub fn can_transition(from: Option<UnitState>, to: UnitState) -> bool {
    use UnitState::*;
    matches!(
        (from, to),
        (None | Some(Healthy | Upgrading | Restarting), Healthy)
            | (Some(Outdated), Upgrading)
    )
}

/// The local unit's upgrade state, read from and written to its own bag.
pub struct UnitStateMachine<'s, 'a, P> {
    state: &'s mut PeerState<'a, P>,
}

impl<'s, 'a, P: PeerRelation> UnitStateMachine<'s, 'a, P> {
    pub fn new(state: &'s mut PeerState<'a, P>) -> Self {
        Self { state }
    }

    /// The effective state, which is `Outdated` whenever the unit's
    /// recorded binary revision is not the target.
    pub fn current(&self) -> Option<UnitState> {
        self.state.local_state()
    }

    /// Enter `Upgrading`, immediately before the binary swap.
    pub async fn begin_upgrade(&mut self) -> Result<(), UnitStateError> {
        self.transition(UnitState::Upgrading).await
    }

    /// Enter `Healthy`, after the post-upgrade check or on first join.
    pub async fn mark_healthy(&mut self) -> Result<(), UnitStateError> {
        self.transition(UnitState::Healthy).await
    }

    async fn transition(&mut self, to: UnitState) -> Result<(), UnitStateError> {
        let from = self.current();
        if !can_transition(from, to) {
            return Err(UnitStateError::InvalidTransition { from, to });
        }
        if self.state.local().state == Some(to) {
            return Ok(());
        }
        self.state.set_local_state(to).await?;
        Ok(())
    }
}

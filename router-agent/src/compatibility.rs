// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deciding whether this build may upgrade from the group's recorded
//! versions.
//!
//! Upgrades may move forward within a major version. Anything else (a
//! downgrade of any component, a change of major version, or a record that
//! cannot be read) is refused, since the router's on-disk and wire formats
//! are only guaranteed stable within a major version.

use crate::peer_state::{PeerRelation, PeerState};
use router_agent_types::{ComponentVersion, VersionParseError, Versions};
use thiserror::Error;

/// Which side of the comparison a version came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Recorded,
    Current,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Recorded => f.write_str("recorded"),
            Side::Current => f.write_str("current"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Incompatibility {
    #[error("no group versions recorded")]
    NotRecorded,
    #[error("recorded group versions are unreadable: {0}")]
    Unreadable(String),
    #[error("{side} versions have no {component:?} version")]
    MissingComponent { side: Side, component: &'static str },
    #[error("{side} {component} version is invalid")]
    InvalidVersion {
        side: Side,
        component: &'static str,
        #[source]
        err: VersionParseError,
    },
    #[error("{component} would downgrade from {recorded} to {current}")]
    Downgrade { component: &'static str, recorded: String, current: String },
    #[error("{component} would change major version from {recorded} to {current}")]
    MajorVersionChange {
        component: &'static str,
        recorded: String,
        current: String,
    },
}

fn parse(
    versions: &Versions,
    side: Side,
    component: &'static str,
) -> Result<ComponentVersion, Incompatibility> {
    let raw = versions
        .get(component)
        .ok_or(Incompatibility::MissingComponent { side, component })?;
    ComponentVersion::parse(raw)
        .map_err(|err| Incompatibility::InvalidVersion { side, component, err })
}

/// Compare `recorded` group versions against `current`, failing closed.
pub fn check(
    recorded: Option<&Versions>,
    current: &Versions,
) -> Result<(), Incompatibility> {
    let recorded = recorded.ok_or(Incompatibility::NotRecorded)?;
    for component in Versions::REQUIRED {
        let previous = parse(recorded, Side::Recorded, component)?;
        let next = parse(current, Side::Current, component)?;
        if previous > next {
            return Err(Incompatibility::Downgrade {
                component,
                recorded: previous.to_string(),
                current: next.to_string(),
            });
        }
        if previous.major() != next.major() {
            return Err(Incompatibility::MajorVersionChange {
                component,
                recorded: previous.to_string(),
                current: next.to_string(),
            });
        }
    }
    Ok(())
}

/// Check this build's versions against the group record in `state`.
pub fn check_peer_state<P: PeerRelation>(
    state: &PeerState<'_, P>,
    current: &Versions,
) -> Result<(), Incompatibility> {
    let recorded = state
        .app_versions()
        .map_err(|err| Incompatibility::Unreadable(err.to_string()))?;
    check(recorded.as_ref(), current)
}

pub fn is_compatible(recorded: Option<&Versions>, current: &Versions) -> bool {
    check(recorded, current).is_ok()
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed access to the key-value state units share over the peer relation.
//!
//! Each unit owns one bag that only it may write, and the application owns
//! one bag that only the leader may write. [`PeerRelation`] is the narrow
//! interface to the transport; [`PeerState`] is a per-pass snapshot of every
//! bag with typed accessors. A [`WriteScope`] cannot name a remote unit, so
//! nothing built on this module can write another unit's record.

use crate::backends::ExecutionError;
use router_agent_types::{UnitName, UnitState, Versions};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use thiserror::Error;

/// Key in a unit's own bag holding its [`UnitState`].
pub const UNIT_STATE_KEY: &str = "state";

/// Keys in a unit's own bag that hold plain strings. The unit's state is
/// written through [`PeerState::set_local_state`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKey {
    BinaryRevision,
    WorkloadVersion,
}

impl UnitKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKey::BinaryRevision => "binary_revision",
            UnitKey::WorkloadVersion => "workload_version",
        }
    }
}

/// Key in the application bag holding the group's [`Versions`] as JSON.
pub const APP_VERSIONS_KEY: &str = "versions";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadScope {
    Unit(UnitName),
    App,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteScope {
    /// The calling unit's own bag.
    LocalUnit,
    /// The application bag. Only the leader may write it.
    App,
}

#[derive(Debug, Error)]
pub enum PeerStateError {
    #[error("peer relation is not established")]
    NotReady,
    #[error("only the leader may write application peer state")]
    NotLeader,
    #[error("invalid {key:?} value {value:?} in peer state of {scope}")]
    InvalidRecord {
        scope: String,
        key: &'static str,
        value: String,
        #[source]
        err: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error(transparent)]
    Tool(#[from] ExecutionError),
}

/// The transport carrying peer state between units.
pub trait PeerRelation: Send + Sync {
    fn relation_established(
        &self,
    ) -> impl Future<Output = Result<bool, PeerStateError>> + Send;

    fn is_leader(
        &self,
    ) -> impl Future<Output = Result<bool, PeerStateError>> + Send;

    /// Remote units currently in the relation, not including the local unit.
    fn peer_units(
        &self,
    ) -> impl Future<Output = Result<BTreeSet<UnitName>, PeerStateError>> + Send;

    fn read(
        &self,
        scope: ReadScope,
    ) -> impl Future<Output = Result<BTreeMap<String, String>, PeerStateError>>
    + Send;

    fn write(
        &self,
        scope: WriteScope,
        key: &str,
        value: &str,
    ) -> impl Future<Output = Result<(), PeerStateError>> + Send;
}

/// One unit's record as read from its bag. Every field may be absent while
/// a unit is still joining.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitRecord {
    pub state: Option<UnitState>,
    pub binary_revision: Option<String>,
    pub workload_version: Option<String>,
}

impl UnitRecord {
    fn from_bag(
        bag: &BTreeMap<String, String>,
        state: Option<UnitState>,
    ) -> Self {
        let non_empty = |key: UnitKey| {
            bag.get(key.as_str()).filter(|value| !value.is_empty()).cloned()
        };
        Self {
            state,
            binary_revision: non_empty(UnitKey::BinaryRevision),
            workload_version: non_empty(UnitKey::WorkloadVersion),
        }
    }
}

fn parse_state(
    unit: &UnitName,
    bag: &BTreeMap<String, String>,
) -> Result<Option<UnitState>, PeerStateError> {
    bag.get(UNIT_STATE_KEY)
        .filter(|value| !value.is_empty())
        .map(|value| {
            value.parse::<UnitState>().map_err(|err| {
                PeerStateError::InvalidRecord {
                    scope: unit.to_string(),
                    key: UNIT_STATE_KEY,
                    value: value.clone(),
                    err: Box::new(err),
                }
            })
        })
        .transpose()
}

/// Proof that the local unit was leader when the snapshot was taken.
#[derive(Debug)]
pub struct LeaderToken {
    _private: (),
}

/// A snapshot of all peer state, taken once per reconcile pass.
///
/// Bags written by other units may be partially updated; every accessor
/// treats missing keys as "not yet known" rather than as an error.
pub struct PeerState<'a, P> {
    relation: &'a P,
    local_unit: UnitName,
    target_revision: String,
    is_leader: bool,
    local: UnitRecord,
    peers: BTreeMap<UnitName, UnitRecord>,
    unreadable: Vec<PeerStateError>,
    app_versions: Option<String>,
}

impl<'a, P: PeerRelation> PeerState<'a, P> {
    /// Read every bag in the relation.
    ///
    /// Fails with [`PeerStateError::NotReady`] when the relation does not
    /// exist yet, or when the local unit's own state is unreadable. A remote
    /// unit with an unreadable state is recorded with an unknown state and
    /// the error is kept in [`PeerState::unreadable_records`].
    pub async fn load(
        relation: &'a P,
        local_unit: &UnitName,
        target_revision: &str,
    ) -> Result<Self, PeerStateError> {
        if !relation.relation_established().await? {
            return Err(PeerStateError::NotReady);
        }
        let is_leader = relation.is_leader().await?;

        let bag = relation.read(ReadScope::Unit(local_unit.clone())).await?;
        let local = UnitRecord::from_bag(&bag, parse_state(local_unit, &bag)?);

        let mut peers = BTreeMap::new();
        let mut unreadable = Vec::new();
        for unit in relation.peer_units().await? {
            if unit == *local_unit {
                continue;
            }
            let bag = relation.read(ReadScope::Unit(unit.clone())).await?;
            let state = parse_state(&unit, &bag).unwrap_or_else(|err| {
                unreadable.push(err);
                None
            });
            peers.insert(unit, UnitRecord::from_bag(&bag, state));
        }

        let app_versions = relation
            .read(ReadScope::App)
            .await?
            .remove(APP_VERSIONS_KEY)
            .filter(|value| !value.is_empty());

        Ok(Self {
            relation,
            local_unit: local_unit.clone(),
            target_revision: target_revision.to_string(),
            is_leader,
            local,
            peers,
            unreadable,
            app_versions,
        })
    }

    pub fn local_unit(&self) -> &UnitName {
        &self.local_unit
    }

    /// The binary revision every unit should end up running.
    pub fn target_revision(&self) -> &str {
        &self.target_revision
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn leader_token(&self) -> Option<LeaderToken> {
        self.is_leader.then_some(LeaderToken { _private: () })
    }

    pub fn unit(&self, unit: &UnitName) -> Option<&UnitRecord> {
        if *unit == self.local_unit {
            Some(&self.local)
        } else {
            self.peers.get(unit)
        }
    }

    pub fn local(&self) -> &UnitRecord {
        &self.local
    }

    /// Errors from remote units whose state could not be parsed. Those units
    /// appear in the snapshot with an unknown state.
    pub fn unreadable_records(&self) -> &[PeerStateError] {
        &self.unreadable
    }

    /// All units, including the local one, highest ordinal first.
    pub fn units_descending(&self) -> Vec<(&UnitName, &UnitRecord)> {
        let mut units: Vec<_> = self
            .peers
            .iter()
            .chain(std::iter::once((&self.local_unit, &self.local)))
            .collect();
        units.sort_by(|(a, _), (b, _)| b.cmp(a));
        units
    }

    /// The effective upgrade state of `unit`.
    ///
    /// A unit whose recorded binary revision differs from the target is
    /// outdated whatever its stored state says.
    pub fn unit_state(&self, unit: &UnitName) -> Option<UnitState> {
        let record = self.unit(unit)?;
        match &record.binary_revision {
            Some(revision) if *revision != self.target_revision => {
                Some(UnitState::Outdated)
            }
            _ => record.state,
        }
    }

    pub fn local_state(&self) -> Option<UnitState> {
        self.unit_state(&self.local_unit)
    }

    /// Whether any unit has recorded a binary revision other than the
    /// target. Units that have not recorded a revision yet do not count.
    pub fn in_progress(&self) -> bool {
        self.peers.values().chain([&self.local]).any(|record| {
            record
                .binary_revision
                .as_ref()
                .is_some_and(|revision| *revision != self.target_revision)
        })
    }

    pub fn app_versions_recorded(&self) -> bool {
        self.app_versions.is_some()
    }

    /// The group's recorded versions, if any.
    pub fn app_versions(&self) -> Result<Option<Versions>, PeerStateError> {
        let Some(raw) = &self.app_versions else {
            return Ok(None);
        };
        serde_json::from_str(raw).map(Some).map_err(|err| {
            PeerStateError::InvalidRecord {
                scope: "application".to_string(),
                key: APP_VERSIONS_KEY,
                value: raw.clone(),
                err: Box::new(err),
            }
        })
    }

    /// Write a revision or version string into the local unit's bag.
    pub async fn set_local(
        &mut self,
        key: UnitKey,
        value: &str,
    ) -> Result<(), PeerStateError> {
        self.relation.write(WriteScope::LocalUnit, key.as_str(), value).await?;
        let value = Some(value.to_string());
        match key {
            UnitKey::BinaryRevision => self.local.binary_revision = value,
            UnitKey::WorkloadVersion => self.local.workload_version = value,
        }
        Ok(())
    }

    pub async fn set_local_state(
        &mut self,
        state: UnitState,
    ) -> Result<(), PeerStateError> {
        self.relation
            .write(WriteScope::LocalUnit, UNIT_STATE_KEY, state.as_str())
            .await?;
        self.local.state = Some(state);
        Ok(())
    }

    pub async fn set_app_versions(
        &mut self,
        _token: &LeaderToken,
        versions: &Versions,
    ) -> Result<(), PeerStateError> {
        let raw = serde_json::to_string(versions).map_err(|err| {
            PeerStateError::InvalidRecord {
                scope: "application".to_string(),
                key: APP_VERSIONS_KEY,
                value: format!("{versions:?}"),
                err: Box::new(err),
            }
        })?;
        self.relation.write(WriteScope::App, APP_VERSIONS_KEY, &raw).await?;
        self.app_versions = Some(raw);
        Ok(())
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Unit identity and per-unit upgrade state.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The name of one unit of the deployed application, e.g. `mongos/3`.
///
/// Units order by their ordinal number. The rolling upgrade walks units from
/// the highest ordinal down, so "higher-ranked" always means "larger number".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitName {
    app: String,
    number: u32,
}

impl UnitName {
    pub fn new(app: impl Into<String>, number: u32) -> Self {
        Self { app: app.into(), number }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    /// The unit's ordinal within its application.
    pub fn number(&self) -> u32 {
        self.number
    }
}

impl Ord for UnitName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.number
            .cmp(&other.number)
            .then_with(|| self.app.cmp(&other.app))
    }
}

impl PartialOrd for UnitName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.number)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UnitNameParseError {
    #[error("unit name {0:?} is missing the '/<number>' suffix")]
    MissingNumber(String),
    #[error("unit name {0:?} has an empty application name")]
    EmptyApplication(String),
    #[error("unit name {name:?} has an invalid unit number")]
    InvalidNumber {
        name: String,
        #[source]
        err: std::num::ParseIntError,
    },
}

impl FromStr for UnitName {
    type Err = UnitNameParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (app, number) = s
            .rsplit_once('/')
            .ok_or_else(|| UnitNameParseError::MissingNumber(s.to_string()))?;
        if app.is_empty() {
            return Err(UnitNameParseError::EmptyApplication(s.to_string()));
        }
        let number = number.parse().map_err(|err| {
            UnitNameParseError::InvalidNumber { name: s.to_string(), err }
        })?;
        Ok(Self { app: app.to_string(), number })
    }
}

impl TryFrom<String> for UnitName {
    type Error = UnitNameParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UnitName> for String {
    fn from(value: UnitName) -> Self {
        value.to_string()
    }
}

/// Upgrade state of a single unit, as published in that unit's own record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    Healthy,
    /// The unit runs a binary revision other than the application target.
    Outdated,
    /// Set immediately before the binary swap; cleared by the post-upgrade
    /// health check.
    Upgrading,
    /// Container substrates only; machine units never enter this state.
    Restarting,
}

impl UnitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitState::Healthy => "healthy",
            UnitState::Outdated => "outdated",
            UnitState::Upgrading => "upgrading",
            UnitState::Restarting => "restarting",
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown unit state {0:?}")]
pub struct UnitStateParseError(pub String);

impl FromStr for UnitState {
    type Err = UnitStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(UnitState::Healthy),
            "outdated" => Ok(UnitState::Outdated),
            "upgrading" => Ok(UnitState::Upgrading),
            "restarting" => Ok(UnitState::Restarting),
            other => Err(UnitStateParseError(other.to_string())),
        }
    }
}

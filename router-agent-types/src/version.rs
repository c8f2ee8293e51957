// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Version records exchanged between units.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// A set of component versions, keyed by component name.
///
/// At minimum this carries the `charm` and `workload` components. It is
/// recorded once per unit and once for the whole application (by the leader),
/// and is serialized into peer state as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Versions(BTreeMap<String, String>);

impl Versions {
    pub const CHARM: &'static str = "charm";
    pub const WORKLOAD: &'static str = "workload";

    /// The component keys every complete record must contain.
    pub const REQUIRED: [&'static str; 2] = [Self::CHARM, Self::WORKLOAD];

    pub fn new(charm: impl Into<String>, workload: impl Into<String>) -> Self {
        let mut versions = BTreeMap::new();
        versions.insert(Self::CHARM.to_string(), charm.into());
        versions.insert(Self::WORKLOAD.to_string(), workload.into());
        Self(versions)
    }

    pub fn get(&self, component: &str) -> Option<&str> {
        self.0.get(component).map(String::as_str)
    }

    pub fn charm(&self) -> Option<&str> {
        self.get(Self::CHARM)
    }

    pub fn workload(&self) -> Option<&str> {
        self.get(Self::WORKLOAD)
    }

    pub fn remove(&mut self, component: &str) -> Option<String> {
        self.0.remove(component)
    }
}

#[derive(Debug, Error)]
pub enum VersionParseError {
    #[error("empty version string")]
    Empty,
    #[error("version {0:?} has more than three numeric components")]
    TooManyComponents(String),
    #[error("failed to parse version {input:?}")]
    Semver {
        input: String,
        #[source]
        err: semver::Error,
    },
}

/// A parsed component version, compared as a semantic version.
///
/// Build metadata (anything after `+`, such as a git hash stamped into a
/// charm version) is stripped before parsing, and missing minor or patch
/// components are treated as zero, so `"8"` and `"8.0.0"` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ComponentVersion(semver::Version);

impl ComponentVersion {
    pub fn parse(input: &str) -> Result<Self, VersionParseError> {
        let trimmed = input.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let without_build =
            trimmed.split_once('+').map_or(trimmed, |(version, _)| version);
        if without_build.is_empty() {
            return Err(VersionParseError::Empty);
        }

        let (core, pre) = match without_build.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (without_build, None),
        };
        let components = core.split('.').count();
        if components > 3 {
            return Err(VersionParseError::TooManyComponents(
                input.to_string(),
            ));
        }
        let mut padded = core.to_string();
        for _ in components..3 {
            padded.push_str(".0");
        }
        if let Some(pre) = pre {
            padded.push('-');
            padded.push_str(pre);
        }

        semver::Version::parse(&padded).map(Self).map_err(|err| {
            VersionParseError::Semver { input: input.to_string(), err }
        })
    }

    pub fn major(&self) -> u64 {
        self.0.major
    }

    pub fn minor(&self) -> u64 {
        self.0.minor
    }

    pub fn patch(&self) -> u64 {
        self.0.patch
    }
}

impl fmt::Display for ComponentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_strategy::proptest;

    #[test]
    fn parse_full_versions() {
        let v = ComponentVersion::parse("6.0.14").unwrap();
        assert_eq!((v.major(), v.minor(), v.patch()), (6, 0, 14));
        assert_eq!(v.to_string(), "6.0.14");
    }

    #[test]
    fn parse_strips_build_suffix() {
        let with_hash = ComponentVersion::parse("1.2.0+a4f3e2c").unwrap();
        let plain = ComponentVersion::parse("1.2.0").unwrap();
        assert_eq!(with_hash, plain);

        let rollback = ComponentVersion::parse("5.0.6+testrollback").unwrap();
        assert_eq!(rollback.major(), 5);
    }

    #[test]
    fn parse_pads_missing_components() {
        assert_eq!(
            ComponentVersion::parse("8").unwrap(),
            ComponentVersion::parse("8.0.0").unwrap()
        );
        assert_eq!(
            ComponentVersion::parse("v1.4").unwrap(),
            ComponentVersion::parse("1.4.0").unwrap()
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            ComponentVersion::parse(""),
            Err(VersionParseError::Empty)
        ));
        assert!(matches!(
            ComponentVersion::parse("+abc"),
            Err(VersionParseError::Empty)
        ));
        assert!(matches!(
            ComponentVersion::parse("1.2.3.4"),
            Err(VersionParseError::TooManyComponents(_))
        ));
        assert!(matches!(
            ComponentVersion::parse("latest"),
            Err(VersionParseError::Semver { .. })
        ));
    }

    #[test]
    fn prerelease_orders_before_release() {
        let rc = ComponentVersion::parse("7.0.0-rc1").unwrap();
        let release = ComponentVersion::parse("7.0").unwrap();
        assert!(rc < release);
    }

    #[test]
    fn versions_json_shape() {
        let versions = Versions::new("1.0.0+abc", "6.0.6");
        let json = serde_json::to_string(&versions).unwrap();
        assert_eq!(json, r#"{"charm":"1.0.0+abc","workload":"6.0.6"}"#);
        assert_eq!(versions.charm(), Some("1.0.0+abc"));
        assert_eq!(versions.workload(), Some("6.0.6"));
        assert_eq!(versions.get("kernel"), None);
    }

    #[proptest]
    fn build_metadata_never_affects_ordering(
        major: u16,
        minor: u16,
        patch: u16,
        #[strategy("[0-9a-z.]{1,12}")] build: String,
    ) {
        let plain = format!("{major}.{minor}.{patch}");
        let stamped = format!("{plain}+{build}");
        assert_eq!(
            ComponentVersion::parse(&plain).unwrap(),
            ComponentVersion::parse(&stamped).unwrap()
        );
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operator-visible upgrade status.
//!
//! Upgrade status has the lowest priority of anything shown for a unit: it
//! only replaces a unit status that is active or that the upgrade logic set
//! itself. Other subsystems' blocked or waiting statuses are left alone.

use crate::backends::ExecutionError;
use router_agent_types::{Status, StatusKind};
use std::future::Future;
use thiserror::Error;

pub const INCOMPATIBLE: &str =
    "Upgrade incompatible. Rollback to previous revision with `juju refresh`";
pub const UPGRADE_IN_PROGRESS: &str =
    "Upgrading. To rollback, `juju refresh` to the previous revision";
pub const PRECHECK_FAILED_PREFIX: &str =
    "Rollback with `juju refresh`. Pre-upgrade check failed:";
pub const UNHEALTHY_AFTER_UPGRADE: &str = "Unhealthy after upgrade.";
pub const WAITING_FOR_HIGHER_UNITS: &str = "Waiting for higher units to upgrade";
pub const WAITING_FOR_ROUTER: &str = "Waiting for router to start";

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("unrecognized status kind {0:?}")]
    UnknownKind(String),
    #[error(transparent)]
    Tool(#[from] ExecutionError),
}

/// Where unit and application statuses are published.
pub trait StatusChannel: Send + Sync {
    fn unit_status(
        &self,
    ) -> impl Future<Output = Result<Status, StatusError>> + Send;

    fn set_unit_status(
        &self,
        status: &Status,
    ) -> impl Future<Output = Result<(), StatusError>> + Send;

    fn app_status(
        &self,
    ) -> impl Future<Output = Result<Status, StatusError>> + Send;

    /// Only called on the leader.
    fn set_app_status(
        &self,
        status: &Status,
    ) -> impl Future<Output = Result<(), StatusError>> + Send;
}

pub fn incompatible() -> Status {
    Status::blocked(INCOMPATIBLE)
}

pub fn upgrade_in_progress() -> Status {
    Status::maintenance(UPGRADE_IN_PROGRESS)
}

pub fn precheck_failed(reason: &str) -> Status {
    Status::blocked(format!("{PRECHECK_FAILED_PREFIX} {reason}"))
}

pub fn unhealthy_after_upgrade() -> Status {
    Status::blocked(UNHEALTHY_AFTER_UPGRADE)
}

pub fn waiting_for_higher_units() -> Status {
    Status::waiting(WAITING_FOR_HIGHER_UNITS)
}

pub fn waiting_for_router() -> Status {
    Status::waiting(WAITING_FOR_ROUTER)
}

/// Status of a unit that is serving normally while the group upgrades.
pub fn running_during_upgrade(
    workload_version: &str,
    binary_revision: &str,
    outdated: bool,
    charm_version: &str,
) -> Status {
    let outdated = if outdated { " (outdated)" } else { "" };
    Status::active(format!(
        "Router {workload_version} running; binary revision \
         {binary_revision}{outdated}; charm revision {charm_version}"
    ))
}

/// Whether the routine upgrade status may overwrite `current`.
pub fn replaceable(current: &Status) -> bool {
    match current.kind {
        StatusKind::Active => true,
        StatusKind::Blocked => {
            current.message.starts_with(PRECHECK_FAILED_PREFIX)
        }
        StatusKind::Waiting => current.message == WAITING_FOR_HIGHER_UNITS,
        StatusKind::Maintenance => false,
    }
}

/// Statuses left behind by the post-upgrade check, cleared once the check
/// passes.
pub fn set_by_post_upgrade_check(current: &Status) -> bool {
    (current.is_blocked() && current.message == UNHEALTHY_AFTER_UPGRADE)
        || (current.kind == StatusKind::Waiting
            && current.message == WAITING_FOR_ROUTER)
}

/// Publish `status` for the unit unless it is already showing.
///
/// Returns whether anything was written.
pub async fn publish_unit<S: StatusChannel>(
    channel: &S,
    status: &Status,
) -> Result<bool, StatusError> {
    if channel.unit_status().await? == *status {
        return Ok(false);
    }
    channel.set_unit_status(status).await?;
    Ok(true)
}

/// Publish `status` for the application unless it is already showing.
pub async fn publish_app<S: StatusChannel>(
    channel: &S,
    status: &Status,
) -> Result<bool, StatusError> {
    if channel.app_status().await? == *status {
        return Ok(false);
    }
    channel.set_app_status(status).await?;
    Ok(true)
}

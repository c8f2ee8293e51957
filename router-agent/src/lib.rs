// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rolling in-place upgrades of a router fleet.
//!
//! Every unit runs its own [`UpgradeReconciler`]. Units coordinate only
//! through peer state: each publishes its upgrade state and installed binary
//! revision, and a unit upgrades only once every higher-numbered unit reports
//! healthy at the target revision. The result is a one-at-a-time upgrade,
//! highest unit first, with no central coordinator.

pub mod authorization;
pub mod backends;
pub mod compatibility;
pub mod config;
pub mod deferred;
pub mod fakes;
pub mod health;
pub mod peer_state;
pub mod reconciler;
pub mod service;
pub mod status;
pub mod task;
pub mod test_util;
pub mod unit_state;
pub mod versions;

pub use config::Config;
pub use reconciler::{
    ForceUpgradeError, PostUpgradeCheck, ReconcileError, Reconciled,
    UpgradeContext, UpgradeReconciler,
};
pub use task::{Signal, TaskApiError, UpgradeTask, UpgradeTaskHandle};

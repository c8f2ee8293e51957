// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helpers shared by unit and integration tests.

use crate::config::ProbeConfig;
use dropshot::test_util::LogContext;
use dropshot::{ConfigLogging, ConfigLoggingIfExists, ConfigLoggingLevel};

/// Set up a [`dropshot::test_util::LogContext`] appropriate for a test named
/// `test_name`
pub fn test_setup_log(test_name: &str) -> LogContext {
    let log_config = ConfigLogging::File {
        level: ConfigLoggingLevel::Trace,
        path: "UNUSED".into(),
        if_exists: ConfigLoggingIfExists::Fail,
    };

    LogContext::new(test_name, &log_config)
}

/// Application database used by tests that exercise the health check.
pub const TEST_DATABASE: &str = "mongos-app";

/// Health check settings against [`TEST_DATABASE`] with the default retry
/// policy.
pub fn test_health_check_config() -> ProbeConfig {
    ProbeConfig::new(TEST_DATABASE)
}

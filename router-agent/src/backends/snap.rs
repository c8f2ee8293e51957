// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The router service as managed by `snapd`.

use super::exec::{ExecutionError, command_to_string, execute, execute_stdout};
use crate::config::RouterConfig;
use crate::service::{RouterService, RouterServiceError};
use slog::{Logger, debug, info, o};
use tokio::process::Command;

const SNAP: &str = "snap";

#[derive(Debug, Clone)]
pub struct SnapRouterService {
    log: Logger,
    snap_name: String,
    channel: String,
    service: String,
}

impl SnapRouterService {
    pub fn new(log: &Logger, config: &RouterConfig) -> Self {
        Self {
            log: log.new(o!("component" => "SnapRouterService")),
            snap_name: config.snap_name.clone(),
            channel: config.snap_channel.clone(),
            service: config.service.clone(),
        }
    }

    /// `<snap>.<service>`, as `snap start` and friends name it.
    fn qualified_service(&self) -> String {
        format!("{}.{}", self.snap_name, self.service)
    }

    fn service_command(&self, verb: &str) -> Command {
        let mut command = Command::new(SNAP);
        command.arg(verb).arg(self.qualified_service());
        command
    }
}

/// Find `service` in the output of `snap services` and report whether it is
/// active.
pub fn parse_service_active(output: &str, service: &str) -> Option<bool> {
    output.lines().skip(1).find_map(|line| {
        let mut columns = line.split_whitespace();
        if columns.next()? != service {
            return None;
        }
        // Columns after the name are startup, current, notes.
        let current = columns.nth(1)?;
        Some(current == "active")
    })
}

impl RouterService for SnapRouterService {
    async fn stop(&self) -> Result<(), RouterServiceError> {
        let mut command = self.service_command("stop");
        debug!(self.log, "stopping router"; "command" => command_to_string(&command));
        execute(&mut command).await.map_err(RouterServiceError::Stop)?;
        Ok(())
    }

    async fn install(&self, revision: &str) -> Result<(), RouterServiceError> {
        let mut command = Command::new(SNAP);
        command
            .args(["refresh", self.snap_name.as_str()])
            .args(["--channel", self.channel.as_str()])
            .args(["--revision", revision]);
        info!(
            self.log,
            "installing router";
            "snap" => &self.snap_name,
            "revision" => revision,
        );
        execute(&mut command).await.map_err(|err| {
            RouterServiceError::Install { revision: revision.to_string(), err }
        })?;
        Ok(())
    }

    async fn start(&self) -> Result<(), RouterServiceError> {
        let mut command = self.service_command("start");
        debug!(self.log, "starting router"; "command" => command_to_string(&command));
        execute(&mut command).await.map_err(RouterServiceError::Start)?;
        Ok(())
    }

    async fn is_running(&self) -> Result<bool, RouterServiceError> {
        let mut command = self.service_command("services");
        let stdout = execute_stdout(&mut command)
            .await
            .map_err(RouterServiceError::Query)?;
        let service = self.qualified_service();
        parse_service_active(&stdout, &service).ok_or_else(|| {
            RouterServiceError::Query(ExecutionError::ParseFailure {
                command: command_to_string(&command),
                reason: format!("service {service} not listed"),
            })
        })
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Peer state and status through the hook tools the orchestrator places on
//! `PATH` while a hook or action runs.

use super::exec::{ExecutionError, execute, execute_json};
use crate::peer_state::{PeerRelation, PeerStateError, ReadScope, WriteScope};
use crate::status::{StatusChannel, StatusError};
use router_agent_types::{Status, StatusKind, UnitName};
use serde::Deserialize;
use slog::{Logger, debug, o};
use std::collections::{BTreeMap, BTreeSet};
use tokio::process::Command;

const FORMAT_JSON: &str = "--format=json";

#[derive(Debug, Clone)]
pub struct HookTools {
    log: Logger,
    unit: UnitName,
    relation_name: String,
}

impl HookTools {
    pub fn new(log: &Logger, unit: UnitName, relation_name: &str) -> Self {
        Self {
            log: log.new(o!(
                "component" => "HookTools",
                "relation" => relation_name.to_string(),
            )),
            unit,
            relation_name: relation_name.to_string(),
        }
    }

    /// Id of the peer relation, if the unit has joined it yet.
    async fn relation_id(&self) -> Result<Option<String>, ExecutionError> {
        let mut command = Command::new("relation-ids");
        command.args([self.relation_name.as_str(), FORMAT_JSON]);
        let ids: Vec<String> = execute_json(&mut command).await?;
        Ok(ids.into_iter().next())
    }

    async fn require_relation_id(&self) -> Result<String, PeerStateError> {
        self.relation_id().await?.ok_or(PeerStateError::NotReady)
    }

    /// Record `value` under `key` in the running action's results.
    pub async fn action_set(
        &self,
        key: &str,
        value: &str,
    ) -> Result<(), ExecutionError> {
        let mut command = Command::new("action-set");
        command.arg(format!("{key}={value}"));
        execute(&mut command).await?;
        Ok(())
    }

    /// Mark the running action failed with `message`.
    pub async fn action_fail(&self, message: &str) -> Result<(), ExecutionError> {
        let mut command = Command::new("action-fail");
        command.arg(message);
        execute(&mut command).await?;
        Ok(())
    }
}

impl PeerRelation for HookTools {
    async fn relation_established(&self) -> Result<bool, PeerStateError> {
        Ok(self.relation_id().await?.is_some())
    }

    async fn is_leader(&self) -> Result<bool, PeerStateError> {
        let mut command = Command::new("is-leader");
        command.arg(FORMAT_JSON);
        Ok(execute_json(&mut command).await?)
    }

    async fn peer_units(&self) -> Result<BTreeSet<UnitName>, PeerStateError> {
        let id = self.require_relation_id().await?;
        let mut command = Command::new("relation-list");
        command.args(["-r", id.as_str(), FORMAT_JSON]);
        let units: BTreeSet<UnitName> = execute_json(&mut command).await?;
        Ok(units)
    }

    async fn read(
        &self,
        scope: ReadScope,
    ) -> Result<BTreeMap<String, String>, PeerStateError> {
        let id = self.require_relation_id().await?;
        let mut command = Command::new("relation-get");
        command.args(["-r", id.as_str(), FORMAT_JSON]);
        match scope {
            ReadScope::Unit(unit) => {
                command.arg("-").arg(unit.to_string());
            }
            ReadScope::App => {
                command.args(["--app", "-", self.unit.app()]);
            }
        }
        let bag: Option<BTreeMap<String, String>> =
            execute_json(&mut command).await?;
        Ok(bag.unwrap_or_default())
    }

    async fn write(
        &self,
        scope: WriteScope,
        key: &str,
        value: &str,
    ) -> Result<(), PeerStateError> {
        let id = self.require_relation_id().await?;
        let mut command = Command::new("relation-set");
        command.args(["-r", id.as_str()]);
        if scope == WriteScope::App {
            command.arg("--app");
        }
        command.arg(format!("{key}={value}"));
        debug!(self.log, "writing peer state"; "scope" => ?scope, "key" => key);
        execute(&mut command).await.map_err(|err| {
            // The tool refuses application writes from non-leaders.
            if scope == WriteScope::App
                && err.stderr().is_some_and(|stderr| stderr.contains("leader"))
            {
                PeerStateError::NotLeader
            } else {
                err.into()
            }
        })?;
        Ok(())
    }
}

/// One status as `status-get` reports it.
#[derive(Debug, Deserialize)]
pub struct StatusReply {
    status: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApplicationStatusReply {
    #[serde(rename = "application-status")]
    application: StatusReply,
}

impl StatusReply {
    pub fn into_status(self) -> Result<Status, StatusError> {
        let kind = match self.status.as_str() {
            "active" => StatusKind::Active,
            "blocked" => StatusKind::Blocked,
            "maintenance" => StatusKind::Maintenance,
            "waiting" => StatusKind::Waiting,
            // Nothing has been set yet.
            "unknown" => return Ok(Status::default()),
            _ => return Err(StatusError::UnknownKind(self.status)),
        };
        Ok(Status::new(kind, self.message))
    }
}

fn status_set(status: &Status, application: bool) -> Command {
    let mut command = Command::new("status-set");
    if application {
        command.arg("--application");
    }
    command.args([status.kind.as_str(), status.message.as_str()]);
    command
}

impl StatusChannel for HookTools {
    async fn unit_status(&self) -> Result<Status, StatusError> {
        let mut command = Command::new("status-get");
        command.arg(FORMAT_JSON);
        let reply: StatusReply = execute_json(&mut command).await?;
        reply.into_status()
    }

    async fn set_unit_status(&self, status: &Status) -> Result<(), StatusError> {
        debug!(self.log, "setting unit status"; "status" => ?status);
        execute(&mut status_set(status, false)).await?;
        Ok(())
    }

    async fn app_status(&self) -> Result<Status, StatusError> {
        let mut command = Command::new("status-get");
        command.args(["--application", FORMAT_JSON]);
        let reply: ApplicationStatusReply = execute_json(&mut command).await?;
        reply.application.into_status()
    }

    async fn set_app_status(&self, status: &Status) -> Result<(), StatusError> {
        debug!(self.log, "setting application status"; "status" => ?status);
        execute(&mut status_set(status, true)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::exec::command_to_string;

    #[test]
    fn status_replies_are_parsed() {
        let reply: StatusReply = serde_json::from_str(
            r#"{"message":"Waiting for higher units to upgrade","status":"waiting","status-data":{}}"#,
        )
        .unwrap();
        assert_eq!(
            reply.into_status().unwrap(),
            Status::waiting("Waiting for higher units to upgrade")
        );

        let reply: ApplicationStatusReply = serde_json::from_str(
            r#"{"application-status":{"message":"","status":"active","units":{}}}"#,
        )
        .unwrap();
        assert_eq!(reply.application.into_status().unwrap(), Status::active(""));

        let reply: StatusReply =
            serde_json::from_str(r#"{"status":"unknown"}"#).unwrap();
        assert_eq!(reply.into_status().unwrap(), Status::default());

        let reply: StatusReply =
            serde_json::from_str(r#"{"status":"error","message":"hook failed"}"#)
                .unwrap();
        assert!(matches!(
            reply.into_status(),
            Err(StatusError::UnknownKind(kind)) if kind == "error"
        ));
    }

    #[test]
    fn status_set_arguments() {
        let status = Status::blocked("Unhealthy after upgrade.");
        assert_eq!(
            command_to_string(&status_set(&status, true)),
            "status-set --application blocked Unhealthy after upgrade."
        );
        assert_eq!(
            command_to_string(&status_set(&Status::active(""), false)),
            "status-set active "
        );
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reaching the cluster through the local router with the `mongosh` shell.
//!
//! Each operation is one `mongosh --eval` invocation whose result is printed
//! as relaxed extended JSON, so plain numbers and strings come back as plain
//! JSON values.

use super::exec::{ExecutionError, execute_json};
use crate::config::RouterConfig;
use crate::health::{
    ClusterConnection, ClusterConnector, ConnectionError, command_succeeded,
};
use camino::Utf8PathBuf;
use serde_json::{Value, json};
use slog::{Logger, debug, o};
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct MongoshConnector {
    log: Logger,
    mongosh: Utf8PathBuf,
    uri: String,
    config_server_db_file: Utf8PathBuf,
}

impl MongoshConnector {
    pub fn new(log: &Logger, config: &RouterConfig) -> Self {
        Self {
            log: log.new(o!("component" => "MongoshConnector")),
            mongosh: config.mongosh.clone(),
            uri: config.uri.clone(),
            config_server_db_file: config.config_server_db_file.clone(),
        }
    }
}

impl ClusterConnector for MongoshConnector {
    type Connection = MongoshConnection;

    async fn is_configured(&self) -> bool {
        match tokio::fs::read_to_string(&self.config_server_db_file).await {
            Ok(contents) => !contents.trim().is_empty(),
            Err(err) => {
                debug!(
                    self.log,
                    "no config-server connection string";
                    "path" => %self.config_server_db_file,
                    "error" => %err,
                );
                false
            }
        }
    }

    async fn connect(&self) -> Result<MongoshConnection, ConnectionError> {
        let conn = MongoshConnection {
            mongosh: self.mongosh.clone(),
            uri: self.uri.clone(),
        };
        let reply = conn.run_admin_command(json!({ "ping": 1 })).await.map_err(
            |err| match err {
                ConnectionError::Exec(err) => {
                    ConnectionError::Unavailable(err.to_string())
                }
                err => err,
            },
        )?;
        if !command_succeeded(&reply) {
            return Err(ConnectionError::UnexpectedReply {
                operation: "ping",
                reply: reply.to_string(),
            });
        }
        Ok(conn)
    }
}

/// JavaScript selecting `collection` in `database`.
fn collection_expr(database: &str, collection: &str) -> String {
    format!(
        "db.getSiblingDB({}).getCollection({})",
        Value::from(database),
        Value::from(collection),
    )
}

pub fn insert_one_script(
    database: &str,
    collection: &str,
    document: &Value,
) -> String {
    format!(
        "{}.insertOne({document}, {{ writeConcern: {{ w: \"majority\" }} }})",
        collection_expr(database, collection),
    )
}

pub fn find_script(
    database: &str,
    collection: &str,
    filter: &Value,
    projection: &Value,
) -> String {
    format!(
        "{}.find({filter}, {projection}).toArray()",
        collection_expr(database, collection),
    )
}

pub fn drop_script(database: &str, collection: &str) -> String {
    format!("{}.drop()", collection_expr(database, collection))
}

pub fn admin_command_script(command: &Value) -> String {
    format!("db.getSiblingDB(\"admin\").runCommand({command})")
}

/// One connection string and shell binary; every call spawns the shell.
#[derive(Debug, Clone)]
pub struct MongoshConnection {
    mongosh: Utf8PathBuf,
    uri: String,
}

impl MongoshConnection {
    async fn eval(&self, script: &str) -> Result<Value, ExecutionError> {
        let mut command = Command::new(&self.mongosh);
        command
            .arg(&self.uri)
            .args(["--quiet", "--json=relaxed", "--eval", script]);
        execute_json(&mut command).await
    }
}

impl ClusterConnection for MongoshConnection {
    async fn insert_one(
        &self,
        database: &str,
        collection: &str,
        document: Value,
    ) -> Result<(), ConnectionError> {
        let reply = self
            .eval(&insert_one_script(database, collection, &document))
            .await?;
        if reply.get("acknowledged").and_then(Value::as_bool) != Some(true) {
            return Err(ConnectionError::UnexpectedReply {
                operation: "insertOne",
                reply: reply.to_string(),
            });
        }
        Ok(())
    }

    async fn find(
        &self,
        database: &str,
        collection: &str,
        filter: Value,
        projection: Value,
    ) -> Result<Vec<Value>, ConnectionError> {
        let reply = self
            .eval(&find_script(database, collection, &filter, &projection))
            .await?;
        match reply {
            Value::Array(documents) => Ok(documents),
            reply => Err(ConnectionError::UnexpectedReply {
                operation: "find",
                reply: reply.to_string(),
            }),
        }
    }

    async fn drop_collection(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<(), ConnectionError> {
        // `drop` returns false when the collection is already gone, which is
        // just as good.
        self.eval(&drop_script(database, collection)).await?;
        Ok(())
    }

    async fn run_admin_command(
        &self,
        command: Value,
    ) -> Result<Value, ConnectionError> {
        Ok(self.eval(&admin_command_script(&command)).await?)
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Functional read/write probe through the router.
//!
//! The probe writes a uniquely tagged document into a throwaway collection
//! and reads it back through the router, which exercises the whole path into
//! the backing cluster rather than just the router's listening socket.

use crate::backends::ExecutionError;
use crate::config::ProbeConfig;
use backoff::backoff::Backoff;
use backoff::future::retry_notify;
use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use serde_json::{Value, json};
use slog::{Logger, debug, o, warn};
use slog_error_chain::InlineErrorChain;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Field holding the marker value in probe documents.
pub const WRITE_KEY: &str = "write_value";

const COLLECTION_PREFIX: &str = "collection_";
const COLLECTION_SUFFIX_LEN: usize = 32;
const MARKER_PREFIX: &str = "unique_write_";
const MARKER_SUFFIX_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("router is unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected reply to {operation}: {reply}")]
    UnexpectedReply { operation: &'static str, reply: String },
    #[error(transparent)]
    Exec(#[from] ExecutionError),
}

/// Opens connections to the cluster through the local router.
pub trait ClusterConnector: Send + Sync {
    type Connection: ClusterConnection;

    /// Whether the router has been given an upstream cluster to route to.
    fn is_configured(&self) -> impl Future<Output = bool> + Send;

    /// Open a connection. It is closed when dropped.
    fn connect(
        &self,
    ) -> impl Future<Output = Result<Self::Connection, ConnectionError>> + Send;
}

pub trait ClusterConnection: Send + Sync {
    fn insert_one(
        &self,
        database: &str,
        collection: &str,
        document: Value,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn find(
        &self,
        database: &str,
        collection: &str,
        filter: Value,
        projection: Value,
    ) -> impl Future<Output = Result<Vec<Value>, ConnectionError>> + Send;

    fn drop_collection(
        &self,
        database: &str,
        collection: &str,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Run `command` against the `admin` database and return the reply.
    fn run_admin_command(
        &self,
        command: Value,
    ) -> impl Future<Output = Result<Value, ConnectionError>> + Send;
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to write probe document to {collection}")]
    Write {
        collection: String,
        #[source]
        err: ConnectionError,
    },
    #[error("failed to read probe document from {collection}")]
    Read {
        collection: String,
        #[source]
        err: ConnectionError,
    },
    #[error("probe document missing from {collection}")]
    Missing { collection: String },
    #[error("probe read back {found:?} from {collection}, expected {expected:?}")]
    Mismatch { collection: String, expected: String, found: Option<String> },
    #[error("failed to drop probe collection {collection}")]
    Drop {
        collection: String,
        #[source]
        err: ConnectionError,
    },
}

/// A fixed number of attempts separated by a fixed interval.
#[derive(Debug, Clone)]
pub struct FixedAttempts {
    interval: Duration,
    max_attempts: usize,
    retries_left: usize,
}

impl FixedAttempts {
    pub fn new(max_attempts: usize, interval: Duration) -> Self {
        Self {
            interval,
            max_attempts,
            retries_left: max_attempts.saturating_sub(1),
        }
    }
}

impl Backoff for FixedAttempts {
    fn reset(&mut self) {
        self.retries_left = self.max_attempts.saturating_sub(1);
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries_left == 0 {
            return None;
        }
        self.retries_left -= 1;
        Some(self.interval)
    }
}

/// Random names for one probe run: `(collection, marker)`.
pub fn probe_names() -> (String, String) {
    let suffix = |len| -> String {
        OsRng.sample_iter(&Alphanumeric).take(len).map(char::from).collect()
    };
    (
        format!("{COLLECTION_PREFIX}{}", suffix(COLLECTION_SUFFIX_LEN)),
        format!("{MARKER_PREFIX}{}", suffix(MARKER_SUFFIX_LEN)),
    )
}

/// Whether a database command reply reports `ok: 1`.
pub fn command_succeeded(reply: &Value) -> bool {
    reply.get("ok").and_then(Value::as_f64) == Some(1.0)
}

pub struct HealthProbe<C> {
    log: Logger,
    connector: C,
    database: String,
    max_attempts: usize,
    retry_interval: Duration,
}

impl<C: ClusterConnector> HealthProbe<C> {
    pub fn new(log: &Logger, connector: C, config: &ProbeConfig) -> Self {
        Self {
            log: log.new(o!("component" => "HealthProbe")),
            connector,
            database: config.database.clone(),
            max_attempts: config.max_attempts,
            retry_interval: config.retry_interval(),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Returns true if a write through the router can be read back.
    pub async fn is_able_to_read_write(&self) -> bool {
        match self.check_read_write().await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    self.log,
                    "read/write probe failed";
                    "error" => InlineErrorChain::new(&err),
                );
                false
            }
        }
    }

    /// Write a tagged document, confirm it reads back, and drop the
    /// collection. The collection is dropped whatever the outcome.
    pub async fn check_read_write(&self) -> Result<(), ProbeError> {
        let (collection, marker) = probe_names();
        debug!(self.log, "starting read/write probe"; "collection" => &collection);

        let result = match self.add_write(&collection, &marker).await {
            Ok(()) => self.confirm_expected_write(&collection, &marker).await,
            Err(err) => Err(err),
        };
        let cleared = self.clear_collection(&collection).await;
        result?;
        cleared
    }

    async fn add_write(
        &self,
        collection: &str,
        marker: &str,
    ) -> Result<(), ProbeError> {
        let write_err = |err| ProbeError::Write {
            collection: collection.to_string(),
            err,
        };
        let conn = self.connector.connect().await.map_err(write_err)?;
        conn.insert_one(&self.database, collection, json!({ WRITE_KEY: marker }))
            .await
            .map_err(write_err)
    }

    /// Read back the first document in `collection`, retrying for up to the
    /// configured number of attempts. The last error is returned when every
    /// attempt fails.
    pub async fn confirm_expected_write(
        &self,
        collection: &str,
        expected: &str,
    ) -> Result<(), ProbeError> {
        let attempt = || async {
            self.read_marker(collection, expected)
                .await
                .map_err(backoff::Error::transient)
        };
        let log_failure = |err: ProbeError, delay: Duration| {
            debug!(
                self.log,
                "probe write not confirmed yet";
                "error" => %err,
                "retry_in" => ?delay,
            );
        };
        retry_notify(
            FixedAttempts::new(self.max_attempts, self.retry_interval),
            attempt,
            log_failure,
        )
        .await
    }

    async fn read_marker(
        &self,
        collection: &str,
        expected: &str,
    ) -> Result<(), ProbeError> {
        let read_err =
            |err| ProbeError::Read { collection: collection.to_string(), err };
        let conn = self.connector.connect().await.map_err(read_err)?;
        let documents = conn
            .find(&self.database, collection, json!({}), json!({ WRITE_KEY: 1 }))
            .await
            .map_err(read_err)?;
        let first = documents.first().ok_or_else(|| ProbeError::Missing {
            collection: collection.to_string(),
        })?;
        let found = first.get(WRITE_KEY).and_then(Value::as_str);
        if found != Some(expected) {
            return Err(ProbeError::Mismatch {
                collection: collection.to_string(),
                expected: expected.to_string(),
                found: found.map(str::to_string),
            });
        }
        Ok(())
    }

    async fn clear_collection(&self, collection: &str) -> Result<(), ProbeError> {
        let drop_err =
            |err| ProbeError::Drop { collection: collection.to_string(), err };
        let conn = self.connector.connect().await.map_err(drop_err)?;
        conn.drop_collection(&self.database, collection).await.map_err(drop_err)
    }
}

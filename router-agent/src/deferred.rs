// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signals deferred by one invocation of the agent and replayed by the next.
//!
//! Each hook runs the agent as a short-lived process, so a retry timer
//! rarely outlives the hook that set it. Whatever is still deferred at
//! shutdown is written to the state directory and replayed first thing on
//! the next invocation.

use crate::task::{Signal, TaskApiError, UpgradeTaskHandle};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use slog::{Logger, debug, info, o, warn};
use slog_error_chain::InlineErrorChain;
use std::io;
use thiserror::Error;

pub const DEFERRED_SIGNALS_FILE: &str = "deferred-signals.json";

/// Extension given to a signal file that could not be parsed.
const UNREADABLE_EXTENSION: &str = "json.unreadable";

#[derive(Debug, Error)]
pub enum DeferredSignalsError {
    #[error("failed to read deferred signals from {path}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to parse deferred signals in {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: serde_json::Error,
    },
    #[error("failed to write deferred signals to {path}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("failed to stop upgrade task")]
    Task(#[from] TaskApiError),
    #[error(transparent)]
    Store(#[from] DeferredSignalsError),
}

/// On-disk format of the deferred signal file.
#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct DeferredSignals {
    signals: Vec<Signal>,
}

pub struct DeferredSignalStore {
    log: Logger,
    path: Utf8PathBuf,
}

impl DeferredSignalStore {
    pub fn new(log: &Logger, state_dir: &Utf8Path) -> Self {
        Self {
            log: log.new(o!("component" => "DeferredSignalStore")),
            path: state_dir.join(DEFERRED_SIGNALS_FILE),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Load the signals deferred by the previous invocation, in the order
    /// they were stored. A missing file means nothing was deferred.
    pub async fn load(&self) -> Result<Vec<Signal>, DeferredSignalsError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(self.log, "no deferred signals"; "path" => %self.path);
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(DeferredSignalsError::Read {
                    path: self.path.clone(),
                    err,
                });
            }
        };
        let deferred: DeferredSignals = serde_json::from_str(&contents)
            .map_err(|err| DeferredSignalsError::Parse {
                path: self.path.clone(),
                err,
            })?;
        info!(
            self.log,
            "loaded deferred signals";
            "signals" => ?deferred.signals,
        );
        Ok(deferred.signals)
    }

    /// Like [`Self::load`], except that a file that cannot be parsed (say,
    /// one naming a signal this build does not know) is moved aside and
    /// treated as empty.
    pub async fn load_or_set_aside(
        &self,
    ) -> Result<Vec<Signal>, DeferredSignalsError> {
        match self.load().await {
            Err(DeferredSignalsError::Parse { path, err }) => {
                let aside = path.with_extension(UNREADABLE_EXTENSION);
                warn!(
                    self.log,
                    "setting aside unreadable deferred signals";
                    "path" => %path,
                    "moved_to" => %aside,
                    "error" => InlineErrorChain::new(&err),
                );
                tokio::fs::rename(&path, &aside).await.map_err(|err| {
                    DeferredSignalsError::Write { path: path.clone(), err }
                })?;
                Ok(Vec::new())
            }
            other => other,
        }
    }

    /// Deliver the stored signals to the task behind `handle`, oldest
    /// first, and return how many were delivered.
    ///
    /// A signal that fails is logged and not retried here; the task defers
    /// it again if it is retryable.
    pub async fn replay(
        &self,
        handle: &UpgradeTaskHandle,
    ) -> Result<usize, DeferredSignalsError> {
        let signals = self.load_or_set_aside().await?;
        for signal in &signals {
            if let Err(err) = handle.signal(*signal).await {
                warn!(
                    self.log,
                    "deferred signal failed";
                    "signal" => ?signal,
                    "error" => InlineErrorChain::new(&err),
                );
            }
        }
        Ok(signals.len())
    }

    /// Shut down the task behind `handle` and store whatever it still has
    /// deferred, returning those signals.
    pub async fn shutdown_and_store(
        &self,
        handle: &UpgradeTaskHandle,
    ) -> Result<Vec<Signal>, HandoffError> {
        let deferred = handle.shutdown().await?;
        self.store(&deferred).await?;
        Ok(deferred)
    }

    /// Replace the stored signals with `signals`.
    ///
    /// The file is written beside its final path and renamed into place, so
    /// a crash mid-write leaves the previous contents intact.
    pub async fn store(
        &self,
        signals: &[Signal],
    ) -> Result<(), DeferredSignalsError> {
        let write_err =
            |err| DeferredSignalsError::Write { path: self.path.clone(), err };
        if signals.is_empty() {
            return match tokio::fs::remove_file(&self.path).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(write_err(err)),
            };
        }

        let deferred = DeferredSignals { signals: signals.to_vec() };
        let contents = serde_json::to_string_pretty(&deferred).map_err(|err| {
            DeferredSignalsError::Parse { path: self.path.clone(), err }
        })?;
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, contents).await.map_err(write_err)?;
        tokio::fs::rename(&tmp_path, &self.path).await.map_err(write_err)?;
        debug!(self.log, "stored deferred signals"; "signals" => ?signals);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_setup_log;
    use camino_tempfile::Utf8TempDir;

    #[tokio::test]
    async fn signals_survive_between_invocations() {
        let logctx = test_setup_log("signals_survive_between_invocations");
        let dir = Utf8TempDir::new().unwrap();
        let store = DeferredSignalStore::new(&logctx.log, dir.path());

        assert!(store.load().await.unwrap().is_empty());

        store.store(&[Signal::PostUpgradeCheck]).await.unwrap();
        let contents = std::fs::read_to_string(store.path()).unwrap();
        assert!(contents.contains("\"post-upgrade-check\""));
        assert_eq!(store.load().await.unwrap(), [Signal::PostUpgradeCheck]);
        assert!(!dir.path().join("deferred-signals.json.tmp").exists());

        store.store(&[]).await.unwrap();
        assert!(!store.path().exists());
        assert!(store.load().await.unwrap().is_empty());
        // Clearing twice is fine.
        store.store(&[]).await.unwrap();
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let logctx = test_setup_log("corrupt_file_is_reported");
        let dir = Utf8TempDir::new().unwrap();
        let store = DeferredSignalStore::new(&logctx.log, dir.path());
        std::fs::write(store.path(), "{\"signals\": [\"reboot\"]}").unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, DeferredSignalsError::Parse { .. }));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn unreadable_file_is_set_aside() {
        let logctx = test_setup_log("unreadable_file_is_set_aside");
        let dir = Utf8TempDir::new().unwrap();
        let store = DeferredSignalStore::new(&logctx.log, dir.path());
        std::fs::write(store.path(), "{\"signals\": [\"reboot\"]}").unwrap();

        assert!(store.load_or_set_aside().await.unwrap().is_empty());
        assert!(!store.path().exists());
        let aside = dir.path().join("deferred-signals.json.unreadable");
        assert_eq!(
            std::fs::read_to_string(&aside).unwrap(),
            "{\"signals\": [\"reboot\"]}"
        );

        // The next invocation starts clean and can store signals again.
        assert!(store.load().await.unwrap().is_empty());
        store.store(&[Signal::PostUpgradeCheck]).await.unwrap();
        assert_eq!(
            store.load_or_set_aside().await.unwrap(),
            [Signal::PostUpgradeCheck]
        );
        logctx.cleanup_successful();
    }
}

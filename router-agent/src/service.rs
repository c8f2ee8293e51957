// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lifecycle control of the local router process.

use crate::backends::ExecutionError;
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterServiceError {
    #[error("failed to stop router service")]
    Stop(#[source] ExecutionError),
    #[error("failed to install router revision {revision}")]
    Install {
        revision: String,
        #[source]
        err: ExecutionError,
    },
    #[error("failed to start router service")]
    Start(#[source] ExecutionError),
    #[error("failed to query router service")]
    Query(#[source] ExecutionError),
}

/// The process manager for the router binary on this machine.
pub trait RouterService: Send + Sync {
    fn stop(&self) -> impl Future<Output = Result<(), RouterServiceError>> + Send;

    /// Install `revision` of the router binary. The service must be stopped.
    fn install(
        &self,
        revision: &str,
    ) -> impl Future<Output = Result<(), RouterServiceError>> + Send;

    fn start(&self)
    -> impl Future<Output = Result<(), RouterServiceError>> + Send;

    fn is_running(
        &self,
    ) -> impl Future<Output = Result<bool, RouterServiceError>> + Send;
}

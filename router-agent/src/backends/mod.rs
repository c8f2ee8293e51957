// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementations of the agent's collaborators on a real machine, by
//! shelling out to the host's tools.

mod exec;
pub mod hook_tools;
pub mod mongosh;
pub mod snap;

pub use exec::CommandFailureInfo;
pub use exec::ExecutionError;
pub use exec::execute;
pub use exec::execute_json;
pub use exec::execute_stdout;
pub use hook_tools::HookTools;
pub use mongosh::MongoshConnector;
pub use snap::SnapRouterService;

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared between the router agent's upgrade orchestrator and the
//! collaborators it talks to.
//!
//! Nothing in this crate performs I/O. The types here describe what a unit
//! publishes to its peers ([`UnitState`], [`Versions`]), how units are named
//! and ordered ([`UnitName`]), and what the agent reports to the operator
//! ([`Status`]).

mod status;
mod unit;
mod version;

pub use status::Status;
pub use status::StatusKind;
pub use unit::UnitName;
pub use unit::UnitNameParseError;
pub use unit::UnitState;
pub use unit::UnitStateParseError;
pub use version::ComponentVersion;
pub use version::VersionParseError;
pub use version::Versions;

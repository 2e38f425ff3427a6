//! Index lifecycle statuses and the actions that move between them.
//!
//! Status is tracked per (index, field key). The forward path is
//! INSTALLED -> REGISTERED -> ENABLED; DISABLED branches off REGISTERED or
//! ENABLED and REMOVED is terminal.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle stage of one indexed field.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum SchemaStatus {
    /// Declared but not yet acknowledged by every open instance. Writes are
    /// applied so later enabling has complete forward data; reads never
    /// consult the field.
    Installed,
    /// Acknowledged by all open instances. Still invisible to reads since
    /// historical data predating installation may be missing.
    Registered,
    /// Fully readable.
    Enabled,
    /// Reads and writes stopped. Reversible through a fresh registration.
    Disabled,
    /// Terminal; backend data is deleted asynchronously.
    Removed,
}

impl SchemaStatus {
    /// A stable status is one the registration watcher does not need to wait
    /// out. Only `Installed` is unstable.
    pub fn is_stable(&self) -> bool {
        !matches!(self, SchemaStatus::Installed)
    }

    /// Whether index writes are maintained at this status.
    pub fn writes_maintained(&self) -> bool {
        matches!(
            self,
            SchemaStatus::Installed | SchemaStatus::Registered | SchemaStatus::Enabled
        )
    }

    /// Whether reads may consult the field at this status.
    pub fn readable(&self) -> bool {
        matches!(self, SchemaStatus::Enabled)
    }
}

impl fmt::Display for SchemaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchemaStatus::Installed => "INSTALLED",
            SchemaStatus::Registered => "REGISTERED",
            SchemaStatus::Enabled => "ENABLED",
            SchemaStatus::Disabled => "DISABLED",
            SchemaStatus::Removed => "REMOVED",
        };
        f.write_str(name)
    }
}

/// Operator-requested lifecycle transition.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum SchemaAction {
    /// Wait for every open instance to acknowledge the index, then mark it
    /// `Registered`.
    RegisterIndex,
    /// Make a registered index readable.
    EnableIndex,
    /// Backfill historical data, then mark the index `Enabled`.
    Reindex,
    /// Stop reads and writes.
    DisableIndex,
    /// Delete backend data and retire the index permanently.
    RemoveIndex,
}

impl SchemaAction {
    /// Statuses the action may be requested from. Requests from any other
    /// status fail with no state change.
    pub fn applicable_statuses(&self) -> &'static [SchemaStatus] {
        match self {
            SchemaAction::RegisterIndex => {
                &[SchemaStatus::Installed, SchemaStatus::Disabled]
            }
            SchemaAction::EnableIndex => &[SchemaStatus::Registered],
            SchemaAction::Reindex => &[SchemaStatus::Registered, SchemaStatus::Disabled],
            SchemaAction::DisableIndex => {
                &[SchemaStatus::Registered, SchemaStatus::Enabled]
            }
            SchemaAction::RemoveIndex => &[
                SchemaStatus::Registered,
                SchemaStatus::Enabled,
                SchemaStatus::Disabled,
            ],
        }
    }

    /// Whether the requested status admits this action.
    pub fn applies_to(&self, status: SchemaStatus) -> bool {
        self.applicable_statuses().contains(&status)
    }

    /// Actions that run as a background job with pollable metrics. The
    /// others complete within the management call.
    pub fn spawns_job(&self) -> bool {
        matches!(
            self,
            SchemaAction::RegisterIndex | SchemaAction::Reindex | SchemaAction::RemoveIndex
        )
    }
}

impl fmt::Display for SchemaAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchemaAction::RegisterIndex => "REGISTER_INDEX",
            SchemaAction::EnableIndex => "ENABLE_INDEX",
            SchemaAction::Reindex => "REINDEX",
            SchemaAction::DisableIndex => "DISABLE_INDEX",
            SchemaAction::RemoveIndex => "REMOVE_INDEX",
        };
        f.write_str(name)
    }
}

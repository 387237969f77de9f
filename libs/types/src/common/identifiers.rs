//! Identifier aliases and stage placement modes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Authenticated account identifier. Zero means "not authenticated".
pub type AccountId = i64;

/// Client session identifier, unique per play node for the node's lifetime
pub type Sid = i64;

/// Mesh identity of a node (used as the router identity frame)
pub type ServerId = String;

/// How actors of a stage type are placed into stages during authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageMode {
    /// The actor names the stage id it wants to join explicitly.
    #[default]
    Multi,
    /// One stage per (account, stage type); the runtime resolves the stage id.
    Single,
}

impl fmt::Display for StageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageMode::Multi => f.write_str("multi"),
            StageMode::Single => f.write_str("single"),
        }
    }
}

/// Deterministic stage id for a single-mode stage.
///
/// The same account always resolves to the same stage id for a given stage type,
/// across reconnections, without any shared assignment table.
pub fn single_stage_id(stage_type: &str, account_id: AccountId) -> String {
    format!("{stage_type}-{account_id}")
}

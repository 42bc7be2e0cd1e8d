use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::dialect::Dialect;
use crate::tree::{DeleteOutcome, GroupPath};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Profile to edit; `Default`, or the first profile, when unset.
    pub profile: Option<String>,
    /// Where commit backups go; next to the target file when unset.
    pub backup_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub dialect: Dialect,
    pub profile: String,
    pub profiles: Vec<String>,
    pub group_count: usize,
    pub item_count: usize,
    pub modified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupSummary {
    pub path: GroupPath,
    pub name: String,
    pub depth: usize,
    pub item_count: usize,
    pub foreign_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum GroupCommand {
    Create {
        path: GroupPath,
    },
    Rename {
        from: GroupPath,
        to: GroupPath,
    },
    Move {
        path: GroupPath,
        new_parent: GroupPath,
    },
    Delete {
        path: GroupPath,
        #[serde(default)]
        keep_items: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCommandOutcome {
    pub command: GroupCommand,
    pub applied: bool,
    /// Path the group ended up at, for create/rename/move.
    pub path: Option<GroupPath>,
    pub deleted: Option<DeleteOutcome>,
    pub error: Option<String>,
}

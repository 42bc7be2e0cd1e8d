mod engine;
mod error;
mod types;

pub use engine::{Engine, Session};
pub use error::{CoreError, CoreErrorCode};
pub use types::{
    EngineOptions, GroupCommand, GroupCommandOutcome, GroupSummary, SessionSummary,
};

pub use crate::dialect::Dialect;
pub use crate::item::{BindType, ItemId, ItemRecord};
pub use crate::merge::{
    GroupMergeStats, ImportOptions, ImportPlan, MergeConflict, MergeInstruction, MergeOp,
    MergeResult, RejectedInstruction,
};
pub use crate::tree::{DeleteOutcome, GroupPath};
pub use crate::writer::CommitReport;

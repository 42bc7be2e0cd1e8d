use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::dialect::{self, AddressMap, Dialect};
use crate::item::{ItemId, ItemRecord};
use crate::layout::ChangeSet;
use crate::merge::{self, ImportOptions, ImportPlan, MergeInstruction, MergeResult};
use crate::scanner::Document;
use crate::serializer;
use crate::tree::{DeleteOutcome, GroupPath, GroupTree};
use crate::writer::{self, CommitReport, WriteOptions};

use super::error::{CoreError, CoreErrorCode};
use super::types::{
    EngineOptions, GroupCommand, GroupCommandOutcome, GroupSummary, SessionSummary,
};

#[derive(Debug, Default, Clone)]
pub struct Engine {
    options: EngineOptions,
}

/// One loaded document plus the group tree of its selected profile.
#[derive(Debug)]
pub struct Session {
    source: Option<PathBuf>,
    document: Document,
    map: AddressMap,
    tree: GroupTree,
    options: EngineOptions,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: EngineOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn open_text(&self, text: impl Into<String>) -> Result<Session, CoreError> {
        Session::load(text.into(), None, self.options.clone())
    }

    pub fn open_path(&self, path: impl AsRef<Path>) -> Result<Session, CoreError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            CoreError::new(
                CoreErrorCode::Io,
                format!("failed to read {}: {e}", path.display()),
            )
        })?;
        Session::load(text, Some(path.to_path_buf()), self.options.clone())
    }
}

impl Session {
    fn load(
        text: String,
        source: Option<PathBuf>,
        options: EngineOptions,
    ) -> Result<Self, CoreError> {
        let document = Document::scan(text)?;
        let map = dialect::resolve(&document, options.profile.as_deref())?;
        let tree = GroupTree::load(&document, &map)?;
        info!(
            dialect = %map.dialect,
            profile = %map.profile,
            groups = tree.len(),
            "loaded saved variables"
        );
        Ok(Self {
            source,
            document,
            map,
            tree,
            options,
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.map.dialect
    }

    pub fn profile(&self) -> &str {
        &self.map.profile
    }

    pub fn profiles(&self) -> &[String] {
        &self.map.profiles
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn tree(&self) -> &GroupTree {
        &self.tree
    }

    pub fn is_modified(&self) -> bool {
        self.tree.is_modified()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            dialect: self.map.dialect,
            profile: self.map.profile.clone(),
            profiles: self.map.profiles.clone(),
            group_count: self.tree.len(),
            item_count: self.tree.all_item_ids().len(),
            modified: self.tree.is_modified(),
        }
    }

    pub fn groups(&self) -> Vec<GroupSummary> {
        self.tree
            .groups()
            .map(|node| GroupSummary {
                path: node.path().clone(),
                name: node.path().leaf().to_string(),
                depth: node.path().depth(),
                item_count: node.items().len(),
                foreign_count: node.foreign_entries().len(),
            })
            .collect()
    }

    pub fn items_in(&self, path: &GroupPath) -> Result<Vec<ItemId>, CoreError> {
        let node = self.tree.node(path).ok_or_else(|| {
            CoreError::new(
                CoreErrorCode::StructuralViolation,
                format!("group `{path}` does not exist"),
            )
        })?;
        Ok(node.items().iter().copied().collect())
    }

    pub fn existing_item_ids(&self) -> BTreeSet<ItemId> {
        self.tree.all_item_ids()
    }

    pub fn create_group(&mut self, path: &GroupPath) -> Result<(), CoreError> {
        self.tree.create_group(path).map_err(|e| rejected("create", e))
    }

    pub fn rename_group(&mut self, from: &GroupPath, to: &GroupPath) -> Result<(), CoreError> {
        self.tree
            .rename_group(from, to)
            .map_err(|e| rejected("rename", e))
    }

    pub fn move_group(
        &mut self,
        path: &GroupPath,
        new_parent: &GroupPath,
    ) -> Result<GroupPath, CoreError> {
        self.tree
            .move_group(path, new_parent)
            .map_err(|e| rejected("move", e))
    }

    pub fn delete_group(
        &mut self,
        path: &GroupPath,
        keep_items: bool,
    ) -> Result<DeleteOutcome, CoreError> {
        self.tree
            .delete_group(path, keep_items)
            .map_err(|e| rejected("delete", e))
    }

    /// Applies each command independently; a rejected command leaves the
    /// tree as it was and does not stop the ones after it.
    pub fn apply_group_commands(&mut self, commands: &[GroupCommand]) -> Vec<GroupCommandOutcome> {
        commands
            .iter()
            .map(|command| {
                let mut outcome = GroupCommandOutcome {
                    command: command.clone(),
                    applied: false,
                    path: None,
                    deleted: None,
                    error: None,
                };
                let result = match command {
                    GroupCommand::Create { path } => self
                        .create_group(path)
                        .map(|()| outcome.path = Some(path.clone())),
                    GroupCommand::Rename { from, to } => self
                        .rename_group(from, to)
                        .map(|()| outcome.path = Some(to.clone())),
                    GroupCommand::Move { path, new_parent } => self
                        .move_group(path, new_parent)
                        .map(|moved| outcome.path = Some(moved)),
                    GroupCommand::Delete { path, keep_items } => self
                        .delete_group(path, *keep_items)
                        .map(|deleted| outcome.deleted = Some(deleted)),
                };
                match result {
                    Ok(()) => outcome.applied = true,
                    Err(err) => outcome.error = Some(err.message),
                }
                outcome
            })
            .collect()
    }

    pub fn merge(&mut self, batch: &[MergeInstruction]) -> MergeResult {
        merge::apply(&mut self.tree, batch)
    }

    pub fn plan_import(&self, records: &[ItemRecord], options: &ImportOptions) -> ImportPlan {
        merge::plan_import(&self.tree, records, options)
    }

    pub fn plan_remove_everywhere(&self, items: &[ItemId]) -> Vec<MergeInstruction> {
        merge::plan_remove_everywhere(&self.tree, items)
    }

    pub fn render(&self) -> Result<ChangeSet, CoreError> {
        Ok(serializer::render(&self.document, &self.map, &self.tree)?)
    }

    pub fn to_text_unmodified(&self) -> &str {
        self.document.text()
    }

    /// The document as it would be written, verified but not saved.
    pub fn to_text_modified(&self) -> Result<String, CoreError> {
        let changes = self.render()?;
        let text = changes.apply(self.document.text()).map_err(|e| {
            CoreError::new(CoreErrorCode::InternalInvariant, e.to_string())
        })?;
        self.verify(&text)?;
        Ok(text)
    }

    /// Writes the rendered changes back to the file this session was opened from.
    pub fn commit(&mut self) -> Result<CommitReport, CoreError> {
        let target = self.source.clone().ok_or_else(|| {
            CoreError::new(
                CoreErrorCode::Io,
                "session was not opened from a file; use commit_to",
            )
        })?;
        self.commit_to(&target)
    }

    /// Writes to `target`, which must still hold the text this session loaded.
    pub fn commit_to(&mut self, target: &Path) -> Result<CommitReport, CoreError> {
        let changes = self.render()?;
        let updated = changes.apply(self.document.text()).map_err(|e| {
            CoreError::new(CoreErrorCode::InternalInvariant, e.to_string())
        })?;
        self.verify(&updated)?;

        let options = WriteOptions {
            backup_dir: self.options.backup_dir.clone(),
        };
        let report = writer::commit(self.document.text(), &changes, target, &options)?;

        if !changes.is_empty() {
            let reloaded = Session::load(updated, Some(target.to_path_buf()), self.options.clone())?;
            *self = reloaded;
        }
        Ok(report)
    }

    /// Re-reads rendered text the way a fresh load would and checks that it
    /// lands on the same dialect, profile and group contents.
    fn verify(&self, text: &str) -> Result<(), CoreError> {
        let invariant = |detail: String| CoreError::new(CoreErrorCode::InternalInvariant, detail);

        let root = self.tree.root();
        if !root.items().is_empty() || !root.foreign_entries().is_empty() {
            return Err(invariant(
                "items outside every group cannot be written".to_string(),
            ));
        }

        let document = Document::scan(text)
            .map_err(|e| invariant(format!("rendered document no longer scans: {e}")))?;
        let map = dialect::resolve(&document, Some(&self.map.profile))
            .map_err(|e| invariant(format!("rendered document lost its layout: {e}")))?;
        if map.dialect != self.map.dialect {
            return Err(invariant(format!(
                "rendered document reads as {} instead of {}",
                map.dialect, self.map.dialect
            )));
        }
        let reloaded = GroupTree::load(&document, &map)
            .map_err(|e| invariant(format!("rendered groups do not load: {e}")))?;

        // Ancestors that only exist because of a descendant are never written.
        let expected: Vec<_> = self
            .tree
            .groups()
            .filter(|n| n.origin().is_some() || n.is_created() || n.items_dirty())
            .map(|n| (n.path(), n.items()))
            .collect();
        let actual: Vec<_> = reloaded
            .groups()
            .filter(|n| n.origin().is_some())
            .map(|n| (n.path(), n.items()))
            .collect();
        if expected != actual {
            return Err(invariant(
                "rendered groups differ from the edited tree".to_string(),
            ));
        }
        Ok(())
    }
}

fn rejected(action: &str, err: crate::tree::StructuralViolation) -> CoreError {
    warn!(action, error = %err, "rejected group operation");
    CoreError::from(err)
}

//! In-memory group hierarchy for one profile.
//!
//! Groups are keyed by their full backtick-delimited path, the same way the
//! addon stores them. Every non-root group's parent is always present, so the
//! map is a tree and "children" are simply the paths one segment longer.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::dialect::{AddressMap, ItemListLocation, ItemListShape};
use crate::item::{ItemEncoding, ItemId};
use crate::scanner::{Document, Entry, Key, SpanId, Value};

pub const PATH_SEPARATOR: char = '`';

/// Canonical group path. The empty path is the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupPath(String);

impl GroupPath {
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn parse(raw: &str) -> Result<Self, StructuralViolation> {
        let invalid = |reason| StructuralViolation::InvalidPath {
            path: raw.to_string(),
            reason,
        };
        if raw.is_empty() {
            return Err(invalid("path is empty"));
        }
        if raw.split(PATH_SEPARATOR).any(str::is_empty) {
            return Err(invalid("path has an empty segment"));
        }
        if raw.chars().any(char::is_control) {
            return Err(invalid("path contains a control character"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(PATH_SEPARATOR).filter(|s| !s.is_empty())
    }

    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    pub fn leaf(&self) -> &str {
        self.0.rsplit(PATH_SEPARATOR).next().unwrap_or_default()
    }

    pub fn parent(&self) -> Option<GroupPath> {
        if self.is_root() {
            return None;
        }
        Some(match self.0.rfind(PATH_SEPARATOR) {
            Some(idx) => Self(self.0[..idx].to_string()),
            None => Self::root(),
        })
    }

    pub fn join(&self, leaf: &str) -> Result<GroupPath, StructuralViolation> {
        if self.is_root() {
            Self::parse(leaf)
        } else {
            Self::parse(&format!("{}{PATH_SEPARATOR}{leaf}", self.0))
        }
    }

    /// True when `self` lies strictly below `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &GroupPath) -> bool {
        if ancestor.is_root() {
            return !self.is_root();
        }
        self.0.len() > ancestor.0.len()
            && self.0.starts_with(&ancestor.0)
            && self.0[ancestor.0.len()..].starts_with(PATH_SEPARATOR)
    }

    pub fn is_within(&self, ancestor: &GroupPath) -> bool {
        self == ancestor || self.is_descendant_of(ancestor)
    }

    /// Swaps the `from` prefix for `to`; `self` must lie within `from`.
    fn rebase(&self, from: &GroupPath, to: &GroupPath) -> GroupPath {
        let suffix = &self.0[from.0.len()..];
        Self(format!("{}{suffix}", to.0))
    }

    /// `self` followed by every ancestor up to (excluding) the root.
    fn lineage(&self) -> Vec<GroupPath> {
        let mut out = Vec::new();
        let mut current = Some(self.clone());
        while let Some(path) = current {
            if path.is_root() {
                break;
            }
            current = path.parent();
            out.push(path);
        }
        out
    }
}

impl Ord for GroupPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments().cmp(other.segments())
    }
}

impl PartialOrd for GroupPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl TryFrom<String> for GroupPath {
    type Error = StructuralViolation;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        if raw.is_empty() {
            Ok(Self::root())
        } else {
            Self::parse(&raw)
        }
    }
}

impl From<GroupPath> for String {
    fn from(path: GroupPath) -> Self {
        path.0
    }
}

impl fmt::Display for GroupPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("(root)")
        } else {
            f.write_str(&self.0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralViolation {
    #[error("invalid group path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("group `{0}` already exists")]
    DuplicatePath(GroupPath),
    #[error("group `{0}` does not exist")]
    NotFound(GroupPath),
    #[error("cannot place `{path}` under `{target}`: target is the group itself or one of its descendants")]
    Cycle { path: GroupPath, target: GroupPath },
    #[error("the root group cannot be {0}")]
    RootImmutable(&'static str),
    #[error("`{0}` is a top-level group; its items have no parent group to move to")]
    NoParentGroup(GroupPath),
}

/// An item-list entry this engine does not own, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignEntry {
    pub text: String,
    pub positional: bool,
    /// Item whose canonical key this entry uses with a value other than `true`.
    pub shadowed_item: Option<ItemId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupNode {
    path: GroupPath,
    items: BTreeSet<ItemId>,
    foreign: Vec<ForeignEntry>,
    origin: Option<GroupPath>,
    created: bool,
    items_dirty: bool,
}

impl GroupNode {
    fn new(path: GroupPath) -> Self {
        Self {
            path,
            items: BTreeSet::new(),
            foreign: Vec::new(),
            origin: None,
            created: false,
            items_dirty: false,
        }
    }

    pub fn path(&self) -> &GroupPath {
        &self.path
    }

    pub fn items(&self) -> &BTreeSet<ItemId> {
        &self.items
    }

    pub fn foreign_entries(&self) -> &[ForeignEntry] {
        &self.foreign
    }

    /// Path this group had in the loaded document, if it appeared there.
    pub fn origin(&self) -> Option<&GroupPath> {
        self.origin.as_ref()
    }

    /// Created by a mutation during this session.
    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn items_dirty(&self) -> bool {
        self.items_dirty
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("`{path}` should be a table")]
    NotATable { path: String },
    #[error("group key {key} under `{container}` is not a valid group path: {reason}")]
    InvalidGroupKey {
        container: String,
        key: String,
        reason: String,
    },
    #[error("group `{0}` appears twice")]
    DuplicateGroup(GroupPath),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub removed_groups: usize,
    pub rehomed_items: usize,
    pub discarded_items: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupTree {
    nodes: BTreeMap<GroupPath, GroupNode>,
    /// Loaded paths whose groups were deleted this session.
    removed: BTreeSet<GroupPath>,
}

impl Default for GroupTree {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupTree {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(GroupPath::root(), GroupNode::new(GroupPath::root()));
        Self {
            nodes,
            removed: BTreeSet::new(),
        }
    }

    pub fn load(doc: &Document, map: &AddressMap) -> Result<Self, LoadError> {
        let mut tree = Self::new();

        if let Some(container) = resolve_table(doc, &map.group_container)? {
            let container_name = map.group_container.to_string();
            for entry in &doc.span(container).entries {
                if is_base_group(entry) {
                    continue;
                }
                let path = group_key(doc, entry, &container_name)?;
                let table = entry.table().ok_or_else(|| LoadError::NotATable {
                    path: format!("{container_name}.{path}"),
                })?;
                let node = tree.insert_loaded(path.clone())?;

                if let ItemListLocation::InGroup { key } = map.item_list
                    && let Some(items) = doc.entry(table, key)
                {
                    let span = items.table().ok_or_else(|| LoadError::NotATable {
                        path: format!("{container_name}.{path}.{key}"),
                    })?;
                    read_items(doc, span, map, node);
                }
            }
        }

        if let ItemListLocation::Sibling { container } = &map.item_list
            && let Some(span) = resolve_table(doc, container)?
        {
            let container_name = container.to_string();
            for entry in &doc.span(span).entries {
                if is_base_group(entry) {
                    continue;
                }
                let path = group_key(doc, entry, &container_name)?;
                let table = entry.table().ok_or_else(|| LoadError::NotATable {
                    path: format!("{container_name}.{path}"),
                })?;
                let node = tree
                    .nodes
                    .entry(path.clone())
                    .or_insert_with(|| GroupNode::new(path.clone()));
                node.origin = Some(path.clone());
                read_items(doc, table, map, node);
            }
        }

        let orphans: Vec<GroupPath> = tree
            .nodes
            .keys()
            .flat_map(|p| p.lineage().into_iter().skip(1))
            .filter(|p| !tree.nodes.contains_key(p))
            .collect();
        for path in orphans {
            tree.nodes
                .entry(path.clone())
                .or_insert_with(|| GroupNode::new(path));
        }

        debug!(groups = tree.len(), "loaded group tree");
        Ok(tree)
    }

    fn insert_loaded(&mut self, path: GroupPath) -> Result<&mut GroupNode, LoadError> {
        if self.nodes.get(&path).is_some_and(|n| n.origin.is_some()) {
            return Err(LoadError::DuplicateGroup(path));
        }
        let node = self
            .nodes
            .entry(path.clone())
            .or_insert_with(|| GroupNode::new(path.clone()));
        node.origin = Some(path);
        Ok(node)
    }

    /// Number of groups, excluding the root.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, path: &GroupPath) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn node(&self, path: &GroupPath) -> Option<&GroupNode> {
        self.nodes.get(path)
    }

    pub fn root(&self) -> &GroupNode {
        &self.nodes[&GroupPath::root()]
    }

    /// All groups except the root, parents before children.
    pub fn groups(&self) -> impl Iterator<Item = &GroupNode> {
        self.nodes.values().filter(|n| !n.path.is_root())
    }

    pub fn children(&self, path: &GroupPath) -> Vec<&GroupPath> {
        let depth = path.depth() + 1;
        self.nodes
            .keys()
            .filter(|p| p.depth() == depth && p.is_descendant_of(path))
            .collect()
    }

    /// `path` and every group below it.
    pub fn subtree(&self, path: &GroupPath) -> Vec<GroupPath> {
        self.nodes
            .range(path.clone()..)
            .map(|(p, _)| p)
            .take_while(|p| p.is_within(path))
            .cloned()
            .collect()
    }

    pub fn all_item_ids(&self) -> BTreeSet<ItemId> {
        self.groups().flat_map(|n| n.items.iter().copied()).collect()
    }

    pub fn groups_containing(&self, item: ItemId) -> Vec<GroupPath> {
        self.groups()
            .filter(|n| n.items.contains(&item))
            .map(|n| n.path.clone())
            .collect()
    }

    /// True when anything differs from the loaded document.
    pub fn is_modified(&self) -> bool {
        !self.removed.is_empty()
            || self.nodes.values().any(|n| {
                n.items_dirty || n.created || n.origin.as_ref().is_some_and(|o| *o != n.path)
            })
    }

    pub fn removed_origins(&self) -> &BTreeSet<GroupPath> {
        &self.removed
    }

    pub fn create_group(&mut self, path: &GroupPath) -> Result<(), StructuralViolation> {
        if path.is_root() {
            return Err(StructuralViolation::RootImmutable("created"));
        }
        if self.contains(path) {
            return Err(StructuralViolation::DuplicatePath(path.clone()));
        }
        self.create_with_ancestors(path);
        Ok(())
    }

    /// Creates `path` (and missing ancestors) unless it already exists.
    /// Returns whether anything was created.
    pub fn ensure_group(&mut self, path: &GroupPath) -> Result<bool, StructuralViolation> {
        if path.is_root() {
            return Err(StructuralViolation::RootImmutable("a merge target"));
        }
        if self.contains(path) {
            return Ok(false);
        }
        self.create_with_ancestors(path);
        Ok(true)
    }

    fn create_with_ancestors(&mut self, path: &GroupPath) {
        for p in path.lineage() {
            if self.nodes.contains_key(&p) {
                break;
            }
            let mut node = GroupNode::new(p.clone());
            node.created = true;
            self.nodes.insert(p, node);
        }
    }

    pub fn rename_group(
        &mut self,
        old: &GroupPath,
        new: &GroupPath,
    ) -> Result<(), StructuralViolation> {
        if old.is_root() || new.is_root() {
            return Err(StructuralViolation::RootImmutable("renamed"));
        }
        if !self.contains(old) {
            return Err(StructuralViolation::NotFound(old.clone()));
        }
        if old == new {
            return Ok(());
        }
        if new.is_descendant_of(old) {
            return Err(StructuralViolation::Cycle {
                path: old.clone(),
                target: new.clone(),
            });
        }
        if self.contains(new) {
            return Err(StructuralViolation::DuplicatePath(new.clone()));
        }

        if let Some(parent) = new.parent()
            && !parent.is_root()
        {
            self.create_with_ancestors(&parent);
        }
        for path in self.subtree(old) {
            if let Some(mut node) = self.nodes.remove(&path) {
                let rebased = path.rebase(old, new);
                node.path = rebased.clone();
                self.nodes.insert(rebased, node);
            }
        }
        Ok(())
    }

    /// Moves `path` under `new_parent`, keeping its leaf name. Returns the new path.
    pub fn move_group(
        &mut self,
        path: &GroupPath,
        new_parent: &GroupPath,
    ) -> Result<GroupPath, StructuralViolation> {
        if path.is_root() {
            return Err(StructuralViolation::RootImmutable("moved"));
        }
        if !self.contains(path) {
            return Err(StructuralViolation::NotFound(path.clone()));
        }
        if new_parent.is_within(path) {
            return Err(StructuralViolation::Cycle {
                path: path.clone(),
                target: new_parent.clone(),
            });
        }
        if !self.contains(new_parent) {
            return Err(StructuralViolation::NotFound(new_parent.clone()));
        }
        let destination = new_parent.join(path.leaf())?;
        if destination == *path {
            return Ok(destination);
        }
        self.rename_group(path, &destination)?;
        Ok(destination)
    }

    pub fn delete_group(
        &mut self,
        path: &GroupPath,
        keep_items: bool,
    ) -> Result<DeleteOutcome, StructuralViolation> {
        if path.is_root() {
            return Err(StructuralViolation::RootImmutable("deleted"));
        }
        if !self.contains(path) {
            return Err(StructuralViolation::NotFound(path.clone()));
        }

        let doomed = self.subtree(path);
        let parent = path.parent().unwrap_or_else(GroupPath::root);
        if keep_items
            && parent.is_root()
            && doomed
                .iter()
                .filter_map(|p| self.nodes.get(p))
                .any(|n| !n.items.is_empty() || !n.foreign.is_empty())
        {
            return Err(StructuralViolation::NoParentGroup(path.clone()));
        }

        let mut items = BTreeSet::new();
        let mut foreign = Vec::new();
        for p in &doomed {
            if let Some(node) = self.nodes.remove(p) {
                self.removed.extend(node.origin);
                items.extend(node.items);
                foreign.extend(node.foreign);
            }
        }

        let mut outcome = DeleteOutcome {
            removed_groups: doomed.len(),
            ..DeleteOutcome::default()
        };
        if !keep_items {
            outcome.discarded_items = items.len();
            return Ok(outcome);
        }

        if let Some(heir) = self.nodes.get_mut(&parent) {
            let before = heir.items.len();
            heir.items.extend(items);
            outcome.rehomed_items = heir.items.len() - before;
            if outcome.rehomed_items > 0 || !foreign.is_empty() {
                heir.foreign.extend(foreign);
                heir.items_dirty = true;
            }
        }
        Ok(outcome)
    }

    /// Returns `true` when the item was newly added.
    pub fn add_item(&mut self, group: &GroupPath, item: ItemId) -> Result<bool, StructuralViolation> {
        if group.is_root() {
            return Err(StructuralViolation::RootImmutable("given items directly"));
        }
        let node = self
            .nodes
            .get_mut(group)
            .ok_or_else(|| StructuralViolation::NotFound(group.clone()))?;
        let added = node.items.insert(item);
        node.items_dirty |= added;
        Ok(added)
    }

    /// Returns `true` when the item was present and removed.
    pub fn remove_item(
        &mut self,
        group: &GroupPath,
        item: ItemId,
    ) -> Result<bool, StructuralViolation> {
        let node = self
            .nodes
            .get_mut(group)
            .ok_or_else(|| StructuralViolation::NotFound(group.clone()))?;
        let removed = node.items.remove(&item);
        node.items_dirty |= removed;
        Ok(removed)
    }
}

fn resolve_table(
    doc: &Document,
    path: &crate::dialect::KeyPath,
) -> Result<Option<SpanId>, LoadError> {
    if let Some(span) = path.resolve(doc) {
        return Ok(Some(span));
    }
    // Present but not a table is malformed; simply absent is fine.
    let present = path
        .parent()
        .and_then(|parent| parent.resolve(doc))
        .and_then(|parent| doc.entry(parent, path.last()))
        .is_some_and(|entry| !matches!(entry.value, Value::Nil));
    if present {
        return Err(LoadError::NotATable {
            path: path.to_string(),
        });
    }
    Ok(None)
}

/// The addon's own settings for the implicit base group live under `[""]`.
fn is_base_group(entry: &Entry) -> bool {
    !entry.positional && entry.key.as_name() == Some("")
}

fn group_key(doc: &Document, entry: &Entry, container: &str) -> Result<GroupPath, LoadError> {
    let raw = match &entry.key {
        Key::Name(name) if !entry.positional => name,
        other => {
            return Err(LoadError::InvalidGroupKey {
                container: container.to_string(),
                key: entry
                    .key_range
                    .map(|r| doc.slice(r).to_string())
                    .unwrap_or_else(|| other.to_string()),
                reason: "group keys must be strings".to_string(),
            });
        }
    };
    GroupPath::parse(raw).map_err(|e| LoadError::InvalidGroupKey {
        container: container.to_string(),
        key: format!("{raw:?}"),
        reason: e.to_string(),
    })
}

fn read_items(doc: &Document, span: SpanId, map: &AddressMap, node: &mut GroupNode) {
    for entry in &doc.span(span).entries {
        let decoded = match (map.item_shape, &entry.key, &entry.value) {
            (ItemListShape::KeyedSet, Key::Name(raw), Value::Bool(true)) if !entry.positional => {
                map.encoding.decode(raw)
            }
            (ItemListShape::Array, _, Value::Str(raw))
                if entry.positional && map.encoding != ItemEncoding::BareId =>
            {
                map.encoding.decode(raw)
            }
            (ItemListShape::Array, _, Value::Number(raw))
                if entry.positional && map.encoding == ItemEncoding::BareId =>
            {
                map.encoding.decode(raw)
            }
            _ => None,
        };
        match decoded {
            Some(id) => {
                node.items.insert(id);
            }
            None => {
                let shadowed_item = match (map.item_shape, &entry.key) {
                    (ItemListShape::KeyedSet, Key::Name(raw)) if !entry.positional => {
                        map.encoding.decode(raw)
                    }
                    _ => None,
                };
                node.foreign.push(ForeignEntry {
                    text: doc.slice(entry.range).to_string(),
                    positional: entry.positional,
                    shadowed_item,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(raw: &str) -> GroupPath {
        GroupPath::parse(raw).expect("valid path")
    }

    fn id(raw: u32) -> ItemId {
        ItemId::new(raw).expect("non-zero")
    }

    #[test]
    fn path_helpers() {
        let p = path("A`B`C");
        assert_eq!(p.leaf(), "C");
        assert_eq!(p.parent(), Some(path("A`B")));
        assert_eq!(path("A").parent(), Some(GroupPath::root()));
        assert!(p.is_descendant_of(&path("A")));
        assert!(!path("AB").is_descendant_of(&path("A")));
        assert!(p.is_descendant_of(&GroupPath::root()));
        assert_eq!(p.depth(), 3);
        assert!(GroupPath::parse("A``B").is_err());
        assert!(GroupPath::parse("`A").is_err());
        assert!(GroupPath::parse("").is_err());
    }

    #[test]
    fn subtree_is_contiguous_in_path_order() {
        let mut tree = GroupTree::new();
        for p in ["A", "A`B", "A`B`C", "AB", "A`Z"] {
            tree.ensure_group(&path(p)).expect("create");
        }
        let sub: Vec<String> = tree
            .subtree(&path("A"))
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(sub, vec!["A", "A`B", "A`B`C", "A`Z"]);
        assert_eq!(tree.children(&path("A")), vec![&path("A`B"), &path("A`Z")]);
    }

    #[test]
    fn create_fills_in_missing_ancestors() {
        let mut tree = GroupTree::new();
        tree.create_group(&path("Armor`Cloth`Chest")).expect("create");
        assert!(tree.contains(&path("Armor")));
        assert!(tree.contains(&path("Armor`Cloth")));
        assert_eq!(
            tree.create_group(&path("Armor")),
            Err(StructuralViolation::DuplicatePath(path("Armor")))
        );
    }

    #[test]
    fn rename_rejects_moving_into_itself() {
        let mut tree = GroupTree::new();
        tree.create_group(&path("A`B")).expect("create");
        let before = tree.clone();
        let err = tree.rename_group(&path("A"), &path("A`B`X")).expect_err("cycle");
        assert!(matches!(err, StructuralViolation::Cycle { .. }));
        assert_eq!(tree, before);
    }

    #[test]
    fn delete_keep_items_rehomes_to_parent() {
        let mut tree = GroupTree::new();
        tree.create_group(&path("A`B`C")).expect("create");
        tree.add_item(&path("A`B"), id(1)).expect("add");
        tree.add_item(&path("A`B`C"), id(2)).expect("add");
        tree.add_item(&path("A"), id(1)).expect("add");

        let outcome = tree.delete_group(&path("A`B"), true).expect("delete");
        assert_eq!(outcome.removed_groups, 2);
        assert_eq!(outcome.rehomed_items, 1);
        let a = tree.node(&path("A")).expect("A survives");
        assert_eq!(a.items().iter().copied().collect::<Vec<_>>(), vec![id(1), id(2)]);
    }
}

//! Batch application of item add/remove instructions against a group tree.
//!
//! The final tree depends only on the set of instructions in a batch, never on
//! their order. Order is used for reporting: the first occurrence of a
//! duplicate is the one that does the work, later copies are counted as
//! already present (or not found, for removals).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::item::{BindType, ItemId, ItemRecord};
use crate::tree::{GroupPath, GroupTree, StructuralViolation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MergeOp {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MergeInstruction {
    pub item: ItemId,
    pub group: GroupPath,
    pub op: MergeOp,
}

impl MergeInstruction {
    pub fn add(item: ItemId, group: GroupPath) -> Self {
        Self {
            item,
            group,
            op: MergeOp::Add,
        }
    }

    pub fn remove(item: ItemId, group: GroupPath) -> Self {
        Self {
            item,
            group,
            op: MergeOp::Remove,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMergeStats {
    pub added: usize,
    pub already_present: usize,
    pub removed: usize,
    pub not_found: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeConflict {
    /// Add and Remove of the same item for the same group; neither is applied.
    Contradictory { item: ItemId, group: GroupPath },
    /// Add into one group and Remove from another; both are applied.
    CrossGroup {
        item: ItemId,
        added_to: Vec<GroupPath>,
        removed_from: Vec<GroupPath>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedInstruction {
    pub instruction: MergeInstruction,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub groups: BTreeMap<GroupPath, GroupMergeStats>,
    pub conflicts: Vec<MergeConflict>,
    pub rejected: Vec<RejectedInstruction>,
    pub created_groups: Vec<GroupPath>,
}

impl MergeResult {
    pub fn total(&self) -> GroupMergeStats {
        self.groups
            .values()
            .fold(GroupMergeStats::default(), |acc, s| GroupMergeStats {
                added: acc.added + s.added,
                already_present: acc.already_present + s.already_present,
                removed: acc.removed + s.removed,
                not_found: acc.not_found + s.not_found,
            })
    }

    pub fn changed(&self) -> bool {
        let total = self.total();
        total.added > 0 || total.removed > 0 || !self.created_groups.is_empty()
    }
}

pub fn apply(tree: &mut GroupTree, batch: &[MergeInstruction]) -> MergeResult {
    let mut result = MergeResult::default();

    let mut ops: HashMap<(ItemId, &GroupPath), BTreeSet<MergeOp>> = HashMap::new();
    for ins in batch {
        ops.entry((ins.item, &ins.group)).or_default().insert(ins.op);
    }

    let mut seen: BTreeSet<(ItemId, &GroupPath)> = BTreeSet::new();
    let mut first_seen: HashSet<&MergeInstruction> = HashSet::new();
    let mut cross: BTreeMap<ItemId, (Vec<GroupPath>, Vec<GroupPath>)> = BTreeMap::new();

    for ins in batch {
        let contradictory = ops
            .get(&(ins.item, &ins.group))
            .is_some_and(|set| set.len() > 1);
        if contradictory {
            if seen.insert((ins.item, &ins.group)) {
                warn!(item = %ins.item, group = %ins.group, "conflicting add and remove, skipping both");
                result.conflicts.push(MergeConflict::Contradictory {
                    item: ins.item,
                    group: ins.group.clone(),
                });
            }
            continue;
        }

        if ins.group.is_root() {
            let reason = StructuralViolation::RootImmutable("a merge target").to_string();
            warn!(item = %ins.item, %reason, "rejected merge instruction");
            result.rejected.push(RejectedInstruction {
                instruction: ins.clone(),
                reason,
            });
            continue;
        }

        let first = first_seen.insert(ins);
        let stats = result.groups.entry(ins.group.clone()).or_default();
        match ins.op {
            MergeOp::Add => {
                if !tree.contains(&ins.group) {
                    match tree.ensure_group(&ins.group) {
                        Ok(_) => result.created_groups.push(ins.group.clone()),
                        Err(err) => {
                            result.rejected.push(RejectedInstruction {
                                instruction: ins.clone(),
                                reason: err.to_string(),
                            });
                            continue;
                        }
                    }
                }
                match tree.add_item(&ins.group, ins.item) {
                    Ok(true) => stats.added += 1,
                    Ok(false) => stats.already_present += 1,
                    Err(err) => result.rejected.push(RejectedInstruction {
                        instruction: ins.clone(),
                        reason: err.to_string(),
                    }),
                }
                if first {
                    cross.entry(ins.item).or_default().0.push(ins.group.clone());
                }
            }
            MergeOp::Remove => {
                match tree.remove_item(&ins.group, ins.item) {
                    Ok(true) => stats.removed += 1,
                    Ok(false) | Err(StructuralViolation::NotFound(_)) => stats.not_found += 1,
                    Err(err) => result.rejected.push(RejectedInstruction {
                        instruction: ins.clone(),
                        reason: err.to_string(),
                    }),
                }
                if first {
                    cross.entry(ins.item).or_default().1.push(ins.group.clone());
                }
            }
        }
    }

    for (item, (added_to, removed_from)) in cross {
        if !added_to.is_empty() && !removed_from.is_empty() {
            result.conflicts.push(MergeConflict::CrossGroup {
                item,
                added_to,
                removed_from,
            });
        }
    }

    let total = result.total();
    debug!(
        instructions = batch.len(),
        added = total.added,
        already_present = total.already_present,
        removed = total.removed,
        not_found = total.not_found,
        conflicts = result.conflicts.len(),
        "applied merge batch"
    );
    result
}

/// Where imported records land.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOptions {
    /// Put every record into this group instead of its category group.
    pub target: Option<GroupPath>,
    /// Prefix prepended to category groups, e.g. `Imported` gives `Imported`Armor`.
    pub category_prefix: Option<GroupPath>,
    /// Only keep records with one of these bind types. Empty keeps everything.
    #[serde(default)]
    pub bind: Vec<BindType>,
    /// Skip ids that already sit in any group of the profile.
    #[serde(default)]
    pub skip_existing: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportPlan {
    pub batch: Vec<MergeInstruction>,
    pub skipped_existing: Vec<ItemId>,
    pub filtered_by_bind: Vec<ItemId>,
    pub invalid_category: Vec<(ItemId, String)>,
}

/// Turns fetched records into an Add batch.
pub fn plan_import(tree: &GroupTree, records: &[ItemRecord], options: &ImportOptions) -> ImportPlan {
    let existing = if options.skip_existing {
        tree.all_item_ids()
    } else {
        BTreeSet::new()
    };
    let mut plan = ImportPlan::default();

    for record in records {
        if !options.bind.is_empty() && !options.bind.contains(&record.bind) {
            plan.filtered_by_bind.push(record.id);
            continue;
        }
        if existing.contains(&record.id) {
            plan.skipped_existing.push(record.id);
            continue;
        }
        let group = match &options.target {
            Some(target) => Ok(target.clone()),
            None => category_group(options.category_prefix.as_ref(), &record.category),
        };
        match group {
            Ok(group) => plan.batch.push(MergeInstruction::add(record.id, group)),
            Err(err) => plan.invalid_category.push((record.id, err.to_string())),
        }
    }

    debug!(
        records = records.len(),
        planned = plan.batch.len(),
        skipped = plan.skipped_existing.len(),
        filtered = plan.filtered_by_bind.len(),
        "planned import"
    );
    plan
}

fn category_group(
    prefix: Option<&GroupPath>,
    category: &str,
) -> Result<GroupPath, StructuralViolation> {
    let category = category.trim();
    match prefix {
        Some(prefix) => prefix.join(category),
        None => GroupPath::parse(category),
    }
}

/// A Remove instruction for every group currently holding each id.
pub fn plan_remove_everywhere(tree: &GroupTree, items: &[ItemId]) -> Vec<MergeInstruction> {
    let mut batch = Vec::new();
    for &item in items {
        for group in tree.groups_containing(item) {
            batch.push(MergeInstruction::remove(item, group));
        }
    }
    batch
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
    fn duplicate_add_counts_once_as_added() {
        let mut tree = GroupTree::new();
        let batch = vec![
            MergeInstruction::add(id(12345), path("Weapons")),
            MergeInstruction::add(id(12345), path("Weapons")),
        ];
        let result = apply(&mut tree, &batch);
        let stats = result.groups[&path("Weapons")];
        assert_eq!(stats.added, 1);
        assert_eq!(stats.already_present, 1);
        assert_eq!(result.created_groups, vec![path("Weapons")]);
        assert_eq!(tree.node(&path("Weapons")).expect("group").items().len(), 1);
    }

    #[test]
    fn same_group_add_and_remove_is_skipped_in_any_order() {
        let forward = vec![
            MergeInstruction::add(id(7), path("A")),
            MergeInstruction::remove(id(7), path("A")),
        ];
        let backward: Vec<_> = forward.iter().rev().cloned().collect();

        let mut first = GroupTree::new();
        first.create_group(&path("A")).expect("create");
        let mut second = first.clone();

        let a = apply(&mut first, &forward);
        let b = apply(&mut second, &backward);
        assert_eq!(first, second);
        assert_eq!(a.conflicts.len(), 1);
        assert_eq!(b.conflicts.len(), 1);
        assert!(first.node(&path("A")).expect("A").items().is_empty());
    }

    #[test]
    fn cross_group_instructions_are_both_honored() {
        let mut tree = GroupTree::new();
        tree.create_group(&path("Old")).expect("create");
        tree.add_item(&path("Old"), id(3)).expect("add");

        let result = apply(
            &mut tree,
            &[
                MergeInstruction::add(id(3), path("New")),
                MergeInstruction::remove(id(3), path("Old")),
            ],
        );
        assert!(matches!(
            result.conflicts.as_slice(),
            [MergeConflict::CrossGroup { .. }]
        ));
        assert_eq!(tree.groups_containing(id(3)), vec![path("New")]);
    }

    #[test]
    fn remove_from_missing_group_is_not_found() {
        let mut tree = GroupTree::new();
        let result = apply(&mut tree, &[MergeInstruction::remove(id(1), path("Nope"))]);
        assert_eq!(result.groups[&path("Nope")].not_found, 1);
        assert!(result.rejected.is_empty());
        assert!(!tree.contains(&path("Nope")));
    }

    #[test]
    fn add_to_root_is_rejected_without_stopping_the_batch() {
        let mut tree = GroupTree::new();
        let result = apply(
            &mut tree,
            &[
                MergeInstruction::add(id(1), GroupPath::root()),
                MergeInstruction::add(id(2), path("Kept")),
            ],
        );
        assert_eq!(result.rejected.len(), 1);
        assert!(result.rejected[0].instruction.group.is_root());
        assert!(tree.root().items().is_empty());
        assert_eq!(tree.groups_containing(id(2)), vec![path("Kept")]);
    }

    #[test]
    fn import_plan_filters_and_skips() {
        let mut tree = GroupTree::new();
        tree.create_group(&path("Armor")).expect("create");
        tree.add_item(&path("Armor"), id(1)).expect("add");

        let records = vec![
            ItemRecord {
                id: id(1),
                category: "Armor".to_string(),
                bind: BindType::OnEquip,
            },
            ItemRecord {
                id: id(2),
                category: "Armor`Cloth".to_string(),
                bind: BindType::OnEquip,
            },
            ItemRecord {
                id: id(3),
                category: "Quest".to_string(),
                bind: BindType::Quest,
            },
        ];
        let options = ImportOptions {
            bind: vec![BindType::OnEquip],
            skip_existing: true,
            ..ImportOptions::default()
        };
        let plan = plan_import(&tree, &records, &options);
        assert_eq!(plan.batch, vec![MergeInstruction::add(id(2), path("Armor`Cloth"))]);
        assert_eq!(plan.skipped_existing, vec![id(1)]);
        assert_eq!(plan.filtered_by_bind, vec![id(3)]);
    }
}

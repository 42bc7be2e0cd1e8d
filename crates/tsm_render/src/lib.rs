use std::fmt::Write as _;

use serde_json::{Map as JsonMap, Value as JsonValue};
use tsm_core::core_api::{
    CommitReport, GroupCommand, GroupCommandOutcome, GroupMergeStats, GroupPath, GroupSummary,
    ImportPlan, ItemId, MergeConflict, MergeResult, Session,
};

const GROUP_COL_WIDTH: usize = 40;
const STATS_COL_WIDTH: usize = 8;
const TREE_INDENT: &str = "  ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JsonStyle {
    #[default]
    CanonicalV1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextStyle {
    #[default]
    Tree,
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextRenderOptions {
    /// List item ids under each group.
    pub verbose: bool,
}

pub fn render_summary_json(session: &Session, style: JsonStyle) -> JsonValue {
    match style {
        JsonStyle::CanonicalV1 => JsonValue::Object(summary_json(session)),
    }
}

pub fn render_summary_text(session: &Session) -> String {
    let summary = session.summary();
    let mut out = String::new();
    writeln!(&mut out, "Dialect:  {}", summary.dialect).expect("writing to String cannot fail");
    writeln!(&mut out, "Profile:  {}", summary.profile).expect("writing to String cannot fail");
    if summary.profiles.len() > 1 {
        writeln!(&mut out, "Profiles: {}", summary.profiles.join(", "))
            .expect("writing to String cannot fail");
    }
    writeln!(&mut out, "Groups:   {}", summary.group_count)
        .expect("writing to String cannot fail");
    writeln!(&mut out, "Items:    {}", summary.item_count)
        .expect("writing to String cannot fail");
    if summary.modified {
        writeln!(&mut out, "(unsaved changes)").expect("writing to String cannot fail");
    }
    out
}

pub fn render_groups_json(session: &Session, style: JsonStyle) -> JsonValue {
    match style {
        JsonStyle::CanonicalV1 => {
            let mut out = summary_json(session);
            let groups = session
                .groups()
                .iter()
                .map(|group| {
                    let mut entry = group_json(group);
                    if let Ok(items) = session.items_in(&group.path) {
                        entry.insert("items".to_string(), item_ids_json(&items));
                    }
                    JsonValue::Object(entry)
                })
                .collect();
            out.insert("groups".to_string(), JsonValue::Array(groups));
            JsonValue::Object(out)
        }
    }
}

pub fn render_groups_text(session: &Session, style: TextStyle) -> String {
    render_groups_text_with_options(session, style, TextRenderOptions::default())
}

pub fn render_groups_text_with_options(
    session: &Session,
    style: TextStyle,
    options: TextRenderOptions,
) -> String {
    let groups = session.groups();
    let mut out = String::new();
    writeln!(
        &mut out,
        "{} profile `{}`: {} group{}",
        session.dialect(),
        session.profile(),
        groups.len(),
        plural(groups.len())
    )
    .expect("writing to String cannot fail");

    if groups.is_empty() {
        writeln!(&mut out, "{TREE_INDENT}(no groups)").expect("writing to String cannot fail");
        return out;
    }

    for group in &groups {
        let (indent, label) = match style {
            TextStyle::Tree => (
                TREE_INDENT.repeat(group.depth.saturating_sub(1)),
                group.name.as_str(),
            ),
            TextStyle::Flat => (String::new(), group.path.as_str()),
        };
        let column = fit_column(&format!("{indent}{label}"), GROUP_COL_WIDTH);
        let mut line = format!(
            "{column:<GROUP_COL_WIDTH$} {:>5} item{}",
            group.item_count,
            plural(group.item_count)
        );
        if group.foreign_count > 0 {
            write!(&mut line, " (+{} other)", group.foreign_count)
                .expect("writing to String cannot fail");
        }
        writeln!(&mut out, "{}", line.trim_end()).expect("writing to String cannot fail");

        if options.verbose
            && let Ok(items) = session.items_in(&group.path)
            && !items.is_empty()
        {
            writeln!(&mut out, "{indent}{TREE_INDENT}{}", join_ids(&items))
                .expect("writing to String cannot fail");
        }
    }
    out
}

pub fn render_items_json(path: &GroupPath, items: &[ItemId]) -> JsonValue {
    let mut out = JsonMap::new();
    out.insert("group".to_string(), JsonValue::String(path.as_str().to_string()));
    out.insert("count".to_string(), JsonValue::from(items.len()));
    out.insert("items".to_string(), item_ids_json(items));
    JsonValue::Object(out)
}

pub fn render_items_text(path: &GroupPath, items: &[ItemId]) -> String {
    let mut out = String::new();
    writeln!(
        &mut out,
        "{path}: {} item{}",
        items.len(),
        plural(items.len())
    )
    .expect("writing to String cannot fail");
    for item in items {
        writeln!(&mut out, "{TREE_INDENT}{item}").expect("writing to String cannot fail");
    }
    out
}

pub fn render_merge_json(result: &MergeResult) -> JsonValue {
    let mut out = JsonMap::new();
    out.insert("totals".to_string(), stats_json(&result.total()));

    let mut groups = JsonMap::new();
    for (path, stats) in &result.groups {
        groups.insert(path.as_str().to_string(), stats_json(stats));
    }
    out.insert("groups".to_string(), JsonValue::Object(groups));
    out.insert(
        "created_groups".to_string(),
        paths_json(&result.created_groups),
    );
    out.insert(
        "conflicts".to_string(),
        JsonValue::Array(result.conflicts.iter().map(conflict_json).collect()),
    );
    out.insert(
        "rejected".to_string(),
        JsonValue::Array(
            result
                .rejected
                .iter()
                .map(|rejected| {
                    let mut entry = JsonMap::new();
                    entry.insert(
                        "item".to_string(),
                        JsonValue::from(rejected.instruction.item.get()),
                    );
                    entry.insert(
                        "group".to_string(),
                        JsonValue::String(rejected.instruction.group.as_str().to_string()),
                    );
                    entry.insert(
                        "reason".to_string(),
                        JsonValue::String(rejected.reason.clone()),
                    );
                    JsonValue::Object(entry)
                })
                .collect(),
        ),
    );
    JsonValue::Object(out)
}

pub fn render_merge_text(result: &MergeResult) -> String {
    let mut out = String::new();
    writeln!(
        &mut out,
        "{:<GROUP_COL_WIDTH$} {:>STATS_COL_WIDTH$} {:>STATS_COL_WIDTH$} {:>STATS_COL_WIDTH$} {:>STATS_COL_WIDTH$}",
        "Group", "Added", "Present", "Removed", "Missing"
    )
    .expect("writing to String cannot fail");
    for (path, stats) in &result.groups {
        write_stats_row(&mut out, &fit_column(path.as_str(), GROUP_COL_WIDTH), stats);
    }
    write_stats_row(&mut out, "Total", &result.total());

    for path in &result.created_groups {
        writeln!(&mut out, "created group {path}").expect("writing to String cannot fail");
    }
    for conflict in &result.conflicts {
        writeln!(&mut out, "conflict: {}", describe_conflict(conflict))
            .expect("writing to String cannot fail");
    }
    for rejected in &result.rejected {
        writeln!(
            &mut out,
            "rejected: {} -> {}: {}",
            rejected.instruction.item, rejected.instruction.group, rejected.reason
        )
        .expect("writing to String cannot fail");
    }
    out
}

pub fn render_import_plan_json(plan: &ImportPlan) -> JsonValue {
    let mut out = JsonMap::new();
    out.insert("planned".to_string(), JsonValue::from(plan.batch.len()));
    out.insert(
        "skipped_existing".to_string(),
        item_ids_json(&plan.skipped_existing),
    );
    out.insert(
        "filtered_by_bind".to_string(),
        item_ids_json(&plan.filtered_by_bind),
    );
    out.insert(
        "invalid_category".to_string(),
        JsonValue::Array(
            plan.invalid_category
                .iter()
                .map(|(item, reason)| {
                    let mut entry = JsonMap::new();
                    entry.insert("item".to_string(), JsonValue::from(item.get()));
                    entry.insert("reason".to_string(), JsonValue::String(reason.clone()));
                    JsonValue::Object(entry)
                })
                .collect(),
        ),
    );
    JsonValue::Object(out)
}

pub fn render_import_plan_text(plan: &ImportPlan) -> String {
    let mut out = String::new();
    writeln!(
        &mut out,
        "Import: {} record{} planned",
        plan.batch.len(),
        plural(plan.batch.len())
    )
    .expect("writing to String cannot fail");
    if !plan.skipped_existing.is_empty() {
        writeln!(
            &mut out,
            "{TREE_INDENT}already grouped: {}",
            join_ids(&plan.skipped_existing)
        )
        .expect("writing to String cannot fail");
    }
    if !plan.filtered_by_bind.is_empty() {
        writeln!(
            &mut out,
            "{TREE_INDENT}filtered by bind type: {}",
            join_ids(&plan.filtered_by_bind)
        )
        .expect("writing to String cannot fail");
    }
    for (item, reason) in &plan.invalid_category {
        writeln!(&mut out, "{TREE_INDENT}{item}: {reason}")
            .expect("writing to String cannot fail");
    }
    out
}

pub fn render_group_outcomes_json(outcomes: &[GroupCommandOutcome]) -> JsonValue {
    JsonValue::Array(
        outcomes
            .iter()
            .map(|outcome| {
                let mut entry = JsonMap::new();
                entry.insert(
                    "command".to_string(),
                    JsonValue::String(command_name(&outcome.command).to_string()),
                );
                entry.insert("applied".to_string(), JsonValue::Bool(outcome.applied));
                entry.insert(
                    "path".to_string(),
                    match &outcome.path {
                        Some(path) => JsonValue::String(path.as_str().to_string()),
                        None => JsonValue::Null,
                    },
                );
                if let Some(deleted) = outcome.deleted {
                    let mut counts = JsonMap::new();
                    counts.insert(
                        "removed_groups".to_string(),
                        JsonValue::from(deleted.removed_groups),
                    );
                    counts.insert(
                        "rehomed_items".to_string(),
                        JsonValue::from(deleted.rehomed_items),
                    );
                    counts.insert(
                        "discarded_items".to_string(),
                        JsonValue::from(deleted.discarded_items),
                    );
                    entry.insert("deleted".to_string(), JsonValue::Object(counts));
                }
                entry.insert(
                    "error".to_string(),
                    match &outcome.error {
                        Some(error) => JsonValue::String(error.clone()),
                        None => JsonValue::Null,
                    },
                );
                JsonValue::Object(entry)
            })
            .collect(),
    )
}

pub fn render_group_outcomes_text(outcomes: &[GroupCommandOutcome]) -> String {
    let mut out = String::new();
    for outcome in outcomes {
        let line = match (&outcome.error, &outcome.command) {
            (Some(error), command) => format!("{}: failed: {error}", describe_command(command)),
            (None, GroupCommand::Delete { path, .. }) => match outcome.deleted {
                Some(deleted) => format!(
                    "deleted {path} ({} group{}, {} item{} moved to parent, {} dropped)",
                    deleted.removed_groups,
                    plural(deleted.removed_groups),
                    deleted.rehomed_items,
                    plural(deleted.rehomed_items),
                    deleted.discarded_items
                ),
                None => format!("deleted {path}"),
            },
            (None, GroupCommand::Create { path }) => format!("created {path}"),
            (None, GroupCommand::Rename { from, to }) => format!("renamed {from} to {to}"),
            (None, GroupCommand::Move { path, .. }) => match &outcome.path {
                Some(moved) => format!("moved {path} to {moved}"),
                None => format!("moved {path}"),
            },
        };
        writeln!(&mut out, "{line}").expect("writing to String cannot fail");
    }
    out
}

pub fn render_commit_json(report: &CommitReport) -> JsonValue {
    let mut out = JsonMap::new();
    out.insert(
        "target".to_string(),
        JsonValue::String(report.target.display().to_string()),
    );
    out.insert(
        "backup".to_string(),
        match &report.backup {
            Some(backup) => JsonValue::String(backup.display().to_string()),
            None => JsonValue::Null,
        },
    );
    out.insert(
        "changes_applied".to_string(),
        JsonValue::from(report.changes_applied),
    );
    out.insert(
        "bytes_written".to_string(),
        JsonValue::from(report.bytes_written),
    );
    JsonValue::Object(out)
}

pub fn render_commit_text(report: &CommitReport) -> String {
    let mut out = String::new();
    match &report.backup {
        None => writeln!(&mut out, "No changes; {} left as is", report.target.display())
            .expect("writing to String cannot fail"),
        Some(backup) => {
            writeln!(
                &mut out,
                "Wrote {} change{} to {}",
                report.changes_applied,
                plural(report.changes_applied),
                report.target.display()
            )
            .expect("writing to String cannot fail");
            writeln!(&mut out, "Backup: {}", backup.display())
                .expect("writing to String cannot fail");
        }
    }
    out
}

fn summary_json(session: &Session) -> JsonMap<String, JsonValue> {
    let summary = session.summary();
    let mut out = JsonMap::new();
    out.insert(
        "dialect".to_string(),
        JsonValue::String(summary.dialect.to_string()),
    );
    out.insert("profile".to_string(), JsonValue::String(summary.profile));
    out.insert(
        "profiles".to_string(),
        JsonValue::Array(summary.profiles.into_iter().map(JsonValue::String).collect()),
    );
    out.insert("group_count".to_string(), JsonValue::from(summary.group_count));
    out.insert("item_count".to_string(), JsonValue::from(summary.item_count));
    out.insert("modified".to_string(), JsonValue::Bool(summary.modified));
    out
}

fn group_json(group: &GroupSummary) -> JsonMap<String, JsonValue> {
    let mut out = JsonMap::new();
    out.insert(
        "path".to_string(),
        JsonValue::String(group.path.as_str().to_string()),
    );
    out.insert("name".to_string(), JsonValue::String(group.name.clone()));
    out.insert("depth".to_string(), JsonValue::from(group.depth));
    out.insert("item_count".to_string(), JsonValue::from(group.item_count));
    out.insert(
        "foreign_count".to_string(),
        JsonValue::from(group.foreign_count),
    );
    out
}

fn stats_json(stats: &GroupMergeStats) -> JsonValue {
    let mut out = JsonMap::new();
    out.insert("added".to_string(), JsonValue::from(stats.added));
    out.insert(
        "already_present".to_string(),
        JsonValue::from(stats.already_present),
    );
    out.insert("removed".to_string(), JsonValue::from(stats.removed));
    out.insert("not_found".to_string(), JsonValue::from(stats.not_found));
    JsonValue::Object(out)
}

fn conflict_json(conflict: &MergeConflict) -> JsonValue {
    let mut out = JsonMap::new();
    match conflict {
        MergeConflict::Contradictory { item, group } => {
            out.insert(
                "kind".to_string(),
                JsonValue::String("contradictory".to_string()),
            );
            out.insert("item".to_string(), JsonValue::from(item.get()));
            out.insert(
                "group".to_string(),
                JsonValue::String(group.as_str().to_string()),
            );
        }
        MergeConflict::CrossGroup {
            item,
            added_to,
            removed_from,
        } => {
            out.insert(
                "kind".to_string(),
                JsonValue::String("cross_group".to_string()),
            );
            out.insert("item".to_string(), JsonValue::from(item.get()));
            out.insert("added_to".to_string(), paths_json(added_to));
            out.insert("removed_from".to_string(), paths_json(removed_from));
        }
    }
    JsonValue::Object(out)
}

fn describe_conflict(conflict: &MergeConflict) -> String {
    match conflict {
        MergeConflict::Contradictory { item, group } => {
            format!("{item} both added to and removed from {group}; left unchanged")
        }
        MergeConflict::CrossGroup {
            item,
            added_to,
            removed_from,
        } => format!(
            "{item} added to {} and removed from {}",
            join_paths(added_to),
            join_paths(removed_from)
        ),
    }
}

fn write_stats_row(out: &mut String, label: &str, stats: &GroupMergeStats) {
    writeln!(
        out,
        "{label:<GROUP_COL_WIDTH$} {:>STATS_COL_WIDTH$} {:>STATS_COL_WIDTH$} {:>STATS_COL_WIDTH$} {:>STATS_COL_WIDTH$}",
        stats.added, stats.already_present, stats.removed, stats.not_found
    )
    .expect("writing to String cannot fail");
}

fn command_name(command: &GroupCommand) -> &'static str {
    match command {
        GroupCommand::Create { .. } => "create",
        GroupCommand::Rename { .. } => "rename",
        GroupCommand::Move { .. } => "move",
        GroupCommand::Delete { .. } => "delete",
    }
}

fn describe_command(command: &GroupCommand) -> String {
    match command {
        GroupCommand::Create { path } => format!("create {path}"),
        GroupCommand::Rename { from, to } => format!("rename {from} to {to}"),
        GroupCommand::Move { path, new_parent } => format!("move {path} under {new_parent}"),
        GroupCommand::Delete { path, .. } => format!("delete {path}"),
    }
}

fn item_ids_json(items: &[ItemId]) -> JsonValue {
    JsonValue::Array(items.iter().map(|id| JsonValue::from(id.get())).collect())
}

fn paths_json(paths: &[GroupPath]) -> JsonValue {
    JsonValue::Array(
        paths
            .iter()
            .map(|p| JsonValue::String(p.as_str().to_string()))
            .collect(),
    )
}

fn join_ids(items: &[ItemId]) -> String {
    items
        .iter()
        .map(ItemId::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_paths(paths: &[GroupPath]) -> String {
    paths
        .iter()
        .map(GroupPath::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "" } else { "s" }
}

fn fit_column(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    if width <= 3 {
        return value.chars().take(width).collect();
    }

    let mut out = String::with_capacity(width);
    for ch in value.chars().take(width - 3) {
        out.push(ch);
    }
    out.push_str("...");
    out
}

mod config;

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tsm_core::core_api::{
    BindType, CoreError, Engine, EngineOptions, GroupCommand, GroupPath,
    ImportOptions, ItemId, ItemRecord, MergeInstruction, Session,
};
use tsm_render::{
    JsonStyle, TextRenderOptions, TextStyle, render_commit_json, render_commit_text,
    render_group_outcomes_json, render_group_outcomes_text, render_groups_json,
    render_groups_text_with_options, render_import_plan_json, render_import_plan_text,
    render_items_json, render_items_text, render_merge_json, render_merge_text,
    render_summary_json, render_summary_text,
};

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// TradeSkillMaster.lua SavedVariables file.
    #[arg(
        short,
        long,
        value_name = "TradeSkillMaster.lua",
        env = "TSM_SAVED_VARIABLES",
        global = true
    )]
    file: Option<PathBuf>,
    #[arg(long, global = true)]
    profile: Option<String>,
    #[arg(long, global = true)]
    json: bool,
    /// Show what would change without writing the file.
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    #[arg(long = "backup-dir", value_name = "DIR", global = true)]
    backup_dir: Option<PathBuf>,
    #[arg(long, value_name = "CONFIG.json", global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Dialect, profile and totals.
    Summary,
    /// List the group tree of the selected profile.
    Groups {
        /// Full paths instead of an indented tree.
        #[arg(long)]
        flat: bool,
        /// List item ids under each group.
        #[arg(long)]
        items: bool,
    },
    /// List the items of one group.
    Items {
        #[arg(value_parser = parse_group_path)]
        group: GroupPath,
    },
    /// Add items to a group, creating it if needed.
    Add {
        #[arg(value_parser = parse_group_path)]
        group: GroupPath,
        #[arg(required = true)]
        items: Vec<ItemId>,
    },
    /// Remove items from a group.
    Remove {
        #[arg(value_parser = parse_group_path)]
        group: GroupPath,
        #[arg(required = true)]
        items: Vec<ItemId>,
    },
    /// Remove items from every group that holds them.
    RemoveEverywhere {
        #[arg(required = true)]
        items: Vec<ItemId>,
    },
    /// Add fetched item records from a JSON file.
    Import {
        #[arg(value_name = "RECORDS.json")]
        records: PathBuf,
        /// Put every record into this group instead of its category group.
        #[arg(long, value_parser = parse_group_path)]
        target: Option<GroupPath>,
        /// Parent group for category groups.
        #[arg(long, value_parser = parse_group_path, conflicts_with = "target")]
        prefix: Option<GroupPath>,
        /// Keep only records with this raw bind code (repeatable).
        #[arg(long = "bind", value_name = "CODE")]
        bind: Vec<i32>,
        /// Skip items already present in any group.
        #[arg(long = "skip-existing")]
        skip_existing: bool,
    },
    CreateGroup {
        #[arg(value_parser = parse_group_path)]
        path: GroupPath,
    },
    RenameGroup {
        #[arg(value_parser = parse_group_path)]
        from: GroupPath,
        #[arg(value_parser = parse_group_path)]
        to: GroupPath,
    },
    /// Move a group under a new parent; top level when --to is omitted.
    MoveGroup {
        #[arg(value_parser = parse_group_path)]
        path: GroupPath,
        #[arg(long, value_parser = parse_group_path)]
        to: Option<GroupPath>,
    },
    DeleteGroup {
        #[arg(value_parser = parse_group_path)]
        path: GroupPath,
        /// Move the group's items to its parent instead of dropping them.
        #[arg(long = "keep-items")]
        keep_items: bool,
    },
}

impl Command {
    fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Self::Summary | Self::Groups { .. } | Self::Items { .. }
        )
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::load(path).unwrap_or_else(|e| {
            eprintln!("Error loading config: {e}");
            process::exit(2);
        }),
        None => Config::default(),
    };

    let Some(target) = cli.file.clone().or(config.tsm_path.clone()) else {
        eprintln!(
            "No SavedVariables file given; pass --file, set TSM_SAVED_VARIABLES or tsm_path in --config"
        );
        process::exit(2);
    };
    if cli.dry_run && !cli.command.is_mutation() {
        debug!("--dry-run has no effect on read-only commands");
    }

    let options = EngineOptions {
        profile: cli.profile.clone().or(config.profile),
        backup_dir: cli.backup_dir.clone().or(config.backup_dir),
    };
    let mut session = Engine::with_options(options)
        .open_path(&target)
        .unwrap_or_else(|e| fail(&format!("Error loading {}", target.display()), e));

    match &cli.command {
        Command::Summary => {
            if cli.json {
                print_json(&render_summary_json(&session, JsonStyle::CanonicalV1));
            } else {
                print!("{}", render_summary_text(&session));
            }
        }
        Command::Groups { flat, items } => {
            if cli.json {
                print_json(&render_groups_json(&session, JsonStyle::CanonicalV1));
            } else {
                let style = if *flat { TextStyle::Flat } else { TextStyle::Tree };
                let options = TextRenderOptions { verbose: *items };
                print!(
                    "{}",
                    render_groups_text_with_options(&session, style, options)
                );
            }
        }
        Command::Items { group } => {
            let items = session
                .items_in(group)
                .unwrap_or_else(|e| fail("Error listing items", e));
            if cli.json {
                print_json(&render_items_json(group, &items));
            } else {
                print!("{}", render_items_text(group, &items));
            }
        }
        Command::Add { group, items } => {
            let batch: Vec<_> = items
                .iter()
                .map(|&item| MergeInstruction::add(item, group.clone()))
                .collect();
            let result = session.merge(&batch);
            finish(
                &cli,
                &mut session,
                render_merge_json(&result),
                render_merge_text(&result),
                result.rejected.len(),
            );
        }
        Command::Remove { group, items } => {
            let batch: Vec<_> = items
                .iter()
                .map(|&item| MergeInstruction::remove(item, group.clone()))
                .collect();
            let result = session.merge(&batch);
            finish(
                &cli,
                &mut session,
                render_merge_json(&result),
                render_merge_text(&result),
                result.rejected.len(),
            );
        }
        Command::RemoveEverywhere { items } => {
            let batch = session.plan_remove_everywhere(items);
            let result = session.merge(&batch);
            finish(
                &cli,
                &mut session,
                render_merge_json(&result),
                render_merge_text(&result),
                result.rejected.len(),
            );
        }
        Command::Import {
            records,
            target,
            prefix,
            bind,
            skip_existing,
        } => {
            let records = read_records(records);
            let options = ImportOptions {
                target: target.clone(),
                category_prefix: prefix.clone(),
                bind: bind.iter().copied().map(BindType::from_raw).collect(),
                skip_existing: *skip_existing,
            };
            let plan = session.plan_import(&records, &options);
            let result = session.merge(&plan.batch);

            let mut json = JsonMap::new();
            json.insert("import".to_string(), render_import_plan_json(&plan));
            json.insert("merge".to_string(), render_merge_json(&result));
            let text = format!(
                "{}{}",
                render_import_plan_text(&plan),
                render_merge_text(&result)
            );
            finish(
                &cli,
                &mut session,
                JsonValue::Object(json),
                text,
                result.rejected.len(),
            );
        }
        Command::CreateGroup { path } => {
            run_group_command(&cli, &mut session, GroupCommand::Create { path: path.clone() });
        }
        Command::RenameGroup { from, to } => {
            run_group_command(
                &cli,
                &mut session,
                GroupCommand::Rename {
                    from: from.clone(),
                    to: to.clone(),
                },
            );
        }
        Command::MoveGroup { path, to } => {
            run_group_command(
                &cli,
                &mut session,
                GroupCommand::Move {
                    path: path.clone(),
                    new_parent: to.clone().unwrap_or_else(GroupPath::root),
                },
            );
        }
        Command::DeleteGroup { path, keep_items } => {
            run_group_command(
                &cli,
                &mut session,
                GroupCommand::Delete {
                    path: path.clone(),
                    keep_items: *keep_items,
                },
            );
        }
    }
}

fn init_logging(verbose: u8) {
    let default_directive = match verbose {
        0 => "tsm_core=info",
        1 => "tsm_core=debug,tsm_reconcile=debug",
        _ => "tsm_core=trace,tsm_reconcile=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_group_command(cli: &Cli, session: &mut Session, command: GroupCommand) {
    let outcomes = session.apply_group_commands(&[command]);
    let failed = outcomes.iter().any(|o| !o.applied);
    if failed {
        if cli.json {
            print_json(&render_group_outcomes_json(&outcomes));
        } else {
            eprint!("{}", render_group_outcomes_text(&outcomes));
        }
        process::exit(1);
    }
    finish(
        cli,
        session,
        render_group_outcomes_json(&outcomes),
        render_group_outcomes_text(&outcomes),
        0,
    );
}

/// Prints the operation report, then commits unless this is a dry run.
///
/// Accepted instructions are still written when some were rejected, but the
/// process then exits with status 1.
fn finish(
    cli: &Cli,
    session: &mut Session,
    report_json: JsonValue,
    report_text: String,
    rejected: usize,
) {
    let commit = if cli.dry_run {
        // Renders and verifies the would-be document without touching disk.
        let text = session
            .to_text_modified()
            .unwrap_or_else(|e| fail("Error verifying changes", e));
        info!(bytes = text.len(), "dry run, nothing written");
        None
    } else {
        Some(
            session
                .commit()
                .unwrap_or_else(|e| fail("Error writing SavedVariables", e)),
        )
    };

    if cli.json {
        let mut out = JsonMap::new();
        out.insert("result".to_string(), report_json);
        out.insert("dry_run".to_string(), JsonValue::Bool(cli.dry_run));
        out.insert(
            "commit".to_string(),
            commit
                .as_ref()
                .map(render_commit_json)
                .unwrap_or(JsonValue::Null),
        );
        print_json(&JsonValue::Object(out));
    } else {
        print!("{report_text}");
        match &commit {
            Some(report) => print!("{}", render_commit_text(report)),
            None => println!("Dry run: nothing written"),
        }
    }

    if rejected > 0 {
        eprintln!("{rejected} instruction(s) rejected");
        process::exit(1);
    }
}

fn read_records(path: &Path) -> Vec<ItemRecord> {
    let text = fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Error reading {}: {e}", path.display());
        process::exit(1);
    });
    serde_json::from_str(&text).unwrap_or_else(|e| {
        eprintln!("Error parsing item records in {}: {e}", path.display());
        process::exit(1);
    })
}

fn print_json(value: &JsonValue) {
    let rendered = serde_json::to_string_pretty(value).unwrap_or_else(|e| {
        eprintln!("Error rendering JSON output: {e}");
        process::exit(1);
    });
    println!("{rendered}");
}

fn fail(context: &str, err: CoreError) -> ! {
    eprintln!("{context}");
    eprintln!("  {err}");
    process::exit(1);
}

fn parse_group_path(value: &str) -> Result<GroupPath, String> {
    GroupPath::parse(value).map_err(|e| e.to_string())
}

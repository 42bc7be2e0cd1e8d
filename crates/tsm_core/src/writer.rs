//! Backup-then-replace commit of a change set to the target file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::layout::{ChangeSet, ChangeSetError};

const BACKUP_EXTENSION: &str = "bak";
const BACKUP_STAMP_FORMAT: &str = "%Y%m%d-%H%M%S%.3f";
const MAX_BACKUP_ATTEMPTS: usize = 1000;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("target file {} does not exist", .0.display())]
    TargetMissing(PathBuf),
    #[error("target file {} is read-only", .0.display())]
    ReadOnly(PathBuf),
    #[error("{} changed on disk since it was loaded; reload before committing", .0.display())]
    Stale(PathBuf),
    #[error("could not {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    InvalidChanges(#[from] ChangeSetError),
}

impl WriteError {
    fn io<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> Self + 'a {
        move |source| Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    /// Where backups go; next to the target when unset.
    pub backup_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReport {
    pub target: PathBuf,
    pub backup: Option<PathBuf>,
    pub bytes_written: usize,
    pub changes_applied: usize,
}

/// Applies `changes` to `original` and replaces `target` with the result.
///
/// The target must still hold exactly `original`. A backup of it is created
/// before anything destructive happens, the new text goes to a temporary file
/// in the target's directory, and only a fully written temporary file is
/// renamed over the target. On every error path the target is untouched.
pub fn commit(
    original: &str,
    changes: &ChangeSet,
    target: &Path,
    options: &WriteOptions,
) -> Result<CommitReport, WriteError> {
    changes.validate(original)?;

    let metadata = match fs::metadata(target) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(WriteError::TargetMissing(target.to_path_buf()));
        }
        Err(err) => return Err(WriteError::io("inspect", target)(err)),
    };

    let on_disk = fs::read(target).map_err(WriteError::io("read", target))?;
    if on_disk != original.as_bytes() {
        return Err(WriteError::Stale(target.to_path_buf()));
    }

    if changes.is_empty() {
        debug!(target = %target.display(), "nothing to commit");
        return Ok(CommitReport {
            target: target.to_path_buf(),
            backup: None,
            bytes_written: 0,
            changes_applied: 0,
        });
    }

    if metadata.permissions().readonly() {
        return Err(WriteError::ReadOnly(target.to_path_buf()));
    }

    let updated = changes.apply(original)?;

    let backup_dir = match &options.backup_dir {
        Some(dir) => dir.clone(),
        None => parent_dir(target).to_path_buf(),
    };
    let backup = write_backup(&on_disk, target, &backup_dir)?;
    info!(backup = %backup.display(), "backed up saved variables");

    replace_atomically(target, updated.as_bytes(), metadata.permissions())?;
    info!(
        target = %target.display(),
        changes = changes.len(),
        bytes = updated.len(),
        "committed saved variables"
    );

    Ok(CommitReport {
        target: target.to_path_buf(),
        backup: Some(backup),
        bytes_written: updated.len(),
        changes_applied: changes.len(),
    })
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// `<file name>.<stamp>.bak`, or `<file name>.<stamp>-<n>.bak` on collision.
pub fn backup_file_name(target: &Path, stamp: &str, attempt: usize) -> String {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "SavedVariables".to_string());
    if attempt == 0 {
        format!("{name}.{stamp}.{BACKUP_EXTENSION}")
    } else {
        format!("{name}.{stamp}-{attempt}.{BACKUP_EXTENSION}")
    }
}

fn write_backup(contents: &[u8], target: &Path, dir: &Path) -> Result<PathBuf, WriteError> {
    fs::create_dir_all(dir).map_err(WriteError::io("create backup directory", dir))?;
    let stamp = Local::now().format(BACKUP_STAMP_FORMAT).to_string();

    let (path, mut file) = acquire_backup_slot(target, dir, &stamp)?;
    let written = file
        .write_all(contents)
        .and_then(|()| file.sync_all());
    if let Err(err) = written {
        drop(file);
        let _ = fs::remove_file(&path);
        return Err(WriteError::io("write backup", &path)(err));
    }
    Ok(path)
}

fn acquire_backup_slot(
    target: &Path,
    dir: &Path,
    stamp: &str,
) -> Result<(PathBuf, File), WriteError> {
    for attempt in 0..MAX_BACKUP_ATTEMPTS {
        let path = dir.join(backup_file_name(target, stamp, attempt));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(WriteError::io("create backup", &path)(err)),
        }
    }
    Err(WriteError::Io {
        action: "find a free backup name in",
        path: dir.to_path_buf(),
        source: io::Error::from(io::ErrorKind::AlreadyExists),
    })
}

fn replace_atomically(
    target: &Path,
    data: &[u8],
    permissions: fs::Permissions,
) -> Result<(), WriteError> {
    let dir = parent_dir(target);
    let mut tmp = NamedTempFile::new_in(dir).map_err(WriteError::io("create temporary file in", dir))?;
    tmp.write_all(data)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(WriteError::io("write temporary file", tmp.path()))?;
    fs::set_permissions(tmp.path(), permissions)
        .map_err(WriteError::io("set permissions on", tmp.path()))?;

    tmp.persist(target)
        .map_err(|err| WriteError::io("replace", target)(err.error))?;

    #[cfg(unix)]
    {
        if let Ok(parent) = File::open(dir) {
            let _ = parent.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{ByteRange, ChangeSpan};

    fn backups_in(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .expect("read dir")
            .map(|e| e.expect("entry").path())
            .filter(|p| p.extension().is_some_and(|e| e == BACKUP_EXTENSION))
            .collect()
    }

    #[test]
    fn backup_names_carry_stamp_and_counter() {
        let target = Path::new("/wtf/TradeSkillMaster.lua");
        assert_eq!(
            backup_file_name(target, "20240101-120000.000", 0),
            "TradeSkillMaster.lua.20240101-120000.000.bak"
        );
        assert_eq!(
            backup_file_name(target, "20240101-120000.000", 2),
            "TradeSkillMaster.lua.20240101-120000.000-2.bak"
        );
    }

    #[test]
    fn commit_backs_up_then_replaces() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("TradeSkillMaster.lua");
        fs::write(&target, "X = {\n}\n").expect("seed");

        let changes = ChangeSet::new(vec![ChangeSpan::insert(6, "\t[\"a\"] = 1,\n")]);
        let report = commit("X = {\n}\n", &changes, &target, &WriteOptions::default())
            .expect("commit");

        assert_eq!(
            fs::read_to_string(&target).expect("read"),
            "X = {\n\t[\"a\"] = 1,\n}\n"
        );
        let backup = report.backup.expect("backup path");
        assert_eq!(fs::read_to_string(&backup).expect("backup"), "X = {\n}\n");
        assert_eq!(backups_in(dir.path()), vec![backup]);
    }

    #[test]
    fn refuses_stale_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("TradeSkillMaster.lua");
        fs::write(&target, "X = {\n\t[\"game\"] = 1,\n}\n").expect("seed");

        let changes = ChangeSet::new(vec![ChangeSpan::delete(ByteRange::new(0, 1))]);
        let err = commit("X = {\n}\n", &changes, &target, &WriteOptions::default())
            .expect_err("stale");
        assert!(matches!(err, WriteError::Stale(_)));
        assert!(backups_in(dir.path()).is_empty());
        assert_eq!(
            fs::read_to_string(&target).expect("read"),
            "X = {\n\t[\"game\"] = 1,\n}\n"
        );
    }

    #[test]
    fn missing_target_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("absent.lua");
        let changes = ChangeSet::new(vec![ChangeSpan::insert(0, "x")]);
        let err = commit("", &changes, &target, &WriteOptions::default()).expect_err("missing");
        assert!(matches!(err, WriteError::TargetMissing(_)));
    }

    #[test]
    fn backups_go_to_configured_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("TradeSkillMaster.lua");
        let backup_dir = dir.path().join("backups");
        fs::write(&target, "X = 1\n").expect("seed");

        let changes = ChangeSet::new(vec![ChangeSpan::replace(ByteRange::new(4, 5), "2")]);
        let options = WriteOptions {
            backup_dir: Some(backup_dir.clone()),
        };
        commit("X = 1\n", &changes, &target, &options).expect("first");
        let second = ChangeSet::new(vec![ChangeSpan::replace(ByteRange::new(4, 5), "3")]);
        commit("X = 2\n", &second, &target, &options).expect("second");

        assert_eq!(backups_in(&backup_dir).len(), 2);
        assert_eq!(fs::read_to_string(&target).expect("read"), "X = 3\n");
    }
}

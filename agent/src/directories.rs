// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Crash-safe operations on a single data or tablespace directory
//!
//! There is no transactional filesystem underneath the upgrade, so each
//! operation here is written to be re-invoked with the same arguments after
//! a crash at any point, and to report success once the end state has been
//! reached. None of them retry internally.

use crate::fs::{FileSystem, FileType};
use camino::{Utf8Path, Utf8PathBuf};
use slog::{info, Logger};
use std::fmt;
use std::io;
use std::io::Write;
use upgrade_common::{ErrorList, DATA_DIRECTORY_MARKERS, OLD_SUFFIX, PG_VERSION};

pub use upgrade_common::{tablespace_path, TABLESPACE_DIR_PREFIX};

/// The filesystem operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Stat,
    ReadDir,
    RemoveDirectory,
    RemoveTablespace,
    ReadParent,
    RemoveParent,
    WriteProgress,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IoOp::Stat => "stat",
            IoOp::ReadDir => "read directory",
            IoOp::RemoveDirectory => "remove directory",
            IoOp::RemoveTablespace => "remove tablespace directory",
            IoOp::ReadParent => "read parent directory of",
            IoOp::RemoveParent => "remove parent directory of",
            IoOp::WriteProgress => "report progress for",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("{path} is not a valid data directory")]
    InvalidDataDirectory { path: Utf8PathBuf },

    #[error("{path} is not a valid tablespace directory")]
    InvalidTablespaceDirectory { path: Utf8PathBuf },

    #[error("required path {path} does not exist")]
    MissingRequiredPath { path: Utf8PathBuf },

    #[error("failed to {op} {path}")]
    Io {
        op: IoOp,
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },

    #[error("failed to rename {from} to {to}")]
    Rename {
        from: Utf8PathBuf,
        to: Utf8PathBuf,
        #[source]
        err: io::Error,
    },

    #[error("failed to determine hostname")]
    Hostname(#[source] io::Error),

    #[error("{0}")]
    Multiple(ErrorList<DirectoryError>),
}

impl DirectoryError {
    fn io(op: IoOp, path: &Utf8Path, err: io::Error) -> Self {
        DirectoryError::Io { op, path: path.to_owned(), err }
    }

    /// Returns true if this error, or any error it aggregates, was caused by
    /// an I/O error of `kind`. A missing required path counts as
    /// `NotFound`.
    pub fn has_io_kind(&self, kind: io::ErrorKind) -> bool {
        match self {
            DirectoryError::Io { err, .. }
            | DirectoryError::Rename { err, .. }
            | DirectoryError::Hostname(err) => err.kind() == kind,
            DirectoryError::MissingRequiredPath { .. } => {
                kind == io::ErrorKind::NotFound
            }
            DirectoryError::Multiple(errors) => {
                errors.any(|e| e.has_io_kind(kind))
            }
            DirectoryError::InvalidDataDirectory { .. }
            | DirectoryError::InvalidTablespaceDirectory { .. } => false,
        }
    }

    /// Returns true if the request itself was at fault rather than the host:
    /// the directories named are not what the caller claimed them to be.
    pub fn is_validation(&self) -> bool {
        match self {
            DirectoryError::InvalidDataDirectory { .. }
            | DirectoryError::InvalidTablespaceDirectory { .. }
            | DirectoryError::MissingRequiredPath { .. } => true,
            DirectoryError::Multiple(errors) => errors.all(|e| e.is_validation()),
            DirectoryError::Io { .. }
            | DirectoryError::Rename { .. }
            | DirectoryError::Hostname(_) => false,
        }
    }

    /// The individual errors, with nested aggregates flattened.
    pub fn leaves(&self) -> Vec<&DirectoryError> {
        match self {
            DirectoryError::Multiple(errors) => {
                errors.iter().flat_map(|e| e.error().leaves()).collect()
            }
            other => vec![other],
        }
    }
}

fn into_result(errors: ErrorList<DirectoryError>) -> Result<(), DirectoryError> {
    errors.into_result().map_err(DirectoryError::Multiple)
}

/// Returns the path a directory is moved to when it is retired.
pub fn archive_path(dir: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{}{OLD_SUFFIX}", dir.as_str().trim_end_matches('/')))
}

/// Reports whether `path` exists. Failures other than "not found" are
/// returned rather than being treated as absence.
pub fn path_exists(
    fs: &dyn FileSystem,
    path: &Utf8Path,
) -> Result<bool, DirectoryError> {
    match fs.stat(path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(DirectoryError::io(IoOp::Stat, path, err)),
    }
}

fn is_data_directory(fs: &dyn FileSystem, dir: &Utf8Path) -> bool {
    DATA_DIRECTORY_MARKERS
        .iter()
        .all(|marker| matches!(path_exists(fs, &dir.join(marker)), Ok(true)))
}

/// Checks that every directory in `dirs` holds the data directory marker
/// files, reporting every directory that does not.
pub fn verify_data_directories(
    fs: &dyn FileSystem,
    dirs: &[&Utf8Path],
) -> Result<(), DirectoryError> {
    let mut errors = ErrorList::new();
    for dir in dirs {
        if !is_data_directory(fs, dir) {
            errors.push(
                dir.as_str(),
                DirectoryError::InvalidDataDirectory { path: dir.to_path_buf() },
            );
        }
    }
    into_result(errors)
}

fn rename(
    fs: &dyn FileSystem,
    from: &Utf8Path,
    to: &Utf8Path,
) -> Result<(), DirectoryError> {
    fs.rename(from, to).map_err(|err| DirectoryError::Rename {
        from: from.to_owned(),
        to: to.to_owned(),
        err,
    })
}

/// Retires `target` to `target.old` and, if `rename_target` is set, moves
/// `source` into the place `target` occupied.
///
/// Both directories must look like data directories. Nothing is touched if
/// either does not.
///
/// If the archive path already exists the archive step is assumed to have
/// completed on an earlier attempt, and neither directory is validated
/// again. The contents of the archive are not inspected: an unrelated
/// directory occupying `target.old` is indistinguishable from a completed
/// archive step, and operators must not leave directories there.
pub fn archive_and_swap(
    log: &Logger,
    fs: &dyn FileSystem,
    source: &Utf8Path,
    target: &Utf8Path,
    rename_target: bool,
) -> Result<(), DirectoryError> {
    let archive = archive_path(target);

    if path_exists(fs, &archive)? {
        info!(
            log,
            "archive directory already exists, skipping archive";
            "archive" => %archive,
        );
    } else {
        verify_data_directories(fs, &[source, target])?;
        info!(log, "archiving directory"; "from" => %target, "to" => %archive);
        rename(fs, target, &archive)?;
    }

    if !rename_target {
        return Ok(());
    }

    if !path_exists(fs, source)? {
        info!(
            log,
            "Source directory not found, assuming it was already renamed";
            "source" => %source,
            "target" => %target,
        );
        return Ok(());
    }

    info!(log, "renaming directory"; "from" => %source, "to" => %target);
    rename(fs, source, target)
}

/// Deletes every directory in `dirs` that contains all of `required_files`,
/// writing a line per deletion to `progress`.
///
/// Directories that no longer exist are treated as already deleted. Every
/// directory is attempted; failures are aggregated and labeled with the
/// directory.
pub fn delete_directories(
    log: &Logger,
    fs: &dyn FileSystem,
    dirs: &[&Utf8Path],
    required_files: &[&str],
    progress: &mut dyn Write,
) -> Result<(), DirectoryError> {
    let hostname = fs.hostname().map_err(DirectoryError::Hostname)?;

    let mut errors = ErrorList::new();
    for dir in dirs {
        match path_exists(fs, dir) {
            Ok(true) => {}
            Ok(false) => {
                info!(log, "directory already deleted"; "dir" => %dir);
                continue;
            }
            Err(err) => {
                errors.push(dir.as_str(), err);
                continue;
            }
        }

        let mut missing = false;
        for file in required_files {
            let path = dir.join(file);
            match path_exists(fs, &path) {
                Ok(true) => {}
                Ok(false) => {
                    missing = true;
                    errors.push(
                        dir.as_str(),
                        DirectoryError::MissingRequiredPath { path },
                    );
                }
                Err(err) => {
                    missing = true;
                    errors.push(dir.as_str(), err);
                }
            }
        }
        if missing {
            continue;
        }

        if let Err(err) = writeln!(
            progress,
            "Deleting directory: \"{dir}\" on host \"{hostname}\""
        ) {
            errors.push(
                dir.as_str(),
                DirectoryError::io(IoOp::WriteProgress, dir, err),
            );
            continue;
        }

        info!(log, "deleting directory"; "dir" => %dir, "host" => &hostname);
        match fs.remove_dir_all(dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => errors.push(
                dir.as_str(),
                DirectoryError::io(IoOp::RemoveDirectory, dir, err),
            ),
        }
    }

    into_result(errors)
}

fn is_target_tablespace_dir(dir: &Utf8Path) -> bool {
    dir.file_name()
        .map(|name| name.starts_with(TABLESPACE_DIR_PREFIX))
        .unwrap_or(false)
}

/// Deletes target tablespace directories (`<location>/<dbid>/GPDB_*`),
/// along with their `<dbid>` parent once that is empty.
///
/// Every directory is checked to be a target tablespace directory before
/// anything is deleted. Failures to remove the directory, to read its
/// parent, and to remove its parent are reported as distinct operations.
pub fn delete_tablespace_directories(
    log: &Logger,
    fs: &dyn FileSystem,
    progress: &mut dyn Write,
    dirs: &[&Utf8Path],
) -> Result<(), DirectoryError> {
    let mut invalid = ErrorList::new();
    for dir in dirs {
        if !is_target_tablespace_dir(dir) {
            invalid.push(
                dir.as_str(),
                DirectoryError::InvalidTablespaceDirectory {
                    path: dir.to_path_buf(),
                },
            );
        }
    }
    into_result(invalid)?;

    let hostname = fs.hostname().map_err(DirectoryError::Hostname)?;

    let mut errors = ErrorList::new();
    for dir in dirs {
        if let Err(err) = writeln!(
            progress,
            "Deleting directory: \"{dir}\" on host \"{hostname}\""
        ) {
            errors.push(
                dir.as_str(),
                DirectoryError::io(IoOp::WriteProgress, dir, err),
            );
            continue;
        }

        match fs.remove_dir_all(dir) {
            Ok(()) => {
                info!(log, "deleted tablespace directory"; "dir" => %dir);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                errors.push(
                    dir.as_str(),
                    DirectoryError::io(IoOp::RemoveTablespace, dir, err),
                );
                continue;
            }
        }

        let Some(dbid_dir) = dir.parent() else {
            continue;
        };
        let entries = match fs.read_dir(dbid_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                errors.push(
                    dir.as_str(),
                    DirectoryError::io(IoOp::ReadParent, dir, err),
                );
                continue;
            }
        };
        if !entries.is_empty() {
            continue;
        }

        match fs.remove_dir(dbid_dir) {
            Ok(()) => {
                info!(log, "deleted empty dbid directory"; "dir" => %dbid_dir);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => errors.push(
                dir.as_str(),
                DirectoryError::io(IoOp::RemoveParent, dir, err),
            ),
        }
    }

    into_result(errors)
}

/// Returns the database directories (numeric names) directly under a legacy
/// tablespace location.
fn database_dirs(
    fs: &dyn FileSystem,
    location: &Utf8Path,
) -> Result<Vec<Utf8PathBuf>, DirectoryError> {
    let entries = fs
        .read_dir(location)
        .map_err(|err| DirectoryError::io(IoOp::ReadDir, location, err))?;
    Ok(entries
        .into_iter()
        .filter(|e| e.file_type == FileType::Dir)
        .filter(|e| e.name.parse::<u32>().is_ok())
        .map(|e| location.join(e.name))
        .collect())
}

/// Checks that each legacy tablespace location holds only well-formed
/// database directories: every numerically-named child directory must
/// contain a version marker. Other entries are ignored.
pub fn verify_5x_tablespace_directories(
    fs: &dyn FileSystem,
    dirs: &[&Utf8Path],
) -> Result<(), DirectoryError> {
    let mut errors = ErrorList::new();
    for location in dirs {
        let dbdirs = match database_dirs(fs, location) {
            Ok(dbdirs) => dbdirs,
            Err(err) => {
                errors.push(location.as_str(), err);
                continue;
            }
        };

        let mut valid = true;
        for dbdir in &dbdirs {
            match path_exists(fs, &dbdir.join(PG_VERSION)) {
                Ok(true) => {}
                Ok(false) => valid = false,
                Err(err) => {
                    valid = false;
                    errors.push(location.as_str(), err);
                }
            }
        }
        if !valid {
            errors.push(
                location.as_str(),
                DirectoryError::InvalidTablespaceDirectory {
                    path: location.to_path_buf(),
                },
            );
        }
    }
    into_result(errors)
}

/// Deletes the database directories of legacy tablespace locations. The
/// locations themselves are left in place.
pub fn delete_source_tablespace_directories(
    log: &Logger,
    fs: &dyn FileSystem,
    progress: &mut dyn Write,
    dirs: &[&Utf8Path],
) -> Result<(), DirectoryError> {
    verify_5x_tablespace_directories(fs, dirs)?;

    let hostname = fs.hostname().map_err(DirectoryError::Hostname)?;

    let mut errors = ErrorList::new();
    for location in dirs {
        let dbdirs = match database_dirs(fs, location) {
            Ok(dbdirs) => dbdirs,
            Err(err) => {
                errors.push(location.as_str(), err);
                continue;
            }
        };

        for dbdir in dbdirs {
            if let Err(err) = writeln!(
                progress,
                "Deleting directory: \"{dbdir}\" on host \"{hostname}\""
            ) {
                errors.push(
                    location.as_str(),
                    DirectoryError::io(IoOp::WriteProgress, &dbdir, err),
                );
                continue;
            }
            match fs.remove_dir_all(&dbdir) {
                Ok(()) => {
                    info!(log, "deleted source tablespace"; "dir" => %dbdir);
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => errors.push(
                    location.as_str(),
                    DirectoryError::io(IoOp::RemoveTablespace, &dbdir, err),
                ),
            }
        }
    }
    into_result(errors)
}

/// Puts back the control file that a link-mode upgrade retires to
/// `global/pg_control.old`, which makes the source cluster startable again.
///
/// Succeeds without doing anything if only `global/pg_control` exists.
pub fn restore_control_file(
    log: &Logger,
    fs: &dyn FileSystem,
    data_dir: &Utf8Path,
) -> Result<(), DirectoryError> {
    let control = data_dir.join("global").join("pg_control");
    let retired = archive_path(&control);

    if path_exists(fs, &retired)? {
        info!(log, "restoring control file"; "path" => %control);
        return rename(fs, &retired, &control);
    }
    if path_exists(fs, &control)? {
        info!(log, "control file already in place"; "path" => %control);
        return Ok(());
    }
    Err(DirectoryError::MissingRequiredPath { path: control })
}

/// Moves `log_dir` to `archive_dir`.
///
/// Succeeds without doing anything if the archive exists and the log
/// directory does not.
pub fn archive_log_directory(
    log: &Logger,
    fs: &dyn FileSystem,
    log_dir: &Utf8Path,
    archive_dir: &Utf8Path,
) -> Result<(), DirectoryError> {
    if path_exists(fs, archive_dir)? && !path_exists(fs, log_dir)? {
        info!(log, "log directory already archived"; "archive" => %archive_dir);
        return Ok(());
    }
    info!(
        log,
        "archiving log directory";
        "from" => %log_dir,
        "to" => %archive_dir,
    );
    rename(fs, log_dir, archive_dir)
}

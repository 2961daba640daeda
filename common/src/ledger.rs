// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Durable, atomically-replaced JSON records
//!
//! A [`Ledger`] is written to one or more paths. Every write goes to a
//! temporary file in the destination directory, is flushed to stable
//! storage, and is then renamed over the previous copy, so a reader never
//! observes a partially-written ledger. [`Ledger::commit`] only returns once
//! that has happened: callers can treat a successful commit as "durable".

use camino::{Utf8Path, Utf8PathBuf};
use serde::{de::DeserializeOwned, Serialize};
use slog::{debug, error, info, warn, Logger};
use std::io;
use tokio::io::AsyncWriteExt;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Cannot serialize ledger to JSON")]
    Serialize(#[source] serde_json::Error),

    #[error("Failed to write the ledger to storage: {}", describe_failures(.failed_paths))]
    FailedToWrite { failed_paths: Vec<(Utf8PathBuf, io::Error)> },

    #[error("Failed to read the ledger from storage: {}", describe_failures(.failed_paths))]
    FailedToRead { failed_paths: Vec<(Utf8PathBuf, io::Error)> },
}

fn describe_failures(failed_paths: &[(Utf8PathBuf, io::Error)]) -> String {
    failed_paths
        .iter()
        .map(|(path, err)| format!("{path}: {err}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Returns true if any underlying write failed with `kind`.
    pub fn has_io_kind(&self, kind: io::ErrorKind) -> bool {
        match self {
            Error::Serialize(_) => false,
            Error::FailedToWrite { failed_paths }
            | Error::FailedToRead { failed_paths } => {
                failed_paths.iter().any(|(_, err)| err.kind() == kind)
            }
        }
    }
}

/// A type which can be stored in a [`Ledger`].
pub trait Ledgerable: DeserializeOwned + Serialize + Send + Sync {
    /// Returns true if this ledger is newer than `other`.
    fn is_newer_than(&self, other: &Self) -> bool;

    /// Increments the generation of this ledger. Called on every commit.
    fn generation_bump(&mut self);
}

/// Manages a ledger of `T` stored at a set of paths.
pub struct Ledger<T> {
    log: Logger,
    ledger: T,
    paths: Vec<Utf8PathBuf>,
}

impl<T: Ledgerable> Ledger<T> {
    /// Creates a ledger with a default initial value, without reading
    /// anything from storage.
    pub fn new_with(log: &Logger, paths: Vec<Utf8PathBuf>, default: T) -> Self {
        Self { log: log.clone(), ledger: default, paths }
    }

    /// Reads the ledger from any of the provided `paths`.
    ///
    /// Returns the newest readable copy, or `None` if no path holds a
    /// ledger at all. A copy that exists but cannot be read or parsed is
    /// skipped when another copy is readable, and is an error otherwise.
    pub async fn new(
        log: &Logger,
        paths: Vec<Utf8PathBuf>,
    ) -> Result<Option<Self>, Error> {
        let mut ledger: Option<T> = None;
        let mut failed_paths = Vec::new();
        for path in &paths {
            match read_from::<T>(log, path).await {
                Ok(Some(candidate)) => match &ledger {
                    Some(current) if !candidate.is_newer_than(current) => {}
                    _ => ledger = Some(candidate),
                },
                Ok(None) => {
                    debug!(log, "no ledger at path"; "path" => %path);
                }
                Err(err) => {
                    warn!(
                        log,
                        "failed to read ledger";
                        "path" => %path,
                        "error" => %err,
                    );
                    failed_paths.push((path.clone(), err));
                }
            }
        }

        match ledger {
            Some(ledger) => Ok(Some(Self { log: log.clone(), ledger, paths })),
            None if failed_paths.is_empty() => Ok(None),
            None => {
                error!(log, "no ledger copy could be read");
                Err(Error::FailedToRead { failed_paths })
            }
        }
    }

    pub fn data(&self) -> &T {
        &self.ledger
    }

    pub fn data_mut(&mut self) -> &mut T {
        &mut self.ledger
    }

    /// Bumps the generation and durably writes the ledger to every path.
    ///
    /// Succeeds if at least one copy was written.
    pub async fn commit(&mut self) -> Result<(), Error> {
        self.ledger.generation_bump();

        let contents =
            serde_json::to_vec_pretty(&self.ledger).map_err(Error::Serialize)?;

        let mut failed_paths = Vec::new();
        for path in &self.paths {
            if let Err(err) = write_atomic(path, &contents).await {
                warn!(
                    self.log,
                    "failed to write ledger";
                    "path" => %path,
                    "error" => %err,
                );
                failed_paths.push((path.clone(), err));
            }
        }

        if failed_paths.len() == self.paths.len() {
            error!(self.log, "no ledger copy could be written");
            return Err(Error::FailedToWrite { failed_paths });
        }
        info!(
            self.log,
            "committed ledger";
            "paths" => ?self.paths,
            "failed" => failed_paths.len(),
        );
        Ok(())
    }
}

async fn read_from<T: Ledgerable>(
    log: &Logger,
    path: &Utf8Path,
) -> Result<Option<T>, io::Error> {
    let contents = match tokio::fs::read(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let ledger = serde_json::from_slice(&contents)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    debug!(log, "read ledger"; "path" => %path);
    Ok(Some(ledger))
}

/// Writes `contents` to `path` such that a crash at any point leaves either
/// the previous contents or the new contents, never a mix.
async fn write_atomic(path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("ledger path {path} has no file name"),
        )
    })?;
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, path).await?;

    // Persist the rename itself.
    if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
        let dir = tokio::fs::File::open(parent).await?;
        dir.sync_all().await?;
    }
    Ok(())
}

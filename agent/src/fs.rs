// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The filesystem operations used by the directory primitives
//!
//! Every primitive receives a [`FileSystem`] rather than calling `std::fs`
//! directly.
//!
//! - In production, this is a [`HostFileSystem`].
//! - Under test, a [`FaultyFileSystem`] can fail any individual operation
//!   and records what was attempted.

use camino::{Utf8Path, Utf8PathBuf};
use std::io;
use std::sync::{Arc, Mutex};

/// The commonly-used trait object form of a [`FileSystem`].
pub type BoxedFileSystem = Arc<dyn FileSystem>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Dir,
    File,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub file_type: FileType,
}

pub trait FileSystem: Send + Sync {
    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> io::Result<()>;

    fn remove_dir_all(&self, path: &Utf8Path) -> io::Result<()>;

    /// Removes an empty directory.
    fn remove_dir(&self, path: &Utf8Path) -> io::Result<()>;

    /// Returns the type of `path`, following symlinks.
    fn stat(&self, path: &Utf8Path) -> io::Result<FileType>;

    fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<DirEntry>>;

    fn hostname(&self) -> io::Result<String>;
}

fn file_type_of(ft: std::fs::FileType) -> FileType {
    if ft.is_dir() {
        FileType::Dir
    } else if ft.is_file() {
        FileType::File
    } else {
        FileType::Other
    }
}

/// Operates on the real filesystem of this host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostFileSystem;

impl HostFileSystem {
    pub fn new() -> BoxedFileSystem {
        Arc::new(HostFileSystem)
    }
}

impl FileSystem for HostFileSystem {
    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn remove_dir_all(&self, path: &Utf8Path) -> io::Result<()> {
        std::fs::remove_dir_all(path)
    }

    fn remove_dir(&self, path: &Utf8Path) -> io::Result<()> {
        std::fs::remove_dir(path)
    }

    fn stat(&self, path: &Utf8Path) -> io::Result<FileType> {
        std::fs::metadata(path).map(|m| file_type_of(m.file_type()))
    }

    fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            // Follow symlinks, like `stat`.
            let file_type = match std::fs::metadata(entry.path()) {
                Ok(m) => file_type_of(m.file_type()),
                Err(_) => file_type_of(entry.file_type()?),
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                file_type,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn hostname(&self) -> io::Result<String> {
        gethostname::gethostname().into_string().map_err(|name| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("hostname {name:?} is not valid UTF-8"),
            )
        })
    }
}

/// One attempted filesystem operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsOp {
    Rename { from: Utf8PathBuf, to: Utf8PathBuf },
    RemoveDirAll(Utf8PathBuf),
    RemoveDir(Utf8PathBuf),
    Stat(Utf8PathBuf),
    ReadDir(Utf8PathBuf),
    Hostname,
}

impl FsOp {
    /// Returns true for operations that change the filesystem.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            FsOp::Rename { .. } | FsOp::RemoveDirAll(_) | FsOp::RemoveDir(_)
        )
    }
}

/// Handler deciding whether an operation fails. Returning `Some(err)` fails
/// the operation with `err` without touching the filesystem; `None` lets it
/// through to the host.
pub type FaultFn = dyn FnMut(&FsOp) -> Option<io::Error> + Send;
pub type BoxedFaultFn = Box<FaultFn>;

/// A [`HostFileSystem`] which can be told to fail individual operations.
pub struct FaultyFileSystem {
    handler: Mutex<BoxedFaultFn>,
    hostname: Mutex<Option<String>>,
    ops: Mutex<Vec<FsOp>>,
}

impl FaultyFileSystem {
    pub fn new() -> Arc<FaultyFileSystem> {
        Arc::new(Self {
            handler: Mutex::new(Box::new(|_op| None)),
            hostname: Mutex::new(None),
            ops: Mutex::new(Vec::new()),
        })
    }

    /// Set the fault handler to an arbitrary function.
    pub fn set_fault_handler(&self, f: BoxedFaultFn) {
        *self.handler.lock().unwrap() = f;
    }

    /// Report `hostname` rather than the host's real name.
    pub fn set_hostname(&self, hostname: &str) {
        *self.hostname.lock().unwrap() = Some(hostname.to_string());
    }

    /// Every operation attempted so far, including failed ones.
    pub fn ops(&self) -> Vec<FsOp> {
        self.ops.lock().unwrap().clone()
    }

    /// The attempted operations that change the filesystem.
    pub fn mutations(&self) -> Vec<FsOp> {
        self.ops().into_iter().filter(FsOp::is_mutation).collect()
    }

    fn check(&self, op: FsOp) -> io::Result<()> {
        let fault = (self.handler.lock().unwrap())(&op);
        self.ops.lock().unwrap().push(op);
        match fault {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl FileSystem for FaultyFileSystem {
    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
        self.check(FsOp::Rename { from: from.to_owned(), to: to.to_owned() })?;
        HostFileSystem.rename(from, to)
    }

    fn remove_dir_all(&self, path: &Utf8Path) -> io::Result<()> {
        self.check(FsOp::RemoveDirAll(path.to_owned()))?;
        HostFileSystem.remove_dir_all(path)
    }

    fn remove_dir(&self, path: &Utf8Path) -> io::Result<()> {
        self.check(FsOp::RemoveDir(path.to_owned()))?;
        HostFileSystem.remove_dir(path)
    }

    fn stat(&self, path: &Utf8Path) -> io::Result<FileType> {
        self.check(FsOp::Stat(path.to_owned()))?;
        HostFileSystem.stat(path)
    }

    fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<DirEntry>> {
        self.check(FsOp::ReadDir(path.to_owned()))?;
        HostFileSystem.read_dir(path)
    }

    fn hostname(&self) -> io::Result<String> {
        self.check(FsOp::Hostname)?;
        match self.hostname.lock().unwrap().clone() {
            Some(name) => Ok(name),
            None => HostFileSystem.hostname(),
        }
    }
}

/// Returns an error of `kind` for use from a fault handler.
pub fn fault(kind: io::ErrorKind) -> Option<io::Error> {
    Some(io::Error::from(kind))
}

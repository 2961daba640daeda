// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Free-space checks for the filesystems holding segment directories

use camino::{Utf8Path, Utf8PathBuf};
use std::io;
use upgrade_agent_api::DiskUsage;

#[derive(Debug, thiserror::Error)]
pub enum DiskSpaceError {
    #[error("free ratio {0} is not between 0 and 1")]
    InvalidRatio(f64),

    #[error("failed to query filesystem of {path}")]
    Statvfs {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
}

/// Total and available bytes of a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilesystemSize {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

pub fn filesystem_size(path: &Utf8Path) -> io::Result<FilesystemSize> {
    let stat = nix::sys::statvfs::statvfs(path.as_std_path())?;

    // `fsblkcnt_t` is a `u32` on macOS but a `u64` on Linux.
    #[allow(clippy::useless_conversion)]
    let fragment_size = u64::from(stat.fragment_size());
    #[allow(clippy::useless_conversion)]
    let total_bytes = u64::from(stat.blocks()) * fragment_size;
    #[allow(clippy::useless_conversion)]
    let available_bytes = u64::from(stat.blocks_available()) * fragment_size;
    Ok(FilesystemSize { total_bytes, available_bytes })
}

/// Returns the bytes that must remain free on a filesystem of
/// `total_bytes` to satisfy `free_ratio`.
pub fn required_bytes(total_bytes: u64, free_ratio: f64) -> u64 {
    (total_bytes as f64 * free_ratio).ceil() as u64
}

/// Measures the filesystem of every directory in `dirs` against
/// `free_ratio`, using `size_of` to query each one.
pub fn check_disk_space_with<F>(
    dirs: &[Utf8PathBuf],
    free_ratio: f64,
    mut size_of: F,
) -> Result<Vec<DiskUsage>, DiskSpaceError>
where
    F: FnMut(&Utf8Path) -> io::Result<FilesystemSize>,
{
    if !(0.0..=1.0).contains(&free_ratio) {
        return Err(DiskSpaceError::InvalidRatio(free_ratio));
    }

    dirs.iter()
        .map(|dir| {
            let size = size_of(dir.as_path()).map_err(|err| {
                DiskSpaceError::Statvfs { path: dir.clone(), err }
            })?;
            Ok(DiskUsage {
                dir: dir.clone(),
                total_bytes: size.total_bytes,
                available_bytes: size.available_bytes,
                required_bytes: required_bytes(size.total_bytes, free_ratio),
            })
        })
        .collect()
}

pub fn check_disk_space(
    dirs: &[Utf8PathBuf],
    free_ratio: f64,
) -> Result<Vec<DiskUsage>, DiskSpaceError> {
    check_disk_space_with(dirs, free_ratio, filesystem_size)
}

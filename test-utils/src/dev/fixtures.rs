// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-disk fixtures shaped like database data and tablespace directories
//!
//! These panic on failure: they are only meant to set up test state.

use camino::{Utf8Path, Utf8PathBuf};

/// Files that mark a directory as a database data directory.
pub const DATA_DIRECTORY_MARKERS: &[&str] = &["PG_VERSION", "postgresql.conf"];

/// Writes `contents` to `path`, creating parent directories as needed.
pub fn write_file(path: &Utf8Path, contents: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .unwrap_or_else(|e| panic!("creating {parent}: {e}"));
    }
    std::fs::write(path, contents)
        .unwrap_or_else(|e| panic!("writing {path}: {e}"));
}

/// Creates `dir` as a data directory: it contains every marker file plus
/// some content.
pub fn create_data_dir(dir: &Utf8Path) -> Utf8PathBuf {
    for marker in DATA_DIRECTORY_MARKERS {
        write_file(&dir.join(marker), "");
    }
    write_file(&dir.join("base").join("1").join("1259"), "relation data");
    dir.to_path_buf()
}

/// Creates a data directory whose marker files record `tag`, so tests can
/// tell which directory ended up where after a rename.
pub fn create_tagged_data_dir(dir: &Utf8Path, tag: &str) -> Utf8PathBuf {
    create_data_dir(dir);
    write_file(&dir.join("tag"), tag);
    dir.to_path_buf()
}

/// Returns the tag written by [`create_tagged_data_dir`].
pub fn read_tag(dir: &Utf8Path) -> String {
    std::fs::read_to_string(dir.join("tag"))
        .unwrap_or_else(|e| panic!("reading tag of {dir}: {e}"))
}

/// Creates a target tablespace directory
/// `<location>/<dbid>/GPDB_<major>_<catalog>` holding one database
/// directory, and returns its path.
pub fn create_target_tablespace(
    location: &Utf8Path,
    dbid: i32,
    major: u32,
    catalog_version: &str,
) -> Utf8PathBuf {
    let dir = location
        .join(dbid.to_string())
        .join(format!("GPDB_{major}_{catalog_version}"));
    write_file(&dir.join("16384").join("PG_VERSION"), "");
    dir
}

/// Creates a legacy tablespace location with one database directory per
/// entry of `db_oids`, each holding a version marker.
pub fn create_legacy_tablespace(
    location: &Utf8Path,
    db_oids: &[u32],
) -> Utf8PathBuf {
    std::fs::create_dir_all(location)
        .unwrap_or_else(|e| panic!("creating {location}: {e}"));
    for oid in db_oids {
        let dbdir = location.join(oid.to_string());
        write_file(&dbdir.join("PG_VERSION"), "5");
        write_file(&dbdir.join("12345"), "relation data");
    }
    location.to_path_buf()
}

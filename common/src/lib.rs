// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Upgrade orchestrator common facilities
//!
//! The hub sequences the phases of an in-place major-version upgrade and
//! dispatches per-host work to agents. This crate holds what both sides
//! share: the identifier of an upgrade run, the aggregate error list used by
//! every "attempt all, report at the end" operation, durable ledgers, retry
//! policies, and small helpers for the binaries.

use camino::{Utf8Path, Utf8PathBuf};

pub mod backoff;
pub mod cmd;
pub mod error_list;
pub mod ledger;
pub mod upgrade_id;

pub use error_list::ErrorList;
pub use error_list::LabeledError;
pub use upgrade_id::UpgradeId;

/// A type that allows adding file and line numbers to log messages
/// automatically. It should be instantiated at the root logger of each
/// executable that desires this functionality, as in the following example.
/// ```ignore
///     slog::Logger::root(drain, o!(FileKv))
/// ```
pub struct FileKv;

impl slog::KV for FileKv {
    fn serialize(
        &self,
        record: &slog::Record,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        // Only log file information when severity is at least info level
        if record.level() > slog::Level::Info {
            return Ok(());
        }
        serializer.emit_arguments(
            "file".into(),
            &format_args!("{}:{}", record.file(), record.line()),
        )
    }
}

/// Default port the agent listens on.
pub const AGENT_PORT: u16 = 6416;

/// Files which must be present for a directory to be treated as a database
/// data directory.
pub const DATA_DIRECTORY_MARKERS: &[&str] = &["PG_VERSION", "postgresql.conf"];

/// Version marker written into every database directory.
pub const PG_VERSION: &str = "PG_VERSION";

/// Suffix marking a directory as retired but not yet deleted.
pub const OLD_SUFFIX: &str = ".old";

/// Prefix of the final component of every target tablespace directory.
pub const TABLESPACE_DIR_PREFIX: &str = "GPDB_";

/// Returns the directory holding a target tablespace, e.g.
/// `/ts/16386` with dbid 1, major version 6 and catalog version
/// `301908232` gives `/ts/16386/1/GPDB_6_301908232`.
pub fn tablespace_path(
    location: &Utf8Path,
    dbid: i32,
    major_version: u32,
    catalog_version: &str,
) -> Utf8PathBuf {
    location
        .join(dbid.to_string())
        .join(format!("{TABLESPACE_DIR_PREFIX}{major_version}_{catalog_version}"))
}

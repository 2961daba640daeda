// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Topology of the source cluster
//!
//! The cluster is described by a TOML file listing every segment:
//!
//! ```toml
//! [[segment]]
//! host = "cdw"
//! address = "10.0.0.1"
//! content = -1
//! dbid = 1
//! role = "coordinator"
//! port = 5432
//! data_dir = "/data/coordinator/gpseg-1"
//!
//! [[segment.tablespace]]
//! oid = 16386
//! name = "batch"
//! location = "/ts/batch"
//! user_defined = true
//! ```

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use upgrade_agent_client::Tablespace;

/// Content id of the coordinator.
pub const COORDINATOR_CONTENT: i32 = -1;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Coordinator,
    Standby,
    Primary,
    Mirror,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SegmentTablespace {
    pub oid: u32,
    pub name: String,
    pub location: Utf8PathBuf,
    #[serde(default)]
    pub user_defined: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Segment {
    pub host: String,
    pub address: String,
    pub content: i32,
    pub dbid: i32,
    pub role: Role,
    pub port: u16,
    pub data_dir: Utf8PathBuf,
    #[serde(default, rename = "tablespace")]
    pub tablespaces: Vec<SegmentTablespace>,
}

impl Segment {
    /// Returns true for the segments pg_upgrade runs against.
    pub fn is_upgraded(&self) -> bool {
        matches!(self.role, Role::Coordinator | Role::Primary)
    }

    pub fn tablespace_map(&self) -> BTreeMap<u32, Tablespace> {
        self.tablespaces
            .iter()
            .map(|ts| {
                (
                    ts.oid,
                    Tablespace {
                        name: ts.name.clone(),
                        location: ts.location.clone(),
                        user_defined: ts.user_defined,
                    },
                )
            })
            .collect()
    }

    pub fn user_tablespaces(&self) -> impl Iterator<Item = &SegmentTablespace> {
        self.tablespaces.iter().filter(|ts| ts.user_defined)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Failed to read cluster from {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse cluster from {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("cluster has {0} coordinators; expected exactly one")]
    Coordinators(usize),
    #[error("dbid {0} appears more than once")]
    DuplicateDbid(i32),
    #[error("content {content} has more than one {role:?}")]
    DuplicateContent { content: i32, role: Role },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ClusterFile {
    #[serde(default)]
    segment: Vec<Segment>,
}

#[derive(Clone, Debug)]
pub struct Cluster {
    segments: Vec<Segment>,
    coordinator: usize,
}

impl Cluster {
    pub fn new(mut segments: Vec<Segment>) -> Result<Self, ClusterError> {
        let coordinators =
            segments.iter().filter(|s| s.role == Role::Coordinator).count();
        if coordinators != 1 {
            return Err(ClusterError::Coordinators(coordinators));
        }

        let mut dbids = BTreeSet::new();
        let mut contents = BTreeSet::new();
        for segment in &segments {
            if !dbids.insert(segment.dbid) {
                return Err(ClusterError::DuplicateDbid(segment.dbid));
            }
            if !contents.insert((segment.content, segment.role)) {
                return Err(ClusterError::DuplicateContent {
                    content: segment.content,
                    role: segment.role,
                });
            }
        }

        segments.sort_by_key(|s| (s.content, s.dbid));
        let coordinator = segments
            .iter()
            .position(|s| s.role == Role::Coordinator)
            .ok_or(ClusterError::Coordinators(0))?;
        Ok(Cluster { segments, coordinator })
    }

    pub fn from_file(path: &Utf8Path) -> Result<Self, ClusterError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ClusterError::Io { path: path.into(), err })?;
        let file: ClusterFile = toml::from_str(&contents)
            .map_err(|err| ClusterError::Parse { path: path.into(), err })?;
        Cluster::new(file.segment)
    }

    /// All segments, ordered by content id.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn coordinator(&self) -> &Segment {
        &self.segments[self.coordinator]
    }

    pub fn primaries(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| s.role == Role::Primary)
    }

    /// The coordinator followed by every primary.
    pub fn upgraded_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| s.is_upgraded())
    }

    /// Every host running at least one segment.
    pub fn hosts(&self) -> BTreeSet<&str> {
        self.segments.iter().map(|s| s.host.as_str()).collect()
    }

    /// The prefix shared by the names of segment data directories, taken
    /// from the coordinator's, e.g. `gpseg` for `/data/gpseg-1`.
    pub fn segment_prefix(&self) -> &str {
        let name = self.coordinator().data_dir.file_name().unwrap_or("");
        name.strip_suffix(&COORDINATOR_CONTENT.to_string()).unwrap_or(name)
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::Utf8PathBuf;
use dropshot::{
    HttpError, HttpResponseOk, HttpResponseUpdatedNoContent, RequestContext,
    TypedBody,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[dropshot::api_description]
pub trait UpgradeAgentApi {
    type Context;

    /// Report the agent's hostname and state directory.
    #[endpoint {
        method = GET,
        path = "/status",
    }]
    async fn status(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseOk<AgentStatus>, HttpError>;

    /// Report free space on the filesystems holding the given directories.
    #[endpoint {
        method = POST,
        path = "/disk-space/check",
    }]
    async fn check_disk_space(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<DiskSpaceRequest>,
    ) -> Result<HttpResponseOk<DiskSpaceResponse>, HttpError>;

    /// Run pg_upgrade for every segment in the request, concurrently.
    #[endpoint {
        method = POST,
        path = "/primaries/upgrade",
    }]
    async fn upgrade_primaries(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<UpgradePrimariesRequest>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError>;

    /// Archive each target data directory and swap the source into place.
    #[endpoint {
        method = POST,
        path = "/directories/rename",
    }]
    async fn rename_directories(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<RenameDirectoriesRequest>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError>;

    /// Delete data directories, after checking they look like data
    /// directories.
    #[endpoint {
        method = POST,
        path = "/directories/delete",
    }]
    async fn delete_data_directories(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<DeleteDirectoriesRequest>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError>;

    /// Delete the agent's own state directory.
    #[endpoint {
        method = POST,
        path = "/state-directory/delete",
    }]
    async fn delete_state_directory(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError>;

    /// Delete tablespace directories created for the target cluster.
    #[endpoint {
        method = POST,
        path = "/tablespaces/delete-target",
    }]
    async fn delete_target_tablespaces(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<TablespaceDirectoriesRequest>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError>;

    /// Delete the database directories of legacy source tablespaces.
    #[endpoint {
        method = POST,
        path = "/tablespaces/delete-source",
    }]
    async fn delete_source_tablespaces(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<TablespaceDirectoriesRequest>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError>;

    /// Check that legacy source tablespace locations are well formed.
    #[endpoint {
        method = POST,
        path = "/tablespaces/verify-source",
    }]
    async fn verify_source_tablespaces(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<TablespaceDirectoriesRequest>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError>;

    /// Move the agent's log directory aside under an archive name.
    #[endpoint {
        method = POST,
        path = "/log-directory/archive",
    }]
    async fn archive_log_directory(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<ArchiveLogDirectoryRequest>,
    ) -> Result<HttpResponseOk<ArchiveLogDirectoryResponse>, HttpError>;

    /// Copy directories to other hosts with rsync.
    #[endpoint {
        method = POST,
        path = "/rsync",
    }]
    async fn rsync(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<RsyncRequest>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError>;

    /// Put back control files retired by a link-mode upgrade.
    #[endpoint {
        method = POST,
        path = "/control-files/restore",
    }]
    async fn restore_control_files(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<RestoreControlFilesRequest>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError>;

    /// Ask the agent to shut down once the response has been sent.
    #[endpoint {
        method = POST,
        path = "/stop",
    }]
    async fn stop(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct AgentStatus {
    pub hostname: String,
    #[schemars(with = "String")]
    pub state_dir: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct DiskSpaceRequest {
    /// Fraction of each filesystem that must remain free, in `[0, 1]`.
    pub free_ratio: f64,
    #[schemars(with = "Vec<String>")]
    pub dirs: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct DiskUsage {
    #[schemars(with = "String")]
    pub dir: Utf8PathBuf,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub required_bytes: u64,
}

impl DiskUsage {
    pub fn is_sufficient(&self) -> bool {
        self.available_bytes >= self.required_bytes
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct DiskSpaceResponse {
    pub usage: Vec<DiskUsage>,
}

impl DiskSpaceResponse {
    /// Entries whose filesystem does not have enough free space.
    pub fn insufficient(&self) -> impl Iterator<Item = &DiskUsage> {
        self.usage.iter().filter(|u| !u.is_sufficient())
    }
}

/// A named, relocatable storage area of one segment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct Tablespace {
    pub name: String,
    #[schemars(with = "String")]
    pub location: Utf8PathBuf,
    pub user_defined: bool,
}

/// One segment's on-disk identity before and after the upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct DataDirPair {
    #[schemars(with = "String")]
    pub source_data_dir: Utf8PathBuf,
    #[schemars(with = "String")]
    pub target_data_dir: Utf8PathBuf,
    pub source_port: u16,
    pub target_port: u16,
    pub content: i32,
    pub dbid: i32,
    #[serde(default)]
    pub tablespaces: BTreeMap<u32, Tablespace>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeMode {
    /// Copy relation files into the target data directory.
    Copy,
    /// Hard-link relation files. Faster, but the source cluster can no
    /// longer be started once the upgrade has run.
    Link,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct UpgradePrimariesRequest {
    #[schemars(with = "String")]
    pub source_bin_dir: Utf8PathBuf,
    #[schemars(with = "String")]
    pub target_bin_dir: Utf8PathBuf,
    pub mode: UpgradeMode,
    /// Only check the clusters for compatibility.
    pub check_only: bool,
    /// Upgrade the coordinator rather than segments.
    #[serde(default)]
    pub coordinator: bool,
    pub data_dir_pairs: Vec<DataDirPair>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct RenameDirectories {
    pub dbid: i32,
    pub content: i32,
    #[schemars(with = "String")]
    pub source: Utf8PathBuf,
    #[schemars(with = "String")]
    pub target: Utf8PathBuf,
    /// Also move `source` to `target` once `target` has been archived.
    pub rename_target: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct RenameDirectoriesRequest {
    pub dirs: Vec<RenameDirectories>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct DeleteDirectoriesRequest {
    #[schemars(with = "Vec<String>")]
    pub data_dirs: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct TablespaceDirectoriesRequest {
    #[schemars(with = "Vec<String>")]
    pub dirs: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct ArchiveLogDirectoryRequest {
    /// Name of the archive directory, created next to the log directory.
    pub archive_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct ArchiveLogDirectoryResponse {
    #[schemars(with = "String")]
    pub archive_dir: Utf8PathBuf,
}

/// Copy `source` on the agent's host to `destination` on
/// `destination_host`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct RsyncPair {
    #[schemars(with = "String")]
    pub source: Utf8PathBuf,
    pub destination_host: String,
    #[schemars(with = "String")]
    pub destination: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct RsyncRequest {
    pub pairs: Vec<RsyncPair>,
    /// Extra rsync options, e.g. `--delete`.
    #[serde(default)]
    pub options: Vec<String>,
    /// Patterns passed to `--exclude`.
    #[serde(default)]
    pub excludes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct RestoreControlFilesRequest {
    #[schemars(with = "Vec<String>")]
    pub data_dirs: Vec<Utf8PathBuf>,
}

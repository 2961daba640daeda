// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::context::{ServerContext, STATE_MARKER};
use crate::directories;
use crate::disk_space;
use crate::error::AgentError;
use crate::segments;
use camino::Utf8Path;
use dropshot::{
    HttpError, HttpResponseOk, HttpResponseUpdatedNoContent, RequestContext,
    TypedBody,
};
use slog::{info, Logger};
use std::sync::Arc;
use upgrade_agent_api::*;

type UpgradeAgentApiDescription = dropshot::ApiDescription<Arc<ServerContext>>;

pub fn api() -> UpgradeAgentApiDescription {
    upgrade_agent_api_mod::api_description::<UpgradeAgentImpl>()
        .expect("registered entrypoints")
}

/// Logs each line written by a primitive's progress sink.
fn log_progress(log: &Logger, progress: Vec<u8>) {
    for line in String::from_utf8_lossy(&progress).lines() {
        info!(log, "{}", line);
    }
}

fn paths(dirs: &[camino::Utf8PathBuf]) -> Vec<&Utf8Path> {
    dirs.iter().map(|d| d.as_path()).collect()
}

enum UpgradeAgentImpl {}

impl UpgradeAgentApi for UpgradeAgentImpl {
    type Context = Arc<ServerContext>;

    async fn status(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseOk<AgentStatus>, HttpError> {
        let ctx = rqctx.context();
        let hostname = ctx.fs().hostname().map_err(|err| {
            AgentError::Directory(directories::DirectoryError::Hostname(err))
        })?;
        Ok(HttpResponseOk(AgentStatus {
            hostname,
            state_dir: ctx.state_dir().to_path_buf(),
        }))
    }

    async fn check_disk_space(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<DiskSpaceRequest>,
    ) -> Result<HttpResponseOk<DiskSpaceResponse>, HttpError> {
        let request = body.into_inner();
        let usage = rqctx
            .context()
            .run_blocking(move |_| {
                Ok(disk_space::check_disk_space(
                    &request.dirs,
                    request.free_ratio,
                )?)
            })
            .await?;
        Ok(HttpResponseOk(DiskSpaceResponse { usage }))
    }

    async fn upgrade_primaries(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<UpgradePrimariesRequest>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError> {
        let ctx = rqctx.context();
        let request = body.into_inner();
        segments::upgrade_segments(
            ctx.log(),
            ctx.runner().as_ref(),
            ctx.state_dir(),
            &request,
        )
        .await
        .map_err(AgentError::Commands)?;
        Ok(HttpResponseUpdatedNoContent())
    }

    async fn rename_directories(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<RenameDirectoriesRequest>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError> {
        let request = body.into_inner();
        rqctx
            .context()
            .run_blocking(move |ctx| {
                segments::rename_directories(
                    ctx.log(),
                    ctx.fs().as_ref(),
                    &request.dirs,
                )
                .map_err(AgentError::Segments)
            })
            .await?;
        Ok(HttpResponseUpdatedNoContent())
    }

    async fn delete_data_directories(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<DeleteDirectoriesRequest>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError> {
        let request = body.into_inner();
        rqctx
            .context()
            .run_blocking(move |ctx| {
                let mut progress = Vec::new();
                let result = directories::delete_directories(
                    ctx.log(),
                    ctx.fs().as_ref(),
                    &paths(&request.data_dirs),
                    upgrade_common::DATA_DIRECTORY_MARKERS,
                    &mut progress,
                );
                log_progress(ctx.log(), progress);
                Ok(result?)
            })
            .await?;
        Ok(HttpResponseUpdatedNoContent())
    }

    async fn delete_state_directory(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError> {
        rqctx
            .context()
            .run_blocking(move |ctx| {
                let mut progress = Vec::new();
                let result = directories::delete_directories(
                    ctx.log(),
                    ctx.fs().as_ref(),
                    &[ctx.state_dir()],
                    &[STATE_MARKER],
                    &mut progress,
                );
                log_progress(ctx.log(), progress);
                Ok(result?)
            })
            .await?;
        Ok(HttpResponseUpdatedNoContent())
    }

    async fn delete_target_tablespaces(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<TablespaceDirectoriesRequest>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError> {
        let request = body.into_inner();
        rqctx
            .context()
            .run_blocking(move |ctx| {
                let mut progress = Vec::new();
                let result = directories::delete_tablespace_directories(
                    ctx.log(),
                    ctx.fs().as_ref(),
                    &mut progress,
                    &paths(&request.dirs),
                );
                log_progress(ctx.log(), progress);
                Ok(result?)
            })
            .await?;
        Ok(HttpResponseUpdatedNoContent())
    }

    async fn delete_source_tablespaces(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<TablespaceDirectoriesRequest>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError> {
        let request = body.into_inner();
        rqctx
            .context()
            .run_blocking(move |ctx| {
                let mut progress = Vec::new();
                let result = directories::delete_source_tablespace_directories(
                    ctx.log(),
                    ctx.fs().as_ref(),
                    &mut progress,
                    &paths(&request.dirs),
                );
                log_progress(ctx.log(), progress);
                Ok(result?)
            })
            .await?;
        Ok(HttpResponseUpdatedNoContent())
    }

    async fn verify_source_tablespaces(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<TablespaceDirectoriesRequest>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError> {
        let request = body.into_inner();
        rqctx
            .context()
            .run_blocking(move |ctx| {
                Ok(directories::verify_5x_tablespace_directories(
                    ctx.fs().as_ref(),
                    &paths(&request.dirs),
                )?)
            })
            .await?;
        Ok(HttpResponseUpdatedNoContent())
    }

    async fn archive_log_directory(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<ArchiveLogDirectoryRequest>,
    ) -> Result<HttpResponseOk<ArchiveLogDirectoryResponse>, HttpError> {
        let request = body.into_inner();
        if request.archive_name.is_empty()
            || request.archive_name.contains('/')
            || request.archive_name.starts_with('.')
        {
            return Err(HttpError::for_bad_request(
                None,
                format!("invalid archive name {:?}", request.archive_name),
            ));
        }

        let archive_dir = rqctx
            .context()
            .run_blocking(move |ctx| {
                let log_dir = ctx.log_dir();
                let archive_dir = log_dir
                    .parent()
                    .unwrap_or(log_dir)
                    .join(&request.archive_name);
                directories::archive_log_directory(
                    ctx.log(),
                    ctx.fs().as_ref(),
                    log_dir,
                    &archive_dir,
                )?;
                Ok(archive_dir)
            })
            .await?;
        Ok(HttpResponseOk(ArchiveLogDirectoryResponse { archive_dir }))
    }

    async fn rsync(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<RsyncRequest>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError> {
        let ctx = rqctx.context();
        let request = body.into_inner();
        segments::rsync(ctx.log(), ctx.runner().as_ref(), &request)
            .await
            .map_err(AgentError::Commands)?;
        Ok(HttpResponseUpdatedNoContent())
    }

    async fn restore_control_files(
        rqctx: RequestContext<Self::Context>,
        body: TypedBody<RestoreControlFilesRequest>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError> {
        let request = body.into_inner();
        rqctx
            .context()
            .run_blocking(move |ctx| {
                segments::restore_control_files(
                    ctx.log(),
                    ctx.fs().as_ref(),
                    &request.data_dirs,
                )
                .map_err(AgentError::Segments)
            })
            .await?;
        Ok(HttpResponseUpdatedNoContent())
    }

    async fn stop(
        rqctx: RequestContext<Self::Context>,
    ) -> Result<HttpResponseUpdatedNoContent, HttpError> {
        let ctx = rqctx.context();
        info!(ctx.log(), "stop requested");
        ctx.request_stop();
        Ok(HttpResponseUpdatedNoContent())
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-host upgrade agent
//!
//! The agent performs the host-local half of an upgrade on behalf of the
//! hub: filesystem surgery on segment data and tablespace directories,
//! running pg_upgrade and rsync, and reporting disk space.

use dropshot::HttpServer;
use slog::{info, Drain, Logger};
use std::io;
use std::sync::Arc;
use upgrade_common::FileKv;

mod config;
mod context;
pub mod directories;
pub mod disk_space;
mod error;
pub mod fs;
mod http_entrypoints;
pub mod runner;
pub mod segments;

pub use config::{Config, ConfigError};
pub use context::{ServerContext, STATE_MARKER};
pub use error::AgentError;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to initialize logger")]
    InitializeLogger(#[source] io::Error),
    #[error("failed to initialize HTTP server")]
    InitializeHttpServer(#[source] dropshot::BuildError),
    #[error("failed to initialize context")]
    InitializeContext(#[source] anyhow::Error),
}

/// Start the agent's dropshot server, operating on this host.
pub async fn start_server(
    config: Config,
) -> Result<HttpServer<Arc<ServerContext>>, StartError> {
    let drain = config
        .log
        .to_logger("upgrade-agent")
        .map_err(StartError::InitializeLogger)?;
    let log = Logger::root(drain.fuse(), slog::o!(FileKv));

    let fs = fs::HostFileSystem::new();
    let runner = runner::HostCommandRunner::new(&log);
    start_server_with(&log, config, fs, runner)
}

/// Start the agent's dropshot server with the given filesystem and command
/// runner.
pub fn start_server_with(
    log: &Logger,
    config: Config,
    fs: fs::BoxedFileSystem,
    runner: runner::BoxedCommandRunner,
) -> Result<HttpServer<Arc<ServerContext>>, StartError> {
    let context = ServerContext::new(
        log,
        fs,
        runner,
        config.state_dir.clone(),
        config.log_dir.clone(),
    )
    .map_err(StartError::InitializeContext)?;

    let server = dropshot::ServerBuilder::new(
        http_entrypoints::api(),
        Arc::new(context),
        log.new(slog::o!("component" => "dropshot")),
    )
    .config(config.dropshot)
    .start()
    .map_err(StartError::InitializeHttpServer)?;

    info!(
        log,
        "upgrade agent listening";
        "address" => %server.local_addr(),
        "state_dir" => %config.state_dir,
    );
    Ok(server)
}

/// Serve requests until a stop is requested, then shut the server down.
pub async fn run_until_stopped(
    server: HttpServer<Arc<ServerContext>>,
) -> Result<(), String> {
    server.app_private().stopped().await;
    server.close().await
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::AgentError;
use crate::fs::BoxedFileSystem;
use crate::runner::BoxedCommandRunner;
use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use slog::Logger;
use std::sync::Arc;
use tokio::sync::Notify;

/// File the agent creates in its state directory. The state directory is
/// only ever deleted if it contains this marker.
pub const STATE_MARKER: &str = "upgrade-agent.marker";

pub struct ServerContext {
    log: Logger,
    fs: BoxedFileSystem,
    runner: BoxedCommandRunner,
    state_dir: Utf8PathBuf,
    log_dir: Utf8PathBuf,
    stop: Notify,
}

impl ServerContext {
    /// Creates the context, along with the state directory (and its marker)
    /// and the log directory if they do not exist yet.
    pub fn new(
        log: &Logger,
        fs: BoxedFileSystem,
        runner: BoxedCommandRunner,
        state_dir: Utf8PathBuf,
        log_dir: Utf8PathBuf,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&state_dir).with_context(|| {
            format!("failed to create state directory {state_dir}")
        })?;
        let marker = state_dir.join(STATE_MARKER);
        std::fs::write(&marker, b"")
            .with_context(|| format!("failed to write {marker}"))?;
        std::fs::create_dir_all(&log_dir).with_context(|| {
            format!("failed to create log directory {log_dir}")
        })?;

        Ok(Self {
            log: log.new(slog::o!("component" => "ServerContext")),
            fs,
            runner,
            state_dir,
            log_dir,
            stop: Notify::new(),
        })
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn fs(&self) -> &BoxedFileSystem {
        &self.fs
    }

    pub fn runner(&self) -> &BoxedCommandRunner {
        &self.runner
    }

    pub fn state_dir(&self) -> &Utf8Path {
        &self.state_dir
    }

    pub fn log_dir(&self) -> &Utf8Path {
        &self.log_dir
    }

    /// Ask whoever is waiting in [`ServerContext::stopped`] to shut the
    /// server down.
    pub fn request_stop(&self) {
        self.stop.notify_one();
    }

    /// Completes once a stop has been requested.
    pub async fn stopped(&self) {
        self.stop.notified().await
    }

    /// Runs blocking filesystem work off the async executor.
    pub async fn run_blocking<T, F>(
        self: &Arc<Self>,
        f: F,
    ) -> Result<T, AgentError>
    where
        T: Send + 'static,
        F: FnOnce(&ServerContext) -> Result<T, AgentError> + Send + 'static,
    {
        let ctx = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&ctx)).await?
    }
}

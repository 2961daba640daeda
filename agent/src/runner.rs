// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running the external programs the agent drives (pg_upgrade and rsync)

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use slog::{debug, info, Logger};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use upgrade_agent_api::{DataDirPair, RsyncPair, UpgradeMode};

/// A command to run, described independently of how it is run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: Utf8PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<Utf8PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<Utf8PathBuf>) -> Self {
        Self { program: program.into(), args: Vec::new(), cwd: None }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to run `{command}`")]
    Spawn {
        command: String,
        #[source]
        err: io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed { command: String, status: String, stdout: String, stderr: String },

    #[error("failed to create working directory {path}")]
    WorkDir {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },

    #[error("failed to write tablespace list {path}")]
    TablespacesFile {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
}

/// Describes the commonly-used "safe-to-reference" form of a runner.
pub type BoxedCommandRunner = Arc<dyn CommandRunner>;

/// Runs [`CommandSpec`]s to completion.
///
/// - In production, this is a [`HostCommandRunner`].
/// - Under test, a [`FakeCommandRunner`] answers with canned output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &CommandSpec)
        -> Result<CommandOutput, CommandError>;
}

pub struct HostCommandRunner {
    log: Logger,
    counter: AtomicU64,
}

impl HostCommandRunner {
    pub fn new(log: &Logger) -> BoxedCommandRunner {
        Arc::new(Self {
            log: log.new(slog::o!("component" => "HostCommandRunner")),
            counter: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(
        &self,
        command: &CommandSpec,
    ) -> Result<CommandOutput, CommandError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        info!(self.log, "running command"; "id" => id, "command" => %command);

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }
        let output = cmd.output().await.map_err(|err| CommandError::Spawn {
            command: command.to_string(),
            err,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        info!(
            self.log,
            "finished running command";
            "id" => id,
            "result" => if output.status.success() { "OK" } else { "ERROR" },
        );
        if !stdout.is_empty() {
            debug!(self.log, "command stdout"; "id" => id, "stdout" => &stdout);
        }
        if !stderr.is_empty() {
            debug!(self.log, "command stderr"; "id" => id, "stderr" => &stderr);
        }

        if !output.status.success() {
            return Err(CommandError::Failed {
                command: command.to_string(),
                status: output.status.to_string(),
                stdout,
                stderr,
            });
        }
        Ok(CommandOutput { stdout, stderr })
    }
}

/// Handler called for every command run through a [`FakeCommandRunner`].
pub type RunFn =
    dyn FnMut(&CommandSpec) -> Result<CommandOutput, CommandError> + Send;
pub type BoxedRunFn = Box<RunFn>;

/// A runner which records commands and answers them with a handler.
pub struct FakeCommandRunner {
    log: Logger,
    handler: Mutex<BoxedRunFn>,
    commands: Mutex<Vec<CommandSpec>>,
}

impl FakeCommandRunner {
    pub fn new(log: &Logger) -> Arc<FakeCommandRunner> {
        Arc::new(Self {
            log: log.clone(),
            handler: Mutex::new(Box::new(|_| Ok(CommandOutput::default()))),
            commands: Mutex::new(Vec::new()),
        })
    }

    /// Set the handler to an arbitrary function.
    pub fn set_handler(&self, f: BoxedRunFn) {
        *self.handler.lock().unwrap() = f;
    }

    /// Every command run so far.
    pub fn commands(&self) -> Vec<CommandSpec> {
        self.commands.lock().unwrap().clone()
    }

    /// Perform some type coercion to access a commonly-used trait object.
    pub fn as_runner(self: Arc<Self>) -> BoxedCommandRunner {
        self
    }
}

#[async_trait]
impl CommandRunner for FakeCommandRunner {
    async fn run(
        &self,
        command: &CommandSpec,
    ) -> Result<CommandOutput, CommandError> {
        debug!(self.log, "running fake command"; "command" => %command);
        self.commands.lock().unwrap().push(command.clone());
        (self.handler.lock().unwrap())(command)
    }
}

/// Options shared by every pg_upgrade invocation in a request.
#[derive(Debug, Clone)]
pub struct PgUpgradeOptions<'a> {
    pub source_bin_dir: &'a Utf8Path,
    pub target_bin_dir: &'a Utf8Path,
    pub mode: UpgradeMode,
    pub check_only: bool,
    pub coordinator: bool,
}

/// Returns the directory pg_upgrade runs in (and writes its logs to) for one
/// segment.
pub fn pg_upgrade_work_dir(state_dir: &Utf8Path, content: i32) -> Utf8PathBuf {
    state_dir.join("pg_upgrade").join(format!("seg{content}"))
}

/// File in a segment's work directory listing its source tablespaces.
pub const OLD_TABLESPACES_FILE: &str = "old_tablespaces.txt";

/// Renders the tablespaces of `pair` for pg_upgrade's
/// `--old-tablespaces-file`: one `dbid,oid,name,location,user_defined` line
/// per tablespace.
pub fn old_tablespaces_contents(pair: &DataDirPair) -> String {
    pair.tablespaces
        .iter()
        .map(|(oid, ts)| {
            format!(
                "{},{},{},{},{}\n",
                pair.dbid,
                oid,
                ts.name,
                ts.location,
                u8::from(ts.user_defined)
            )
        })
        .collect()
}

pub fn pg_upgrade_command(
    options: &PgUpgradeOptions<'_>,
    pair: &DataDirPair,
    work_dir: &Utf8Path,
) -> CommandSpec {
    let mut cmd = CommandSpec::new(options.target_bin_dir.join("pg_upgrade"))
        .args(["--old-bindir", options.source_bin_dir.as_str()])
        .args(["--new-bindir", options.target_bin_dir.as_str()])
        .args(["--old-datadir", pair.source_data_dir.as_str()])
        .args(["--new-datadir", pair.target_data_dir.as_str()])
        .args(["--old-port".to_string(), pair.source_port.to_string()])
        .args(["--new-port".to_string(), pair.target_port.to_string()])
        .args(["--old-gp-dbid".to_string(), pair.dbid.to_string()])
        .args(["--new-gp-dbid".to_string(), pair.dbid.to_string()])
        .arg(if options.coordinator {
            "--mode=dispatcher"
        } else {
            "--mode=segment"
        })
        .arg("--retain")
        .current_dir(work_dir);
    if !pair.tablespaces.is_empty() {
        cmd = cmd.args([
            "--old-tablespaces-file".to_string(),
            work_dir.join(OLD_TABLESPACES_FILE).to_string(),
        ]);
    }
    if options.mode == UpgradeMode::Link {
        cmd = cmd.arg("--link");
    }
    if options.check_only {
        cmd = cmd.arg("--check");
    }
    cmd
}

pub fn rsync_command(
    pair: &RsyncPair,
    options: &[String],
    excludes: &[String],
) -> CommandSpec {
    // The trailing slash copies the contents of `source` rather than the
    // directory itself.
    let source = format!("{}/", pair.source.as_str().trim_end_matches('/'));
    CommandSpec::new("rsync")
        .arg("--archive")
        .args(options.iter().cloned())
        .args(excludes.iter().map(|e| format!("--exclude={e}")))
        .arg(source)
        .arg(format!("{}:{}", pair.destination_host, pair.destination))
}

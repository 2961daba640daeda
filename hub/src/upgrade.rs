// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sections of an upgrade and the steps that make them up
//!
//! Every step is written to be run again from the beginning after a crash
//! or failure: each agent operation it dispatches is itself idempotent, and
//! anything the hub decides (the upgrade id, the target layout, the log
//! archive name) is decided once and recorded in [`HubState`].

use crate::cluster::{Cluster, Segment};
use crate::config::Config;
use crate::dispatch::{group_by_host, Agents};
use crate::state::{HubState, TargetLayout};
use crate::step::{
    Section, SectionReport, Sequencer, SequencerError, StepName, StepStatus,
    StepStore,
};
use anyhow::{anyhow, Context};
use camino::Utf8PathBuf;
use chrono::Local;
use slog::{info, warn, Logger};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use upgrade_agent_client::{
    ArchiveLogDirectoryRequest, ClientError, DataDirPair,
    DeleteDirectoriesRequest, DiskSpaceRequest, RenameDirectories,
    RenameDirectoriesRequest, RestoreControlFilesRequest, RsyncPair,
    RsyncRequest, TablespaceDirectoriesRequest, UpgradeMode,
    UpgradePrimariesRequest,
};
use upgrade_common::backoff::{
    agent_startup_policy, retry_notify, BackoffError,
};
use upgrade_common::upgrade_id::archive_directory_name;
use upgrade_common::{ledger, tablespace_path, ErrorList, UpgradeId};

/// Major version whose tablespaces use the legacy layout: database
/// directories directly under each segment's tablespace location.
const LEGACY_TABLESPACE_MAJOR_VERSION: u32 = 5;

/// Files of the upgraded coordinator that must not overwrite a primary's
/// own copies.
pub const COPY_COORDINATOR_EXCLUDES: &[&str] = &[
    "backup_label.old",
    "gp_dbid",
    "internal.auto.conf",
    "pg_hba.conf",
    "postgresql.auto.conf",
    "postgresql.conf",
    "postmaster.opts",
    "postmaster.pid",
    "recovery.conf",
];

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("failed to create state directory {path}")]
    CreateStateDir {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to load or record upgrade state")]
    State(#[from] ledger::Error),
    #[error("failed to load step status")]
    Steps(#[source] ledger::Error),
}

#[derive(Debug, thiserror::Error)]
#[error(
    "{dir} has {available_bytes} bytes available; {required_bytes} must be \
     free"
)]
pub struct InsufficientDiskSpace {
    pub dir: Utf8PathBuf,
    pub available_bytes: u64,
    pub required_bytes: u64,
}

/// Everything the steps of a section act on.
struct HubContext {
    log: Logger,
    config: Config,
    cluster: Cluster,
    agents: Agents,
    state: Mutex<HubState>,
}

/// Drives one upgrade of a cluster.
pub struct Hub {
    ctx: HubContext,
    store: StepStore,
}

impl Hub {
    /// Opens the upgrade recorded in the configured state directory,
    /// starting a new one if there is none.
    pub async fn open(
        log: &Logger,
        config: Config,
        cluster: Cluster,
        agents: Agents,
    ) -> Result<Hub, OpenError> {
        let log = log.new(slog::o!("component" => "Hub"));
        tokio::fs::create_dir_all(&config.state_dir).await.map_err(|err| {
            OpenError::CreateStateDir { path: config.state_dir.clone(), err }
        })?;

        let state = HubState::load_or_create(&log, &config.state_dir).await?;
        let store = StepStore::load(&log, &config.state_dir)
            .await
            .map_err(OpenError::Steps)?;
        Ok(Hub {
            ctx: HubContext {
                log,
                config,
                cluster,
                agents,
                state: Mutex::new(state),
            },
            store,
        })
    }

    pub async fn id(&self) -> UpgradeId {
        self.ctx.state.lock().await.id()
    }

    pub async fn layout(&self) -> Option<TargetLayout> {
        self.ctx.state.lock().await.layout().cloned()
    }

    pub fn steps(&self) -> &StepStore {
        &self.store
    }

    /// Checks that the agents, the cluster and the disks are ready, and
    /// decides where the target cluster goes.
    pub async fn initialize(&mut self) -> Result<SectionReport, SequencerError> {
        check_section(&self.store, Section::Initialize)?;
        let Hub { ctx, store } = self;
        let ctx = &*ctx;

        let mut sequencer = Sequencer::new(&ctx.log, Section::Initialize);
        sequencer.new_step(StepName::CheckAgents, || ctx.check_agents());
        sequencer.new_step(StepName::GenerateTargetLayout, || {
            ctx.generate_target_layout()
        });
        sequencer.new_step(StepName::CheckDiskSpace, || ctx.check_disk_space());
        sequencer.new_step(StepName::VerifySourceTablespaces, || {
            ctx.verify_source_tablespaces()
        });
        sequencer.new_step(StepName::CheckUpgrade, || ctx.check_upgrade());
        sequencer.execute(store).await
    }

    /// Upgrades the coordinator and every primary into the target data
    /// directories. The source cluster is left in place.
    pub async fn execute(&mut self) -> Result<SectionReport, SequencerError> {
        check_section(&self.store, Section::Execute)?;
        let Hub { ctx, store } = self;
        let ctx = &*ctx;

        let mut sequencer = Sequencer::new(&ctx.log, Section::Execute);
        sequencer.new_step(StepName::UpgradeCoordinator, || {
            ctx.run_pg_upgrade(Upgrade::Coordinator, false)
        });
        sequencer.new_step(StepName::CopyCoordinator, || ctx.copy_coordinator());
        sequencer.new_step(StepName::UpgradePrimaries, || {
            ctx.run_pg_upgrade(Upgrade::Primaries, false)
        });
        sequencer.execute(store).await
    }

    /// Swaps the upgraded data directories into place and shuts the agents
    /// down.
    pub async fn finalize(&mut self) -> Result<SectionReport, SequencerError> {
        check_section(&self.store, Section::Finalize)?;
        let Hub { ctx, store } = self;
        let ctx = &*ctx;

        let mut sequencer = Sequencer::new(&ctx.log, Section::Finalize);
        sequencer.new_step(StepName::RenameDataDirectories, || {
            ctx.rename_data_directories()
        });
        sequencer.new_step(StepName::DeleteSourceTablespaces, || {
            ctx.delete_source_tablespaces()
        });
        sequencer.new_step(StepName::ArchiveLogDirectories, || {
            ctx.archive_log_directories()
        });
        sequencer.new_step(StepName::DeleteStateDirectories, || {
            ctx.delete_state_directories()
        });
        sequencer.new_step(StepName::StopAgents, || ctx.stop_agents());
        sequencer.execute(store).await
    }

    /// Removes everything the upgrade created and restores the source
    /// cluster.
    pub async fn revert(&mut self) -> Result<SectionReport, SequencerError> {
        check_section(&self.store, Section::Revert)?;
        let Hub { ctx, store } = self;
        let ctx = &*ctx;

        let mut sequencer = Sequencer::new(&ctx.log, Section::Revert);
        sequencer.new_step(StepName::DeleteTargetDataDirectories, || {
            ctx.delete_target_data_directories()
        });
        sequencer.new_step(StepName::DeleteTargetTablespaces, || {
            ctx.delete_target_tablespaces()
        });
        sequencer.new_step(StepName::RestoreSourceControlFiles, || {
            ctx.restore_source_control_files()
        });
        sequencer.new_step(StepName::ArchiveLogDirectories, || {
            ctx.archive_log_directories()
        });
        sequencer.new_step(StepName::DeleteStateDirectories, || {
            ctx.delete_state_directories()
        });
        sequencer.new_step(StepName::StopAgents, || ctx.stop_agents());
        sequencer.execute(store).await
    }
}

/// Refuses to start `section` when what it depends on has not happened, or
/// when another section has made it impossible.
pub fn check_section(
    store: &StepStore,
    section: Section,
) -> Result<(), SequencerError> {
    let refuse =
        |reason: &str| Err(SequencerError::Refused { section, reason: reason.to_string() });

    match section {
        Section::Initialize => Ok(()),
        Section::Execute => {
            if !store.all_complete(Section::Initialize) {
                return refuse("initialize has not completed");
            }
            Ok(())
        }
        Section::Finalize => {
            if store.any_complete(Section::Revert) {
                return refuse("the upgrade is being reverted");
            }
            if !store.all_complete(Section::Execute) {
                return refuse("execute has not completed");
            }
            Ok(())
        }
        Section::Revert => {
            // A rename that failed or was interrupted may already have
            // swapped some hosts.
            if store.status(Section::Finalize, StepName::RenameDataDirectories)
                != StepStatus::Pending
            {
                return refuse(
                    "finalize has started swapping the upgraded data \
                     directories into place",
                );
            }
            Ok(())
        }
    }
}

/// Which segments a pg_upgrade step runs against.
#[derive(Clone, Copy, Debug)]
enum Upgrade {
    Coordinator,
    Primaries,
}

impl HubContext {
    async fn layout(&self) -> anyhow::Result<TargetLayout> {
        self.state
            .lock()
            .await
            .layout()
            .cloned()
            .ok_or_else(|| anyhow!("the target layout has not been generated"))
    }

    fn pair(
        &self,
        layout: &TargetLayout,
        segment: &Segment,
    ) -> anyhow::Result<DataDirPair> {
        layout.pair(segment).ok_or_else(|| {
            anyhow!("the target layout has no segment with dbid {}", segment.dbid)
        })
    }

    /// Waits for the agent on every host to answer.
    ///
    /// Idempotent: only reads.
    async fn check_agents(&self) -> anyhow::Result<()> {
        let timeout = self.config.agent_startup_timeout();
        let log = &self.log;
        let statuses = self
            .agents
            .dispatch_all(move |client| {
                retry_notify(
                    agent_startup_policy(timeout),
                    move || async move {
                        client.status().await.map_err(|err| {
                            if err.is_communication() {
                                BackoffError::transient(err)
                            } else {
                                BackoffError::permanent(err)
                            }
                        })
                    },
                    move |err: ClientError, delay: Duration| {
                        warn!(
                            log,
                            "agent not yet reachable";
                            "url" => client.baseurl(),
                            "error" => %err,
                            "retry_after" => ?delay,
                        );
                    },
                )
            })
            .await
            .context("agents are not reachable")?;

        for (host, status) in statuses {
            info!(
                self.log,
                "agent is up";
                "host" => host,
                "hostname" => status.hostname,
                "state_dir" => %status.state_dir,
            );
        }
        Ok(())
    }

    /// Decides the target data directory and port of every upgraded
    /// segment.
    ///
    /// Idempotent: a layout already recorded is kept.
    async fn generate_target_layout(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if let Some(layout) = state.layout() {
            info!(
                self.log,
                "target layout already generated";
                "segments" => layout.segments.len(),
            );
            return Ok(());
        }

        let layout = TargetLayout::generate(
            &self.cluster,
            state.id(),
            self.config.temp_port_range,
            self.config.source_coordinator_port,
        )?;
        for target in &layout.segments {
            info!(
                self.log,
                "target segment";
                "dbid" => target.dbid,
                "host" => &target.host,
                "data_dir" => %target.data_dir,
                "port" => target.port,
            );
        }
        state.update(|s| s.layout = Some(layout)).await?;
        Ok(())
    }

    /// Checks that the filesystem of every upgraded data directory has the
    /// configured fraction free.
    ///
    /// Idempotent: only reads.
    async fn check_disk_space(&self) -> anyhow::Result<()> {
        let free_ratio = self.config.disk_free_ratio;
        let work = group_by_host(
            self.cluster
                .upgraded_segments()
                .map(|s| (s.host.as_str(), s.data_dir.clone())),
        );
        let responses = self
            .agents
            .dispatch(work, move |client, dirs| async move {
                client
                    .check_disk_space(&DiskSpaceRequest { free_ratio, dirs })
                    .await
            })
            .await
            .context("failed to check disk space")?;

        let mut errors = ErrorList::new();
        for (host, response) in &responses {
            for usage in response.insufficient() {
                errors.push(
                    host.clone(),
                    InsufficientDiskSpace {
                        dir: usage.dir.clone(),
                        available_bytes: usage.available_bytes,
                        required_bytes: usage.required_bytes,
                    },
                );
            }
        }
        errors.into_result().context("insufficient disk space")?;
        Ok(())
    }

    /// Checks that every user-defined tablespace of a legacy source cluster
    /// has the layout pg_upgrade expects.
    ///
    /// Idempotent: only reads.
    async fn verify_source_tablespaces(&self) -> anyhow::Result<()> {
        if self.config.source.major_version != LEGACY_TABLESPACE_MAJOR_VERSION
        {
            info!(self.log, "source tablespaces do not use the legacy layout");
            return Ok(());
        }
        let work = group_by_host(self.cluster.upgraded_segments().flat_map(
            |s| {
                s.user_tablespaces()
                    .map(move |ts| (s.host.as_str(), ts.location.clone()))
            },
        ));
        if work.is_empty() {
            info!(self.log, "no user-defined tablespaces to verify");
            return Ok(());
        }

        self.agents
            .dispatch(work, |client, dirs| async move {
                client
                    .verify_source_tablespaces(&TablespaceDirectoriesRequest {
                        dirs,
                    })
                    .await
            })
            .await
            .context("source tablespaces are not valid")?;
        Ok(())
    }

    /// Runs pg_upgrade in check mode against the coordinator and then every
    /// primary.
    ///
    /// Idempotent: `--check` changes nothing.
    async fn check_upgrade(&self) -> anyhow::Result<()> {
        self.run_pg_upgrade(Upgrade::Coordinator, true).await?;
        self.run_pg_upgrade(Upgrade::Primaries, true).await
    }

    /// Runs pg_upgrade for `which` segments on their hosts.
    ///
    /// pg_upgrade recreates the target's catalog on every run, so a failed
    /// or interrupted upgrade can be run again.
    async fn run_pg_upgrade(
        &self,
        which: Upgrade,
        check_only: bool,
    ) -> anyhow::Result<()> {
        let layout = self.layout().await?;
        let segments: Vec<&Segment> = match which {
            Upgrade::Coordinator => vec![self.cluster.coordinator()],
            Upgrade::Primaries => self.cluster.primaries().collect(),
        };
        let pairs = segments
            .into_iter()
            .map(|s| Ok((s.host.as_str(), self.pair(&layout, s)?)))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let work = group_by_host(pairs);

        let source_bin_dir = self.config.source.bin_dir.clone();
        let target_bin_dir = self.config.target.bin_dir.clone();
        let mode = self.config.mode;
        let coordinator = matches!(which, Upgrade::Coordinator);
        self.agents
            .dispatch(work, move |client, data_dir_pairs| {
                let request = UpgradePrimariesRequest {
                    source_bin_dir: source_bin_dir.clone(),
                    target_bin_dir: target_bin_dir.clone(),
                    mode,
                    check_only,
                    coordinator,
                    data_dir_pairs,
                };
                async move { client.upgrade_primaries(&request).await }
            })
            .await
            .with_context(|| {
                format!(
                    "pg_upgrade{} failed for {which:?}",
                    if check_only { " --check" } else { "" }
                )
            })?;
        Ok(())
    }

    /// Copies the upgraded coordinator's data directory over each target
    /// primary, keeping each primary's own configuration.
    ///
    /// Idempotent: rsync converges on the same result.
    async fn copy_coordinator(&self) -> anyhow::Result<()> {
        let layout = self.layout().await?;
        let coordinator = self.cluster.coordinator();
        let source = self.pair(&layout, coordinator)?.target_data_dir;

        let pairs = self
            .cluster
            .primaries()
            .map(|primary| {
                let destination_host = if self.config.use_hba_hostnames {
                    primary.host.clone()
                } else {
                    primary.address.clone()
                };
                Ok(RsyncPair {
                    source: source.clone(),
                    destination_host,
                    destination: self.pair(&layout, primary)?.target_data_dir,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        if pairs.is_empty() {
            info!(self.log, "no primaries to copy the coordinator to");
            return Ok(());
        }

        let request = RsyncRequest {
            pairs,
            options: vec!["--delete".to_string()],
            excludes: COPY_COORDINATOR_EXCLUDES
                .iter()
                .map(|e| e.to_string())
                .collect(),
        };
        let work = BTreeMap::from([(coordinator.host.clone(), request)]);
        self.agents
            .dispatch(work, |client, request| async move {
                client.rsync(&request).await
            })
            .await
            .context("failed to copy the upgraded coordinator")?;
        Ok(())
    }

    /// Archives each source data directory and moves its upgraded
    /// counterpart into its place.
    ///
    /// Idempotent: see `archive_and_swap` on the agent.
    async fn rename_data_directories(&self) -> anyhow::Result<()> {
        let layout = self.layout().await?;
        let dirs = self
            .cluster
            .upgraded_segments()
            .map(|s| {
                let pair = self.pair(&layout, s)?;
                Ok((
                    s.host.as_str(),
                    RenameDirectories {
                        dbid: s.dbid,
                        content: s.content,
                        source: pair.target_data_dir,
                        target: pair.source_data_dir,
                        rename_target: true,
                    },
                ))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        self.agents
            .dispatch(group_by_host(dirs), |client, dirs| async move {
                client
                    .rename_directories(&RenameDirectoriesRequest { dirs })
                    .await
            })
            .await
            .context("failed to rename data directories")?;
        Ok(())
    }

    /// Removes the legacy tablespace directories of mirrors and the standby.
    /// Those segments are not upgraded; they are rebuilt from the upgraded
    /// cluster, which leaves their source tablespaces unused.
    ///
    /// Idempotent: a location whose database directories are gone verifies
    /// and deletes nothing.
    async fn delete_source_tablespaces(&self) -> anyhow::Result<()> {
        if self.config.source.major_version != LEGACY_TABLESPACE_MAJOR_VERSION
        {
            info!(self.log, "source tablespaces do not use the legacy layout");
            return Ok(());
        }
        let work = group_by_host(
            self.cluster
                .segments()
                .iter()
                .filter(|s| !s.is_upgraded())
                .flat_map(|s| {
                    s.user_tablespaces()
                        .map(move |ts| (s.host.as_str(), ts.location.clone()))
                }),
        );
        if work.is_empty() {
            info!(self.log, "no mirror or standby tablespaces to delete");
            return Ok(());
        }

        self.agents
            .dispatch(work, |client, dirs| async move {
                client
                    .delete_source_tablespaces(&TablespaceDirectoriesRequest {
                        dirs,
                    })
                    .await
            })
            .await
            .context("failed to delete mirror and standby tablespaces")?;
        Ok(())
    }

    /// Returns the name log directories are archived under, choosing and
    /// recording it the first time.
    async fn log_archive_name(&self) -> anyhow::Result<String> {
        let mut state = self.state.lock().await;
        if let Some(name) = &state.get().log_archive_name {
            return Ok(name.clone());
        }
        let name = archive_directory_name(state.id(), &Local::now());
        state.update(|s| s.log_archive_name = Some(name.clone())).await?;
        Ok(name)
    }

    /// Moves each agent's log directory aside under a name identifying
    /// this upgrade.
    ///
    /// Idempotent: the archive name is fixed for the upgrade, and an agent
    /// whose logs are already archived does nothing.
    async fn archive_log_directories(&self) -> anyhow::Result<()> {
        let archive_name = self.log_archive_name().await?;
        let archives = self
            .agents
            .dispatch_all(|client| {
                let request = ArchiveLogDirectoryRequest {
                    archive_name: archive_name.clone(),
                };
                async move { client.archive_log_directory(&request).await }
            })
            .await
            .context("failed to archive log directories")?;

        for (host, archive) in archives {
            info!(
                self.log,
                "archived logs";
                "host" => host,
                "archive_dir" => %archive.archive_dir,
            );
        }
        Ok(())
    }

    /// Idempotent: an absent state directory is already deleted.
    async fn delete_state_directories(&self) -> anyhow::Result<()> {
        self.agents
            .dispatch_all(|client| client.delete_state_directory())
            .await
            .context("failed to delete agent state directories")?;
        Ok(())
    }

    /// Asks every agent to exit.
    ///
    /// Idempotent: an agent that cannot be reached is assumed to have
    /// stopped already.
    async fn stop_agents(&self) -> anyhow::Result<()> {
        let log = &self.log;
        self.agents
            .dispatch_all(|client| async move {
                match client.stop().await {
                    Err(err) if err.is_communication() => {
                        info!(
                            log,
                            "agent is not running";
                            "url" => client.baseurl(),
                        );
                        Ok(())
                    }
                    result => result,
                }
            })
            .await
            .context("failed to stop agents")?;
        Ok(())
    }

    /// Deletes the target data directories the upgrade created.
    ///
    /// Idempotent: absent directories are already deleted.
    async fn delete_target_data_directories(&self) -> anyhow::Result<()> {
        let Some(layout) = self.state.lock().await.layout().cloned() else {
            info!(self.log, "no target layout; nothing to delete");
            return Ok(());
        };
        let work = group_by_host(
            layout.segments.iter().map(|t| (t.host.as_str(), t.data_dir.clone())),
        );

        self.agents
            .dispatch(work, |client, data_dirs| async move {
                client
                    .delete_data_directories(&DeleteDirectoriesRequest {
                        data_dirs,
                    })
                    .await
            })
            .await
            .context("failed to delete target data directories")?;
        Ok(())
    }

    /// Deletes the target cluster's directories inside every user-defined
    /// tablespace.
    ///
    /// Idempotent: absent directories are already deleted.
    async fn delete_target_tablespaces(&self) -> anyhow::Result<()> {
        let target = &self.config.target;
        let work = group_by_host(self.cluster.upgraded_segments().flat_map(
            |s| {
                s.user_tablespaces().map(move |ts| {
                    (
                        s.host.as_str(),
                        tablespace_path(
                            &ts.location,
                            s.dbid,
                            target.major_version,
                            &target.catalog_version,
                        ),
                    )
                })
            },
        ));
        if work.is_empty() {
            info!(self.log, "no user-defined tablespaces to delete");
            return Ok(());
        }

        self.agents
            .dispatch(work, |client, dirs| async move {
                client
                    .delete_target_tablespaces(&TablespaceDirectoriesRequest {
                        dirs,
                    })
                    .await
            })
            .await
            .context("failed to delete target tablespaces")?;
        Ok(())
    }

    /// Puts back the control files pg_upgrade disabled in the source data
    /// directories when upgrading in link mode.
    ///
    /// Idempotent: see `restore_control_file` on the agent.
    async fn restore_source_control_files(&self) -> anyhow::Result<()> {
        if self.config.mode != UpgradeMode::Link {
            info!(self.log, "copy mode leaves source control files in place");
            return Ok(());
        }

        let work = group_by_host(
            self.cluster
                .upgraded_segments()
                .map(|s| (s.host.as_str(), s.data_dir.clone())),
        );
        self.agents
            .dispatch(work, |client, data_dirs| async move {
                client
                    .restore_control_files(&RestoreControlFilesRequest {
                        data_dirs,
                    })
                    .await
            })
            .await
            .context("failed to restore source control files")?;
        Ok(())
    }
}

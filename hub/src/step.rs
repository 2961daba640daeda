// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resumable, ordered execution of upgrade steps
//!
//! Every step of a [`Section`] moves through
//! `pending -> running -> complete | failed`, and each transition is durably
//! recorded in a [`StepStore`] before the sequencer moves on. Running a
//! section again skips the steps already complete and re-runs everything
//! else from the beginning, including a step left `running` by a crash.
//! A failed step halts the section; nothing is rolled back.

use camino::Utf8Path;
use futures::future::{FutureExt, LocalBoxFuture};
use serde::{Deserialize, Serialize};
use slog::{error, info, warn, Logger};
use std::fmt;
use std::future::Future;
use upgrade_common::ledger::{self, Ledger, Ledgerable};

pub const STATUS_LEDGER: &str = "status.json";

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Initialize,
    Execute,
    Finalize,
    Revert,
}

impl Section {
    pub const ALL: [Section; 4] =
        [Section::Initialize, Section::Execute, Section::Finalize, Section::Revert];

    /// The steps of this section, in the order they run.
    pub fn steps(&self) -> &'static [StepName] {
        use StepName::*;
        match self {
            Section::Initialize => &[
                CheckAgents,
                GenerateTargetLayout,
                CheckDiskSpace,
                VerifySourceTablespaces,
                CheckUpgrade,
            ],
            Section::Execute => {
                &[UpgradeCoordinator, CopyCoordinator, UpgradePrimaries]
            }
            Section::Finalize => &[
                RenameDataDirectories,
                DeleteSourceTablespaces,
                ArchiveLogDirectories,
                DeleteStateDirectories,
                StopAgents,
            ],
            Section::Revert => &[
                DeleteTargetDataDirectories,
                DeleteTargetTablespaces,
                RestoreSourceControlFiles,
                ArchiveLogDirectories,
                DeleteStateDirectories,
                StopAgents,
            ],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Initialize => "initialize",
            Section::Execute => "execute",
            Section::Finalize => "finalize",
            Section::Revert => "revert",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    CheckAgents,
    GenerateTargetLayout,
    CheckDiskSpace,
    VerifySourceTablespaces,
    CheckUpgrade,
    UpgradeCoordinator,
    CopyCoordinator,
    UpgradePrimaries,
    RenameDataDirectories,
    DeleteSourceTablespaces,
    ArchiveLogDirectories,
    DeleteStateDirectories,
    StopAgents,
    DeleteTargetDataDirectories,
    DeleteTargetTablespaces,
    RestoreSourceControlFiles,
}

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::CheckAgents => "check_agents",
            StepName::GenerateTargetLayout => "generate_target_layout",
            StepName::CheckDiskSpace => "check_disk_space",
            StepName::VerifySourceTablespaces => "verify_source_tablespaces",
            StepName::CheckUpgrade => "check_upgrade",
            StepName::UpgradeCoordinator => "upgrade_coordinator",
            StepName::CopyCoordinator => "copy_coordinator",
            StepName::UpgradePrimaries => "upgrade_primaries",
            StepName::RenameDataDirectories => "rename_data_directories",
            StepName::DeleteSourceTablespaces => "delete_source_tablespaces",
            StepName::ArchiveLogDirectories => "archive_log_directories",
            StepName::DeleteStateDirectories => "delete_state_directories",
            StepName::StopAgents => "stop_agents",
            StepName::DeleteTargetDataDirectories => {
                "delete_target_data_directories"
            }
            StepName::DeleteTargetTablespaces => "delete_target_tablespaces",
            StepName::RestoreSourceControlFiles => {
                "restore_source_control_files"
            }
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Complete => "complete",
            StepStatus::Failed => "failed",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct StepRecord {
    pub section: Section,
    pub step: StepName,
    pub status: StepStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StepRecords {
    pub generation: u64,
    pub records: Vec<StepRecord>,
}

impl Ledgerable for StepRecords {
    fn is_newer_than(&self, other: &Self) -> bool {
        self.generation > other.generation
    }

    fn generation_bump(&mut self) {
        self.generation += 1;
    }
}

/// Durable status of every step the hub has started.
///
/// A step with no record is [`StepStatus::Pending`].
pub struct StepStore {
    ledger: Ledger<StepRecords>,
}

impl StepStore {
    /// Loads the step status recorded in `state_dir`. No record at all
    /// means no step has started; an unreadable record is an error.
    pub async fn load(
        log: &Logger,
        state_dir: &Utf8Path,
    ) -> Result<Self, ledger::Error> {
        let paths = vec![state_dir.join(STATUS_LEDGER)];
        let ledger = match Ledger::new(log, paths.clone()).await? {
            Some(ledger) => ledger,
            None => Ledger::new_with(log, paths, StepRecords::default()),
        };
        Ok(StepStore { ledger })
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.ledger.data().records
    }

    pub fn status(&self, section: Section, step: StepName) -> StepStatus {
        self.records()
            .iter()
            .find(|r| r.section == section && r.step == step)
            .map(|r| r.status)
            .unwrap_or(StepStatus::Pending)
    }

    pub fn is_complete(&self, section: Section, step: StepName) -> bool {
        self.status(section, step) == StepStatus::Complete
    }

    /// Returns true if every step of `section` has completed.
    pub fn all_complete(&self, section: Section) -> bool {
        section.steps().iter().all(|step| self.is_complete(section, *step))
    }

    /// Returns true if any step of `section` has completed.
    pub fn any_complete(&self, section: Section) -> bool {
        section.steps().iter().any(|step| self.is_complete(section, *step))
    }

    /// Records `status` for a step and durably commits it.
    pub async fn set(
        &mut self,
        section: Section,
        step: StepName,
        status: StepStatus,
    ) -> Result<(), ledger::Error> {
        let records = &mut self.ledger.data_mut().records;
        match records.iter_mut().find(|r| r.section == section && r.step == step)
        {
            Some(record) => record.status = status,
            None => records.push(StepRecord { section, step, status }),
        }
        self.ledger.commit().await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SequencerError {
    #[error("{section} step {step} failed")]
    StepFailed {
        section: Section,
        step: StepName,
        #[source]
        err: anyhow::Error,
    },

    #[error("failed to record status of {section} step {step}")]
    Persist {
        section: Section,
        step: StepName,
        #[source]
        err: ledger::Error,
    },

    #[error("cannot run {section}: {reason}")]
    Refused { section: Section, reason: String },
}

/// What a successful run of a section did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SectionReport {
    /// Steps that ran in this invocation.
    pub ran: Vec<StepName>,
    /// Steps skipped because an earlier invocation completed them.
    pub skipped: Vec<StepName>,
}

type StepFn<'a> = Box<dyn FnOnce() -> LocalBoxFuture<'a, anyhow::Result<()>> + 'a>;

/// Runs the registered steps of one section, in order.
pub struct Sequencer<'a> {
    log: Logger,
    section: Section,
    steps: Vec<(StepName, StepFn<'a>)>,
}

impl<'a> Sequencer<'a> {
    pub fn new(log: &Logger, section: Section) -> Self {
        Sequencer {
            log: log.new(slog::o!("section" => section.as_str())),
            section,
            steps: Vec::new(),
        }
    }

    /// Adds a step to run after every step added before it.
    ///
    /// `step_fn` must be safe to run again from the beginning: it runs again
    /// whenever a previous attempt did not complete.
    pub fn new_step<F, Fut>(&mut self, step: StepName, step_fn: F)
    where
        F: FnOnce() -> Fut + 'a,
        Fut: Future<Output = anyhow::Result<()>> + 'a,
    {
        debug_assert!(
            self.section.steps().contains(&step),
            "{step} is not a step of {}",
            self.section,
        );
        self.steps.push((step, Box::new(move || step_fn().boxed_local())));
    }

    /// Runs every step that has not already completed, recording each
    /// transition in `store`. Stops at the first failure.
    pub async fn execute(
        self,
        store: &mut StepStore,
    ) -> Result<SectionReport, SequencerError> {
        let section = self.section;
        let mut report = SectionReport::default();

        for (step, step_fn) in self.steps {
            let log = self.log.new(slog::o!("step" => step.as_str()));
            match store.status(section, step) {
                StepStatus::Complete => {
                    info!(log, "skipping completed step");
                    report.skipped.push(step);
                    continue;
                }
                StepStatus::Running => {
                    warn!(log, "step was interrupted; running it again");
                }
                StepStatus::Failed => {
                    info!(log, "retrying failed step");
                }
                StepStatus::Pending => {}
            }

            store
                .set(section, step, StepStatus::Running)
                .await
                .map_err(|err| SequencerError::Persist { section, step, err })?;

            info!(log, "running step");
            match step_fn().await {
                Ok(()) => {
                    store
                        .set(section, step, StepStatus::Complete)
                        .await
                        .map_err(|err| SequencerError::Persist {
                            section,
                            step,
                            err,
                        })?;
                    info!(log, "step complete");
                    report.ran.push(step);
                }
                Err(err) => {
                    error!(log, "step failed"; "error" => format!("{err:#}"));
                    // The step is re-run either way: a record left at
                    // `running` is treated like `failed`.
                    if let Err(persist_err) =
                        store.set(section, step, StepStatus::Failed).await
                    {
                        warn!(
                            log,
                            "failed to record step failure";
                            "error" => %persist_err,
                        );
                    }
                    return Err(SequencerError::StepFailed { section, step, err });
                }
            }
        }

        Ok(report)
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable program to run the upgrade hub

use anyhow::{anyhow, Context};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use slog::{Drain, Logger};
use upgrade_common::cmd::{fatal, CmdError};
use upgrade_common::FileKv;
use upgrade_hub::{Agents, Cluster, Config, Hub, Section, SectionReport};

#[derive(Debug, Parser)]
#[clap(
    name = "upgrade-hub",
    about = "Orchestrates an in-place major-version upgrade of a cluster"
)]
struct Args {
    #[clap(name = "CONFIG_FILE_PATH", action)]
    config_path: Utf8PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Checks the cluster and plans the upgrade.
    Initialize,
    /// Upgrades the coordinator and primaries into new data directories.
    Execute,
    /// Swaps the upgraded data directories into place.
    Finalize,
    /// Abandons the upgrade and restores the source cluster.
    Revert,
    /// Shows the progress of the upgrade.
    Status,
}

#[tokio::main]
async fn main() {
    if let Err(cmd_error) = do_run().await {
        fatal(cmd_error);
    }
}

async fn do_run() -> Result<(), CmdError> {
    let args = Args::try_parse()
        .map_err(|err| CmdError::Usage(format!("parsing arguments: {err}")))?;

    let config = Config::from_file(&args.config_path)
        .map_err(|e| CmdError::Failure(anyhow!(e)))?;
    let drain = config
        .log
        .to_logger("upgrade-hub")
        .context("initializing logger")
        .map_err(CmdError::Failure)?;
    let log = Logger::root(drain.fuse(), slog::o!(FileKv));

    let cluster = Cluster::from_file(&config.cluster_file)
        .map_err(|e| CmdError::Failure(anyhow!(e)))?;
    let agents = Agents::new(&log, cluster.hosts(), config.agent_port);
    let mut hub = Hub::open(&log, config, cluster, agents)
        .await
        .map_err(|e| CmdError::Failure(anyhow!(e)))?;

    let (section, result) = match args.command {
        Command::Initialize => (Section::Initialize, hub.initialize().await),
        Command::Execute => (Section::Execute, hub.execute().await),
        Command::Finalize => (Section::Finalize, hub.finalize().await),
        Command::Revert => (Section::Revert, hub.revert().await),
        Command::Status => {
            print_status(&hub).await;
            return Ok(());
        }
    };
    let report = result.map_err(|e| CmdError::Failure(anyhow!(e)))?;
    print_report(section, &report);
    Ok(())
}

fn print_report(section: Section, report: &SectionReport) {
    for step in &report.skipped {
        println!("{section}: {step} (already complete)");
    }
    for step in &report.ran {
        println!("{section}: {step} complete");
    }
    println!("{section} complete");
}

async fn print_status(hub: &Hub) {
    println!("upgrade id: {}", hub.id().await);
    for section in Section::ALL {
        println!("{section}:");
        for step in section.steps() {
            println!(
                "    {:<32} {}",
                step.as_str(),
                hub.steps().status(section, *step)
            );
        }
    }

    match hub.layout().await {
        Some(layout) => {
            println!("target layout:");
            for target in layout.segments {
                println!(
                    "    dbid {:<4} content {:<4} {}:{} {}",
                    target.dbid,
                    target.content,
                    target.host,
                    target.port,
                    target.data_dir
                );
            }
        }
        None => println!("target layout: not yet generated"),
    }
}

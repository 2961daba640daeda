// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable program to run the upgrade agent

use anyhow::anyhow;
use camino::Utf8PathBuf;
use clap::Parser;
use upgrade_agent::{run_until_stopped, start_server, Config};
use upgrade_common::cmd::{fatal, CmdError};

#[derive(Debug, Parser)]
#[clap(name = "upgrade-agent", about = "Per-host agent of an in-place upgrade")]
enum Args {
    /// Runs the agent until the hub asks it to stop.
    Run {
        #[clap(name = "CONFIG_FILE_PATH", action)]
        config_path: Utf8PathBuf,
    },
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

    match args {
        Args::Run { config_path } => {
            let config = Config::from_file(&config_path)
                .map_err(|e| CmdError::Failure(anyhow!(e)))?;
            let server = start_server(config)
                .await
                .map_err(|e| CmdError::Failure(anyhow!(e)))?;
            run_until_stopped(server)
                .await
                .map_err(|e| CmdError::Failure(anyhow!(e)))
        }
    }
}

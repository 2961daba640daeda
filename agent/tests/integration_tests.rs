// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests that drive a running agent through its HTTP client

use camino::Utf8PathBuf;
use camino_tempfile::Utf8TempDir;
use dropshot::{ConfigDropshot, ConfigLogging, ConfigLoggingLevel};
use std::collections::BTreeMap;
use std::sync::Arc;
use upgrade_agent::fs::HostFileSystem;
use upgrade_agent::runner::FakeCommandRunner;
use upgrade_agent::{
    run_until_stopped, start_server_with, Config, ServerContext, STATE_MARKER,
};
use upgrade_agent_client::{
    Client, DataDirPair, DeleteDirectoriesRequest, RenameDirectories,
    RenameDirectoriesRequest, UpgradeMode, UpgradePrimariesRequest,
};
use upgrade_test_utils::dev::fixtures::{create_tagged_data_dir, read_tag};
use upgrade_test_utils::dev::{test_setup_log, LogContext};

struct TestAgent {
    logctx: LogContext,
    root: Utf8TempDir,
    state_dir: Utf8PathBuf,
    runner: Arc<FakeCommandRunner>,
    server: dropshot::HttpServer<Arc<ServerContext>>,
    client: Client,
}

impl TestAgent {
    fn start(test_name: &str) -> TestAgent {
        let logctx = test_setup_log(test_name);
        let root = Utf8TempDir::new().unwrap();
        let state_dir = root.path().join("state");
        let config = Config {
            dropshot: ConfigDropshot {
                bind_address: "127.0.0.1:0".parse().unwrap(),
                ..Default::default()
            },
            log: ConfigLogging::StderrTerminal {
                level: ConfigLoggingLevel::Info,
            },
            state_dir: state_dir.clone(),
            log_dir: root.path().join("logs"),
        };
        let runner = FakeCommandRunner::new(&logctx.log);
        let server = start_server_with(
            &logctx.log,
            config,
            HostFileSystem::new(),
            runner.clone().as_runner(),
        )
        .unwrap();
        let client = Client::new(
            &format!("http://{}", server.local_addr()),
            logctx.log.clone(),
        );
        TestAgent { logctx, root, state_dir, runner, server, client }
    }

    async fn teardown(self) {
        self.server.close().await.unwrap();
        self.logctx.cleanup_successful();
    }
}

#[tokio::test]
async fn test_status_reports_state_directory() {
    let agent = TestAgent::start("test_status_reports_state_directory");

    let status = agent.client.status().await.unwrap();
    assert_eq!(status.state_dir, agent.state_dir);
    assert!(!status.hostname.is_empty());
    assert!(agent.state_dir.join(STATE_MARKER).is_file());

    agent.teardown().await;
}

#[tokio::test]
async fn test_rename_directories_swaps_data_directories() {
    let agent =
        TestAgent::start("test_rename_directories_swaps_data_directories");
    let root = agent.root.path();
    let source = create_tagged_data_dir(&root.join("seg.ABC.0"), "new");
    let target = create_tagged_data_dir(&root.join("seg0"), "old");

    let request = RenameDirectoriesRequest {
        dirs: vec![RenameDirectories {
            dbid: 2,
            content: 0,
            source: source.clone(),
            target: target.clone(),
            rename_target: true,
        }],
    };
    agent.client.rename_directories(&request).await.unwrap();
    assert_eq!(read_tag(&target), "new");
    assert_eq!(read_tag(&root.join("seg0.old")), "old");
    assert!(!source.exists());

    // A second attempt finds the archive and leaves everything alone.
    agent.client.rename_directories(&request).await.unwrap();
    assert_eq!(read_tag(&target), "new");
    assert_eq!(read_tag(&root.join("seg0.old")), "old");

    agent.teardown().await;
}

#[tokio::test]
async fn test_delete_rejects_non_data_directories() {
    let agent = TestAgent::start("test_delete_rejects_non_data_directories");
    let not_data = agent.root.path().join("home");
    std::fs::create_dir_all(&not_data).unwrap();

    let err = agent
        .client
        .delete_data_directories(&DeleteDirectoriesRequest {
            data_dirs: vec![not_data.clone()],
        })
        .await
        .unwrap_err();
    assert_eq!(err.status().map(|s| s.as_u16()), Some(400));
    assert!(not_data.is_dir());

    let data = create_tagged_data_dir(&agent.root.path().join("seg1"), "x");
    agent
        .client
        .delete_data_directories(&DeleteDirectoriesRequest {
            data_dirs: vec![data.clone()],
        })
        .await
        .unwrap();
    assert!(!data.exists());

    agent.teardown().await;
}

#[tokio::test]
async fn test_upgrade_primaries_runs_pg_upgrade_per_segment() {
    let agent =
        TestAgent::start("test_upgrade_primaries_runs_pg_upgrade_per_segment");

    let pairs = (0..2)
        .map(|content| DataDirPair {
            source_data_dir: format!("/data/seg{content}").into(),
            target_data_dir: format!("/data/seg.ABC.{content}").into(),
            source_port: 25432,
            target_port: 50432,
            content,
            dbid: content + 2,
            tablespaces: BTreeMap::new(),
        })
        .collect();
    agent
        .client
        .upgrade_primaries(&UpgradePrimariesRequest {
            source_bin_dir: "/old/bin".into(),
            target_bin_dir: "/new/bin".into(),
            mode: UpgradeMode::Link,
            check_only: false,
            coordinator: false,
            data_dir_pairs: pairs,
        })
        .await
        .unwrap();

    let commands = agent.runner.commands();
    assert_eq!(commands.len(), 2);
    assert!(commands
        .iter()
        .all(|c| c.program.as_str() == "/new/bin/pg_upgrade"));

    agent.teardown().await;
}

#[tokio::test]
async fn test_stop_shuts_down_server() {
    let agent = TestAgent::start("test_stop_shuts_down_server");

    agent.client.stop().await.unwrap();
    run_until_stopped(agent.server).await.unwrap();
    assert!(agent.client.status().await.unwrap_err().is_communication());

    agent.logctx.cleanup_successful();
}

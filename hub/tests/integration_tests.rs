// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests that run whole sections of an upgrade against agents running
//! in-process, one per simulated host

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use dropshot::{ConfigDropshot, ConfigLogging, ConfigLoggingLevel, HttpServer};
use std::collections::BTreeMap;
use std::sync::Arc;
use upgrade_agent::fs::HostFileSystem;
use upgrade_agent::runner::{
    CommandError, CommandOutput, CommandSpec, FakeCommandRunner,
};
use upgrade_agent::ServerContext;
use upgrade_agent_client::UpgradeMode;
use upgrade_hub::cluster::{Role, Segment, SegmentTablespace};
use upgrade_hub::config::{Installation, PortRange};
use upgrade_hub::{
    Agents, Cluster, Config, Hub, Section, SequencerError, StepName,
    StepStatus,
};
use upgrade_test_utils::dev::fixtures::{
    create_legacy_tablespace, create_tagged_data_dir, create_target_tablespace,
    read_tag, write_file,
};
use upgrade_test_utils::dev::{test_setup_log, LogContext};

const HOSTS: [&str; 3] = ["cdw", "sdw1", "sdw2"];

struct TestAgent {
    state_dir: Utf8PathBuf,
    log_dir: Utf8PathBuf,
    server: HttpServer<Arc<ServerContext>>,
}

struct TestCluster {
    logctx: LogContext,
    root: Utf8TempDir,
    runner: Arc<FakeCommandRunner>,
    agents: BTreeMap<String, TestAgent>,
    cluster: Cluster,
}

fn arg_value<'a>(cmd: &'a CommandSpec, flag: &str) -> Option<&'a str> {
    let pos = cmd.args.iter().position(|a| a == flag)?;
    cmd.args.get(pos + 1).map(|s| s.as_str())
}

fn is_check(cmd: &CommandSpec) -> bool {
    cmd.args.iter().any(|a| a == "--check")
}

/// Stands in for pg_upgrade: an upgrade leaves a data directory behind,
/// along with the upgraded copy of each user-defined tablespace.
fn fake_pg_upgrade(
    cmd: &CommandSpec,
) -> Result<CommandOutput, CommandError> {
    if cmd.program.file_name() != Some("pg_upgrade") || is_check(cmd) {
        return Ok(CommandOutput::default());
    }
    if let Some(dir) = arg_value(cmd, "--new-datadir") {
        create_tagged_data_dir(Utf8Path::new(dir), "upgraded");
    }
    if let Some(list) = arg_value(cmd, "--old-tablespaces-file") {
        let dbid: i32 =
            arg_value(cmd, "--new-gp-dbid").unwrap().parse().unwrap();
        let list = std::fs::read_to_string(list).unwrap();
        for line in list.lines() {
            let fields: Vec<&str> = line.split(',').collect();
            if fields[4] == "1" {
                create_target_tablespace(
                    Utf8Path::new(fields[3]),
                    dbid,
                    6,
                    "306",
                );
            }
        }
    }
    Ok(CommandOutput::default())
}

fn pg_upgrade_failure(cmd: &CommandSpec) -> CommandError {
    CommandError::Failed {
        command: cmd.to_string(),
        status: "exit status: 1".to_string(),
        stdout: String::new(),
        stderr: "catalog mismatch".to_string(),
    }
}

fn segment(
    root: &Utf8Path,
    host: &str,
    dbid: i32,
    content: i32,
    role: Role,
) -> Segment {
    let kind = if role == Role::Mirror { "mirror" } else { "data" };
    Segment {
        host: host.to_string(),
        address: "127.0.0.1".to_string(),
        content,
        dbid,
        role,
        port: 15432 + dbid as u16,
        data_dir: root.join(host).join(kind).join(format!("gpseg{content}")),
        tablespaces: vec![],
    }
}

const DB_OID: u32 = 16384;

fn tablespace_location(root: &Utf8Path, s: &Segment) -> Utf8PathBuf {
    root.join(&s.host).join("fast").join(format!("gpseg{}", s.dbid))
}

impl TestCluster {
    fn start(test_name: &str) -> TestCluster {
        let logctx = test_setup_log(test_name);
        let root = Utf8TempDir::new().unwrap();
        let runner = FakeCommandRunner::new(&logctx.log);
        runner.set_handler(Box::new(fake_pg_upgrade));

        let mut agents = BTreeMap::new();
        for host in HOSTS {
            let state_dir = root.path().join(host).join("state");
            let log_dir = root.path().join(host).join("logs");
            write_file(&log_dir.join("agent.log"), "started");
            let config = upgrade_agent::Config {
                dropshot: ConfigDropshot {
                    bind_address: "127.0.0.1:0".parse().unwrap(),
                    ..Default::default()
                },
                log: ConfigLogging::StderrTerminal {
                    level: ConfigLoggingLevel::Info,
                },
                state_dir: state_dir.clone(),
                log_dir: log_dir.clone(),
            };
            let server = upgrade_agent::start_server_with(
                &logctx.log.new(slog::o!("host" => host)),
                config,
                HostFileSystem::new(),
                runner.clone().as_runner(),
            )
            .unwrap();
            agents.insert(
                host.to_string(),
                TestAgent { state_dir, log_dir, server },
            );
        }

        let segments = vec![
            segment(root.path(), "cdw", 1, -1, Role::Coordinator),
            segment(root.path(), "sdw1", 2, 0, Role::Primary),
            segment(root.path(), "sdw2", 3, 1, Role::Primary),
            segment(root.path(), "sdw2", 4, 0, Role::Mirror),
            segment(root.path(), "sdw1", 5, 1, Role::Mirror),
        ];
        for s in &segments {
            create_tagged_data_dir(&s.data_dir, "source");
        }
        let cluster = Cluster::new(segments).unwrap();

        TestCluster { logctx, root, runner, agents, cluster }
    }

    /// Gives every segment a user-defined tablespace laid out the way a
    /// legacy source cluster leaves it, with one database directory.
    fn with_tablespaces(mut self) -> TestCluster {
        let mut segments = self.cluster.segments().to_vec();
        for s in &mut segments {
            let location = tablespace_location(self.root.path(), s);
            create_legacy_tablespace(&location, &[DB_OID]);
            s.tablespaces.push(SegmentTablespace {
                oid: 16386,
                name: "fast".to_string(),
                location,
                user_defined: true,
            });
        }
        self.cluster = Cluster::new(segments).unwrap();
        self
    }

    fn config(&self, mode: UpgradeMode) -> Config {
        let installation = |version: u32| Installation {
            bin_dir: format!("/usr/local/gpdb{version}/bin").into(),
            major_version: version,
            catalog_version: format!("30{version}"),
        };
        Config {
            log: ConfigLogging::StderrTerminal {
                level: ConfigLoggingLevel::Info,
            },
            state_dir: self.root.path().join("hub"),
            cluster_file: self.root.path().join("cluster.toml"),
            source: installation(5),
            target: installation(6),
            mode,
            disk_free_ratio: 0.0,
            use_hba_hostnames: true,
            source_coordinator_port: 15433,
            temp_port_range: PortRange::default(),
            agent_port: upgrade_common::AGENT_PORT,
            agent_startup_timeout_secs: 5,
        }
    }

    async fn hub(&self, mode: UpgradeMode) -> Hub {
        let urls = self.agents.iter().map(|(host, agent)| {
            (host.clone(), format!("http://{}", agent.server.local_addr()))
        });
        let agents = Agents::with_urls(&self.logctx.log, urls);
        Hub::open(&self.logctx.log, self.config(mode), self.cluster.clone(), agents)
            .await
            .unwrap()
    }

    fn upgraded(&self) -> impl Iterator<Item = &Segment> {
        self.cluster.upgraded_segments()
    }

    /// Waits for every agent to act on a stop request.
    async fn wait_for_stop(self) {
        for (_, agent) in self.agents {
            upgrade_agent::run_until_stopped(agent.server).await.unwrap();
        }
        self.logctx.cleanup_successful();
    }

    async fn teardown(self) {
        for (_, agent) in self.agents {
            agent.server.close().await.unwrap();
        }
        self.logctx.cleanup_successful();
    }
}

#[tokio::test]
async fn test_upgrade_end_to_end() {
    let tc = TestCluster::start("test_upgrade_end_to_end");
    let mut hub = tc.hub(UpgradeMode::Copy).await;
    let id = hub.id().await;

    let report = hub.initialize().await.unwrap();
    assert_eq!(report.ran, Section::Initialize.steps().to_vec());
    let checks =
        tc.runner.commands().iter().filter(|c| is_check(c)).count();
    assert_eq!(checks, 3);

    let layout = hub.layout().await.unwrap();
    assert_eq!(layout.segments.len(), 3);

    hub.execute().await.unwrap();
    let rsyncs: Vec<_> = tc
        .runner
        .commands()
        .into_iter()
        .filter(|c| c.program.as_str() == "rsync")
        .collect();
    assert_eq!(rsyncs.len(), 2);
    assert!(rsyncs[0].args.contains(&"--exclude=pg_hba.conf".to_string()));
    for s in tc.upgraded() {
        let target = &layout.get(s.dbid).unwrap().data_dir;
        assert_eq!(read_tag(target), "upgraded");
    }

    hub.finalize().await.unwrap();
    for s in tc.upgraded() {
        assert_eq!(read_tag(&s.data_dir), "upgraded");
        assert_eq!(
            read_tag(&Utf8PathBuf::from(format!("{}.old", s.data_dir))),
            "source"
        );
        assert!(!layout.get(s.dbid).unwrap().data_dir.exists());
    }
    for s in tc.cluster.segments().iter().filter(|s| !s.is_upgraded()) {
        assert_eq!(read_tag(&s.data_dir), "source", "mirrors are untouched");
    }

    let prefix = format!("upgrade-{id}-");
    for (host, agent) in &tc.agents {
        assert!(!agent.state_dir.exists(), "{host} state dir remains");
        assert!(!agent.log_dir.exists(), "{host} logs were not archived");
        let archived = std::fs::read_dir(tc.root.path().join(host))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
            .count();
        assert_eq!(archived, 1, "{host} has no log archive");
    }
    assert!(hub.steps().all_complete(Section::Finalize));

    tc.wait_for_stop().await;
}

#[tokio::test]
async fn test_sections_refuse_out_of_order() {
    let tc = TestCluster::start("test_sections_refuse_out_of_order");
    let mut hub = tc.hub(UpgradeMode::Copy).await;

    let err = hub.execute().await.unwrap_err();
    assert!(matches!(err, SequencerError::Refused { .. }), "{err}");
    let err = hub.finalize().await.unwrap_err();
    assert!(matches!(err, SequencerError::Refused { .. }), "{err}");
    assert!(tc.runner.commands().is_empty());
    assert!(hub.steps().records().is_empty());

    tc.teardown().await;
}

#[tokio::test]
async fn test_execute_resumes_after_failure() {
    let tc = TestCluster::start("test_execute_resumes_after_failure");
    let mut hub = tc.hub(UpgradeMode::Link).await;
    let id = hub.id().await;
    hub.initialize().await.unwrap();

    tc.runner.set_handler(Box::new(|cmd: &CommandSpec| {
        let failing = arg_value(cmd, "--new-datadir")
            .is_some_and(|d| d.ends_with(".1"));
        if failing && !is_check(cmd) {
            return Err(pg_upgrade_failure(cmd));
        }
        fake_pg_upgrade(cmd)
    }));
    let err = hub.execute().await.unwrap_err();
    match &err {
        SequencerError::StepFailed { section, step, .. } => {
            assert_eq!(*section, Section::Execute);
            assert_eq!(*step, StepName::UpgradePrimaries);
        }
        other => panic!("unexpected error: {other}"),
    }
    let message = format!("{:#}", anyhow::anyhow!(err));
    assert!(message.contains("sdw2"), "{message}");
    assert!(message.contains("dbid=3 content=1"), "{message}");
    assert!(message.contains("catalog mismatch"), "{message}");

    // A new hub process picks up where the last one left off.
    drop(hub);
    let mut hub = tc.hub(UpgradeMode::Link).await;
    assert_eq!(hub.id().await, id);
    assert_eq!(
        hub.steps().status(Section::Execute, StepName::UpgradePrimaries),
        StepStatus::Failed
    );

    tc.runner.set_handler(Box::new(fake_pg_upgrade));
    let report = hub.execute().await.unwrap();
    assert_eq!(
        report.skipped,
        vec![StepName::UpgradeCoordinator, StepName::CopyCoordinator]
    );
    assert_eq!(report.ran, vec![StepName::UpgradePrimaries]);

    tc.teardown().await;
}

#[tokio::test]
async fn test_failed_check_keeps_layout() {
    let tc = TestCluster::start("test_failed_check_keeps_layout");
    tc.runner.set_handler(Box::new(|cmd: &CommandSpec| {
        if is_check(cmd) {
            Err(pg_upgrade_failure(cmd))
        } else {
            fake_pg_upgrade(cmd)
        }
    }));

    let mut hub = tc.hub(UpgradeMode::Copy).await;
    let err = hub.initialize().await.unwrap_err();
    assert!(
        matches!(err, SequencerError::StepFailed { step: StepName::CheckUpgrade, .. }),
        "{err}"
    );
    let layout = hub.layout().await.unwrap();

    tc.runner.set_handler(Box::new(fake_pg_upgrade));
    let report = hub.initialize().await.unwrap();
    assert_eq!(report.ran, vec![StepName::CheckUpgrade]);
    assert_eq!(hub.layout().await.unwrap(), layout);

    tc.teardown().await;
}

#[tokio::test]
async fn test_revert_restores_source_cluster() {
    let tc = TestCluster::start("test_revert_restores_source_cluster");
    let mut hub = tc.hub(UpgradeMode::Link).await;
    hub.initialize().await.unwrap();
    hub.execute().await.unwrap();
    let layout = hub.layout().await.unwrap();

    // A link-mode upgrade retires each source control file.
    for s in tc.upgraded() {
        write_file(&s.data_dir.join("global/pg_control.old"), "control");
    }

    let report = hub.revert().await.unwrap();
    assert_eq!(report.ran, Section::Revert.steps().to_vec());
    for s in tc.upgraded() {
        assert_eq!(read_tag(&s.data_dir), "source");
        assert!(s.data_dir.join("global/pg_control").exists());
        assert!(!s.data_dir.join("global/pg_control.old").exists());
        assert!(!layout.get(s.dbid).unwrap().data_dir.exists());
    }
    for agent in tc.agents.values() {
        assert!(!agent.state_dir.exists());
    }

    let err = hub.finalize().await.unwrap_err();
    assert!(matches!(err, SequencerError::Refused { .. }), "{err}");

    tc.wait_for_stop().await;
}

#[tokio::test]
async fn test_revert_refused_after_partial_finalize() {
    let tc = TestCluster::start("test_revert_refused_after_partial_finalize");
    let mut hub = tc.hub(UpgradeMode::Copy).await;
    hub.initialize().await.unwrap();
    hub.execute().await.unwrap();
    let layout = hub.layout().await.unwrap();

    // A leftover archive on sdw2 keeps its upgraded directory from being
    // swapped in, while the other hosts go ahead.
    let blocked =
        tc.cluster.segments().iter().find(|s| s.dbid == 3).unwrap();
    create_tagged_data_dir(
        &Utf8PathBuf::from(format!("{}.old", blocked.data_dir)),
        "stale",
    );

    let err = hub.finalize().await.unwrap_err();
    assert!(
        matches!(
            err,
            SequencerError::StepFailed {
                step: StepName::RenameDataDirectories,
                ..
            }
        ),
        "{err}"
    );
    let message = format!("{:#}", anyhow::anyhow!(err));
    assert!(message.contains("dbid=3 content=1"), "{message}");

    let coordinator = tc.cluster.coordinator();
    assert_eq!(read_tag(&coordinator.data_dir), "upgraded");

    let err = hub.revert().await.unwrap_err();
    assert!(matches!(err, SequencerError::Refused { .. }), "{err}");
    let records = hub.steps().records();
    assert!(records.iter().all(|r| r.section != Section::Revert));

    // Nothing was moved back.
    assert_eq!(read_tag(&coordinator.data_dir), "upgraded");
    assert_eq!(
        read_tag(&Utf8PathBuf::from(format!("{}.old", coordinator.data_dir))),
        "source"
    );
    assert_eq!(read_tag(&blocked.data_dir), "source");
    assert_eq!(
        read_tag(&layout.get(blocked.dbid).unwrap().data_dir),
        "upgraded"
    );

    tc.teardown().await;
}

#[tokio::test]
async fn test_invalid_legacy_tablespace_stops_initialize() {
    let tc =
        TestCluster::start("test_invalid_legacy_tablespace_stops_initialize")
            .with_tablespaces();
    let primary =
        tc.cluster.segments().iter().find(|s| s.dbid == 2).unwrap();
    let location = tablespace_location(tc.root.path(), primary);
    std::fs::create_dir(location.join("16390")).unwrap();

    let mut hub = tc.hub(UpgradeMode::Copy).await;
    let err = hub.initialize().await.unwrap_err();
    assert!(
        matches!(
            err,
            SequencerError::StepFailed {
                step: StepName::VerifySourceTablespaces,
                ..
            }
        ),
        "{err}"
    );
    let message = format!("{:#}", anyhow::anyhow!(err));
    assert!(message.contains("sdw1"), "{message}");
    assert!(message.contains(location.as_str()), "{message}");
    assert!(!tc.runner.commands().iter().any(is_check));

    tc.teardown().await;
}

#[tokio::test]
async fn test_tablespaces_through_finalize() {
    let tc = TestCluster::start("test_tablespaces_through_finalize")
        .with_tablespaces();
    let mut hub = tc.hub(UpgradeMode::Link).await;
    hub.initialize().await.unwrap();
    hub.execute().await.unwrap();

    let listed = tc
        .runner
        .commands()
        .iter()
        .filter(|c| arg_value(c, "--old-tablespaces-file").is_some())
        .count();
    assert_eq!(listed, 6, "every check and upgrade lists tablespaces");
    for s in tc.upgraded() {
        let location = tablespace_location(tc.root.path(), s);
        let upgraded = location.join(s.dbid.to_string()).join("GPDB_6_306");
        assert!(upgraded.exists(), "{upgraded}");
    }

    hub.finalize().await.unwrap();
    for s in tc.cluster.segments() {
        let location = tablespace_location(tc.root.path(), s);
        let legacy = location.join(DB_OID.to_string());
        if s.is_upgraded() {
            assert!(legacy.join("PG_VERSION").exists(), "{legacy}");
        } else {
            assert!(location.exists());
            assert!(!legacy.exists(), "{legacy}");
        }
    }

    tc.wait_for_stop().await;
}

#[tokio::test]
async fn test_revert_removes_upgraded_tablespaces() {
    let tc = TestCluster::start("test_revert_removes_upgraded_tablespaces")
        .with_tablespaces();
    let mut hub = tc.hub(UpgradeMode::Copy).await;
    hub.initialize().await.unwrap();
    hub.execute().await.unwrap();

    hub.revert().await.unwrap();
    for s in tc.cluster.segments() {
        let location = tablespace_location(tc.root.path(), s);
        let dbid_dir = location.join(s.dbid.to_string());
        assert!(!dbid_dir.join("GPDB_6_306").exists(), "{dbid_dir}");
        assert!(!dbid_dir.exists(), "{dbid_dir}");
        let legacy = location.join(DB_OID.to_string());
        assert!(legacy.join("PG_VERSION").exists(), "{legacy}");
        assert!(legacy.join("12345").exists(), "{legacy}");
    }

    tc.wait_for_stop().await;
}

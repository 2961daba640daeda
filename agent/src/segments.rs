// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Applying an operation to every segment on this host
//!
//! Segments are independent of one another. Each operation here is attempted
//! for every segment even when some fail, and the failures are returned
//! together, each labeled with the segment it belongs to.

use crate::directories::{self, DirectoryError};
use crate::fs::FileSystem;
use crate::runner::{
    old_tablespaces_contents, pg_upgrade_command, pg_upgrade_work_dir,
    rsync_command, CommandError, CommandRunner, PgUpgradeOptions,
    OLD_TABLESPACES_FILE,
};
use camino::{Utf8Path, Utf8PathBuf};
use futures::future::join_all;
use slog::{info, warn, Logger};
use std::future::Future;
use upgrade_agent_api::{
    DataDirPair, RenameDirectories, RsyncRequest, UpgradePrimariesRequest,
};
use upgrade_common::ErrorList;

/// Identifies a segment in error labels and logs.
pub fn segment_label(pair: &DataDirPair) -> String {
    format!(
        "segment dbid={} content={} ({})",
        pair.dbid, pair.content, pair.source_data_dir
    )
}

fn rename_label(d: &RenameDirectories) -> String {
    format!("segment dbid={} content={} ({})", d.dbid, d.content, d.target)
}

/// Runs `op` for every item, in order, returning every failure.
pub fn for_each_segment<T, E, L, F>(
    items: &[T],
    label: L,
    mut op: F,
) -> Result<(), ErrorList<E>>
where
    L: Fn(&T) -> String,
    F: FnMut(&T) -> Result<(), E>,
{
    let mut errors = ErrorList::new();
    for item in items {
        if let Err(err) = op(item) {
            errors.push(label(item), err);
        }
    }
    errors.into_result()
}

/// Runs `op` for every item concurrently, returning every failure once all
/// of them have finished.
pub async fn for_each_segment_concurrently<'a, T, E, L, F, Fut>(
    items: &'a [T],
    label: L,
    op: F,
) -> Result<(), ErrorList<E>>
where
    L: Fn(&T) -> String,
    F: Fn(&'a T) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    let results = join_all(items.iter().map(op)).await;
    let mut errors = ErrorList::new();
    for (item, result) in items.iter().zip(results) {
        if let Err(err) = result {
            errors.push(label(item), err);
        }
    }
    errors.into_result()
}

/// Archives each target directory and swaps its source into place.
pub fn rename_directories(
    log: &Logger,
    fs: &dyn FileSystem,
    dirs: &[RenameDirectories],
) -> Result<(), ErrorList<DirectoryError>> {
    for_each_segment(
        dirs,
        rename_label,
        |d| {
            directories::archive_and_swap(
                log,
                fs,
                &d.source,
                &d.target,
                d.rename_target,
            )
        },
    )
}

pub fn restore_control_files(
    log: &Logger,
    fs: &dyn FileSystem,
    data_dirs: &[Utf8PathBuf],
) -> Result<(), ErrorList<DirectoryError>> {
    for_each_segment(
        data_dirs,
        |d| d.to_string(),
        |d| directories::restore_control_file(log, fs, d),
    )
}

/// Runs pg_upgrade for every segment in `request` concurrently.
///
/// Each segment runs in its own working directory under `state_dir`, where
/// pg_upgrade leaves its logs.
pub async fn upgrade_segments(
    log: &Logger,
    runner: &dyn CommandRunner,
    state_dir: &Utf8Path,
    request: &UpgradePrimariesRequest,
) -> Result<(), ErrorList<CommandError>> {
    let options = PgUpgradeOptions {
        source_bin_dir: &request.source_bin_dir,
        target_bin_dir: &request.target_bin_dir,
        mode: request.mode,
        check_only: request.check_only,
        coordinator: request.coordinator,
    };

    for_each_segment_concurrently(
        &request.data_dir_pairs,
        segment_label,
        |pair| {
            let options = &options;
            async move {
                let work_dir = pg_upgrade_work_dir(state_dir, pair.content);
                tokio::fs::create_dir_all(&work_dir).await.map_err(|err| {
                    CommandError::WorkDir { path: work_dir.clone(), err }
                })?;
                if !pair.tablespaces.is_empty() {
                    let path = work_dir.join(OLD_TABLESPACES_FILE);
                    tokio::fs::write(&path, old_tablespaces_contents(pair))
                        .await
                        .map_err(|err| CommandError::TablespacesFile {
                            path: path.clone(),
                            err,
                        })?;
                }

                let command = pg_upgrade_command(options, pair, &work_dir);
                info!(
                    log,
                    "upgrading segment";
                    "segment" => segment_label(pair),
                    "check_only" => options.check_only,
                );
                runner.run(&command).await.map(|_| ()).inspect_err(|err| {
                    warn!(
                        log,
                        "pg_upgrade failed";
                        "segment" => segment_label(pair),
                        "error" => %err,
                    )
                })
            }
        },
    )
    .await
}

/// Copies every pair in `request` concurrently.
pub async fn rsync(
    log: &Logger,
    runner: &dyn CommandRunner,
    request: &RsyncRequest,
) -> Result<(), ErrorList<CommandError>> {
    for_each_segment_concurrently(
        &request.pairs,
        |p| format!("{}:{}", p.destination_host, p.destination),
        |pair| async move {
            let command =
                rsync_command(pair, &request.options, &request.excludes);
            info!(
                log,
                "copying directory";
                "source" => %pair.source,
                "host" => &pair.destination_host,
                "destination" => %pair.destination,
            );
            runner.run(&command).await.map(|_| ())
        },
    )
    .await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::{fault, FaultyFileSystem, FsOp};
    use crate::runner::{CommandOutput, FakeCommandRunner};
    use camino_tempfile::Utf8TempDir;
    use std::collections::BTreeMap;
    use std::io;
    use upgrade_agent_api::{RsyncPair, Tablespace, UpgradeMode};
    use upgrade_test_utils::dev::fixtures::{create_tagged_data_dir, read_tag};
    use upgrade_test_utils::dev::test_setup_log;

    #[test]
    fn test_for_each_segment_attempts_all() {
        let mut seen = Vec::new();
        let err = for_each_segment(
            &[1, 2, 3, 4],
            |n| format!("segment {n}"),
            |n| {
                seen.push(*n);
                if n % 2 == 0 {
                    Err(io::Error::new(io::ErrorKind::Other, "even"))
                } else {
                    Ok(())
                }
            },
        )
        .unwrap_err();

        assert_eq!(seen, vec![1, 2, 3, 4]);
        assert_eq!(
            err.labels().collect::<Vec<_>>(),
            vec!["segment 2", "segment 4"]
        );
    }

    #[test]
    fn test_rename_directories_continues_past_failures() {
        let logctx =
            test_setup_log("test_rename_directories_continues_past_failures");
        let root = Utf8TempDir::new().unwrap();

        let mut dirs = Vec::new();
        for content in 0..3 {
            let source = create_tagged_data_dir(
                &root.path().join(format!("seg.id.{content}")),
                "new",
            );
            let target = create_tagged_data_dir(
                &root.path().join(format!("seg{content}")),
                "old",
            );
            dirs.push(RenameDirectories {
                dbid: content + 2,
                content,
                source,
                target,
                rename_target: true,
            });
        }

        let fs = FaultyFileSystem::new();
        let failing = dirs[1].target.clone();
        fs.set_fault_handler(Box::new(move |op| match op {
            FsOp::Rename { from, .. } if *from == failing => {
                fault(io::ErrorKind::PermissionDenied)
            }
            _ => None,
        }));

        let err =
            rename_directories(&logctx.log, fs.as_ref(), &dirs).unwrap_err();
        let label = format!("segment dbid=3 content=1 ({})", dirs[1].target);
        assert_eq!(err.labels().collect::<Vec<_>>(), vec![label.as_str()]);
        assert_eq!(read_tag(&dirs[0].target), "new");
        assert_eq!(read_tag(&dirs[1].target), "old");
        assert_eq!(read_tag(&dirs[2].target), "new");

        logctx.cleanup_successful();
    }

    fn pair(root: &Utf8Path, content: i32) -> DataDirPair {
        DataDirPair {
            source_data_dir: root.join(format!("seg{content}")),
            target_data_dir: root.join(format!("seg.id.{content}")),
            source_port: 25432 + content as u16,
            target_port: 50432 + content as u16,
            content,
            dbid: content + 2,
            tablespaces: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_upgrade_segments_labels_failures() {
        let logctx = test_setup_log("test_upgrade_segments_labels_failures");
        let state = Utf8TempDir::new().unwrap();
        let runner = FakeCommandRunner::new(&logctx.log);
        runner.set_handler(Box::new(|cmd| {
            if cmd.args.iter().any(|a| a.ends_with("seg.id.1")) {
                Err(CommandError::Failed {
                    command: cmd.to_string(),
                    status: "exit status: 1".to_string(),
                    stdout: String::new(),
                    stderr: "incompatible".to_string(),
                })
            } else {
                Ok(CommandOutput::default())
            }
        }));

        let request = UpgradePrimariesRequest {
            source_bin_dir: "/old/bin".into(),
            target_bin_dir: "/new/bin".into(),
            mode: UpgradeMode::Copy,
            check_only: false,
            coordinator: false,
            data_dir_pairs: (0..3).map(|c| pair(Utf8Path::new("/data"), c)).collect(),
        };

        let err = upgrade_segments(
            &logctx.log,
            runner.as_ref(),
            state.path(),
            &request,
        )
        .await
        .unwrap_err();

        assert_eq!(err.len(), 1);
        assert_eq!(
            err.labels().collect::<Vec<_>>(),
            vec!["segment dbid=3 content=1 (/data/seg1)"]
        );
        assert_eq!(runner.commands().len(), 3);
        for content in 0..3 {
            assert!(pg_upgrade_work_dir(state.path(), content).is_dir());
        }

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_upgrade_segments_writes_tablespace_list() {
        let logctx =
            test_setup_log("test_upgrade_segments_writes_tablespace_list");
        let state = Utf8TempDir::new().unwrap();
        let runner = FakeCommandRunner::new(&logctx.log);

        let mut spaced = pair(Utf8Path::new("/data"), 0);
        spaced.tablespaces.insert(
            16386,
            Tablespace {
                name: "fast".to_string(),
                location: "/ts/fast/gpseg0".into(),
                user_defined: true,
            },
        );
        let request = UpgradePrimariesRequest {
            source_bin_dir: "/old/bin".into(),
            target_bin_dir: "/new/bin".into(),
            mode: UpgradeMode::Link,
            check_only: true,
            coordinator: false,
            data_dir_pairs: vec![spaced, pair(Utf8Path::new("/data"), 1)],
        };
        upgrade_segments(&logctx.log, runner.as_ref(), state.path(), &request)
            .await
            .unwrap();

        let listed =
            pg_upgrade_work_dir(state.path(), 0).join(OLD_TABLESPACES_FILE);
        assert_eq!(
            std::fs::read_to_string(&listed).unwrap(),
            "2,16386,fast,/ts/fast/gpseg0,1\n"
        );
        assert!(!pg_upgrade_work_dir(state.path(), 1)
            .join(OLD_TABLESPACES_FILE)
            .exists());
        let passed = runner
            .commands()
            .iter()
            .filter(|c| c.args.contains(&listed.to_string()))
            .count();
        assert_eq!(passed, 1);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_rsync_runs_every_pair() {
        let logctx = test_setup_log("test_rsync_runs_every_pair");
        let runner = FakeCommandRunner::new(&logctx.log);
        let request = RsyncRequest {
            pairs: vec![
                RsyncPair {
                    source: "/data/qd".into(),
                    destination_host: "sdw1".to_string(),
                    destination: "/data/p0".into(),
                },
                RsyncPair {
                    source: "/data/qd".into(),
                    destination_host: "sdw2".to_string(),
                    destination: "/data/p1".into(),
                },
            ],
            options: vec!["--delete".to_string()],
            excludes: vec![],
        };

        rsync(&logctx.log, runner.as_ref(), &request).await.unwrap();
        let commands: Vec<String> =
            runner.commands().iter().map(|c| c.to_string()).collect();
        assert_eq!(
            commands,
            vec![
                "rsync --archive --delete /data/qd/ sdw1:/data/p0",
                "rsync --archive --delete /data/qd/ sdw2:/data/p1",
            ]
        );

        logctx.cleanup_successful();
    }
}

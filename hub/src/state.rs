// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! What the hub remembers about an upgrade between invocations

use crate::cluster::{Cluster, Segment};
use crate::config::PortRange;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use slog::{info, Logger};
use std::collections::BTreeSet;
use upgrade_agent_client::DataDirPair;
use upgrade_common::ledger::{self, Ledger, Ledgerable};
use upgrade_common::upgrade_id::temp_data_dir;
use upgrade_common::UpgradeId;

pub const UPGRADE_LEDGER: &str = "upgrade.json";

/// Where one upgraded segment lives in the target cluster.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TargetSegment {
    pub dbid: i32,
    pub content: i32,
    pub host: String,
    pub data_dir: Utf8PathBuf,
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error(
        "temporary port range {start}-{end} has {available} usable ports; \
         {needed} are needed"
    )]
    PortsExhausted { start: u16, end: u16, available: usize, needed: usize },
}

/// The target cluster's data directories and ports.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TargetLayout {
    pub segments: Vec<TargetSegment>,
}

impl TargetLayout {
    /// Derives a layout for every segment pg_upgrade runs against.
    ///
    /// Target data directories sit next to their source, named after the
    /// upgrade. Ports are taken in order from `ports`, skipping any port
    /// the source cluster already uses.
    pub fn generate(
        cluster: &Cluster,
        id: UpgradeId,
        ports: PortRange,
        source_coordinator_port: u16,
    ) -> Result<Self, LayoutError> {
        let mut used: BTreeSet<u16> =
            cluster.segments().iter().map(|s| s.port).collect();
        used.insert(source_coordinator_port);

        let upgraded: Vec<&Segment> = cluster.upgraded_segments().collect();
        let available: Vec<u16> =
            ports.iter().filter(|p| !used.contains(p)).collect();
        if available.len() < upgraded.len() {
            return Err(LayoutError::PortsExhausted {
                start: ports.start,
                end: ports.end,
                available: available.len(),
                needed: upgraded.len(),
            });
        }

        let prefix = cluster.segment_prefix();
        let segments = upgraded
            .into_iter()
            .zip(available)
            .map(|(segment, port)| TargetSegment {
                dbid: segment.dbid,
                content: segment.content,
                host: segment.host.clone(),
                data_dir: temp_data_dir(&segment.data_dir, prefix, id),
                port,
            })
            .collect();
        Ok(TargetLayout { segments })
    }

    pub fn get(&self, dbid: i32) -> Option<&TargetSegment> {
        self.segments.iter().find(|s| s.dbid == dbid)
    }

    /// Pairs a source segment with its target.
    pub fn pair(&self, segment: &Segment) -> Option<DataDirPair> {
        let target = self.get(segment.dbid)?;
        Some(DataDirPair {
            source_data_dir: segment.data_dir.clone(),
            target_data_dir: target.data_dir.clone(),
            source_port: segment.port,
            target_port: target.port,
            content: segment.content,
            dbid: segment.dbid,
            tablespaces: segment.tablespace_map(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct UpgradeState {
    pub generation: u64,
    pub id: UpgradeId,
    /// Set by the layout step of `initialize`.
    #[serde(default)]
    pub layout: Option<TargetLayout>,
    /// Name the agents archive their log directories under. Chosen once so
    /// that a retried archive step finds the archive it already made.
    #[serde(default)]
    pub log_archive_name: Option<String>,
}

impl Ledgerable for UpgradeState {
    fn is_newer_than(&self, other: &Self) -> bool {
        self.generation > other.generation
    }

    fn generation_bump(&mut self) {
        self.generation += 1;
    }
}

/// The durable [`UpgradeState`] of the current upgrade.
pub struct HubState {
    ledger: Ledger<UpgradeState>,
}

impl HubState {
    /// Loads the state from `state_dir`, starting a new upgrade (with a new
    /// id) if there is none. A state file that exists but cannot be read is
    /// an error, never a new upgrade.
    pub async fn load_or_create(
        log: &Logger,
        state_dir: &Utf8Path,
    ) -> Result<Self, ledger::Error> {
        let paths = vec![state_dir.join(UPGRADE_LEDGER)];
        if let Some(ledger) = Ledger::<UpgradeState>::new(log, paths.clone()).await? {
            info!(log, "resuming upgrade"; "id" => %ledger.data().id);
            return Ok(HubState { ledger });
        }

        let state = UpgradeState {
            generation: 0,
            id: UpgradeId::new_random(),
            layout: None,
            log_archive_name: None,
        };
        info!(log, "starting new upgrade"; "id" => %state.id);
        let mut ledger = Ledger::new_with(log, paths, state);
        ledger.commit().await?;
        Ok(HubState { ledger })
    }

    pub fn get(&self) -> &UpgradeState {
        self.ledger.data()
    }

    pub fn id(&self) -> UpgradeId {
        self.ledger.data().id
    }

    pub fn layout(&self) -> Option<&TargetLayout> {
        self.ledger.data().layout.as_ref()
    }

    /// Applies `f` to the state and durably records the result.
    pub async fn update<F>(&mut self, f: F) -> Result<(), ledger::Error>
    where
        F: FnOnce(&mut UpgradeState),
    {
        f(self.ledger.data_mut());
        self.ledger.commit().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::Role;
    use camino_tempfile::Utf8TempDir;
    use upgrade_test_utils::dev::test_setup_log;

    fn segment(dbid: i32, content: i32, role: Role, port: u16) -> Segment {
        let data_dir = if content == -1 {
            "/data/coordinator/gpseg-1".to_string()
        } else {
            format!("/data/{role:?}/gpseg{content}").to_lowercase()
        };
        Segment {
            host: format!("sdw{}", content.max(0)),
            address: "10.0.0.1".to_string(),
            content,
            dbid,
            role,
            port,
            data_dir: data_dir.into(),
            tablespaces: vec![],
        }
    }

    fn cluster() -> Cluster {
        Cluster::new(vec![
            segment(1, -1, Role::Coordinator, 5432),
            segment(2, 0, Role::Primary, 50433),
            segment(3, 1, Role::Primary, 25433),
            segment(4, 0, Role::Mirror, 25434),
        ])
        .unwrap()
    }

    #[test]
    fn test_generate_layout() {
        let id = UpgradeId::default();
        let layout = TargetLayout::generate(
            &cluster(),
            id,
            PortRange { start: 50432, end: 50440 },
            5432,
        )
        .unwrap();

        // Mirrors are not upgraded, and the source's port 50433 is skipped.
        let summary: Vec<_> = layout
            .segments
            .iter()
            .map(|s| (s.dbid, s.data_dir.as_str(), s.port))
            .collect();
        let coordinator = format!("/data/coordinator/gpseg.{id}.-1");
        let primary0 = format!("/data/primary/gpseg.{id}.0");
        let primary1 = format!("/data/primary/gpseg.{id}.1");
        assert_eq!(
            summary,
            vec![
                (1, coordinator.as_str(), 50432),
                (2, primary0.as_str(), 50434),
                (3, primary1.as_str(), 50435),
            ]
        );

        let cluster = cluster();
        let pair = layout.pair(&cluster.segments()[1]).unwrap();
        assert_eq!(pair.source_port, 50433);
        assert_eq!(pair.target_port, 50434);
        assert!(layout.pair(&cluster.segments()[2]).is_none());
    }

    #[test]
    fn test_generate_layout_runs_out_of_ports() {
        let err = TargetLayout::generate(
            &cluster(),
            UpgradeId::default(),
            PortRange { start: 50432, end: 50433 },
            5432,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            LayoutError::PortsExhausted { available: 1, needed: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_state_survives_reload() {
        let logctx = test_setup_log("test_state_survives_reload");
        let dir = Utf8TempDir::new().unwrap();

        let mut state =
            HubState::load_or_create(&logctx.log, dir.path()).await.unwrap();
        let id = state.id();
        assert!(state.layout().is_none());
        state
            .update(|s| s.log_archive_name = Some("archive".to_string()))
            .await
            .unwrap();

        let state =
            HubState::load_or_create(&logctx.log, dir.path()).await.unwrap();
        assert_eq!(state.id(), id);
        assert_eq!(state.get().log_archive_name.as_deref(), Some("archive"));

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_corrupt_state_keeps_its_file() {
        let logctx = test_setup_log("test_corrupt_state_keeps_its_file");
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join(UPGRADE_LEDGER);
        std::fs::write(&path, b"garbage").unwrap();

        let err = HubState::load_or_create(&logctx.log, dir.path())
            .await
            .err()
            .expect("a corrupt state file must not start a new upgrade");
        assert!(err.has_io_kind(std::io::ErrorKind::InvalidData), "{err}");
        assert_eq!(std::fs::read(&path).unwrap(), b"garbage");

        logctx.cleanup_successful();
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The upgrade hub
//!
//! The hub runs on the coordinator host. It owns the plan of an upgrade:
//! which sections and steps have run, where the target cluster lives, and
//! which upgrade is in progress. The work itself is done by the agent on
//! each host, which the hub drives over HTTP.

pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod state;
pub mod step;
mod upgrade;

pub use cluster::{Cluster, ClusterError};
pub use config::{Config, ConfigError};
pub use dispatch::Agents;
pub use step::{Section, SectionReport, SequencerError, StepName, StepStatus};
pub use upgrade::{
    check_section, Hub, InsufficientDiskSpace, OpenError,
    COPY_COORDINATOR_EXCLUDES,
};

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::directories::DirectoryError;
use crate::disk_space::DiskSpaceError;
use crate::runner::CommandError;
use display_error_chain::DisplayErrorChain;
use dropshot::HttpError;
use upgrade_common::ErrorList;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("{0}")]
    Segments(ErrorList<DirectoryError>),

    #[error("{0}")]
    Commands(ErrorList<CommandError>),

    #[error(transparent)]
    DiskSpace(#[from] DiskSpaceError),

    #[error("blocking task failed")]
    Join(#[from] tokio::task::JoinError),
}

impl AgentError {
    /// Returns true if the request named directories that are not what it
    /// claimed them to be.
    pub fn is_validation(&self) -> bool {
        match self {
            AgentError::Directory(err) => err.is_validation(),
            AgentError::Segments(errors) => errors.all(|e| e.is_validation()),
            AgentError::DiskSpace(DiskSpaceError::InvalidRatio(_)) => true,
            AgentError::DiskSpace(DiskSpaceError::Statvfs { .. })
            | AgentError::Commands(_)
            | AgentError::Join(_) => false,
        }
    }
}

impl From<AgentError> for HttpError {
    fn from(err: AgentError) -> Self {
        let message = DisplayErrorChain::new(&err).to_string();
        if err.is_validation() {
            HttpError::for_bad_request(None, message)
        } else {
            // The hub reports which segment failed and why, so the chain is
            // not kept internal.
            let mut http_err = HttpError::for_internal_error(message.clone());
            http_err.error_code = Some(String::from("Internal"));
            http_err.external_message = message;
            http_err
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use camino::Utf8PathBuf;
    use std::io;

    #[test]
    fn test_validation_errors_are_bad_requests() {
        let mut errors = ErrorList::new();
        errors.push(
            "/data/seg1",
            DirectoryError::InvalidDataDirectory {
                path: Utf8PathBuf::from("/data/seg1"),
            },
        );
        let err: HttpError = AgentError::Segments(errors).into();
        assert_eq!(err.status_code.as_u16(), 400);
        assert!(err.external_message.contains("/data/seg1"));
    }

    #[test]
    fn test_io_errors_are_internal() {
        let err: HttpError = AgentError::Directory(DirectoryError::Hostname(
            io::Error::new(io::ErrorKind::Other, "no name"),
        ))
        .into();
        assert_eq!(err.status_code.as_u16(), 500);
        assert!(err.internal_message.contains("no name"));
        assert!(err.external_message.contains("no name"));
    }

    #[test]
    fn test_command_failures_keep_segment_labels() {
        let mut errors = ErrorList::new();
        errors.push(
            "segment dbid=3 content=1 (/data/gpseg1)",
            CommandError::Failed {
                command: "pg_upgrade".to_string(),
                status: "exit status: 1".to_string(),
                stdout: String::new(),
                stderr: "catalog mismatch".to_string(),
            },
        );
        let err: HttpError = AgentError::Commands(errors).into();
        assert_eq!(err.status_code.as_u16(), 500);
        assert!(err.external_message.contains("dbid=3 content=1"));
    }
}

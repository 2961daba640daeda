// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface for making API requests to an upgrade agent

use dropshot::HttpErrorResponseBody;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::{debug, Logger};
use std::time::Duration;

pub use upgrade_agent_api::*;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to communicate with {url}")]
    Communication {
        url: String,
        #[source]
        err: reqwest::Error,
    },

    #[error("{url} returned {status}: {message}")]
    ErrorResponse {
        url: String,
        status: StatusCode,
        error_code: Option<String>,
        message: String,
    },

    #[error("invalid response from {url}")]
    InvalidResponse {
        url: String,
        #[source]
        err: reqwest::Error,
    },
}

impl ClientError {
    /// Returns the HTTP status of an error response, if the agent answered.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::ErrorResponse { status, .. } => Some(*status),
            ClientError::Communication { .. }
            | ClientError::InvalidResponse { .. } => None,
        }
    }

    /// Returns true if the agent could not be reached at all.
    pub fn is_communication(&self) -> bool {
        matches!(self, ClientError::Communication { .. })
    }
}

/// Client for one agent.
#[derive(Clone, Debug)]
pub struct Client {
    baseurl: String,
    client: reqwest::Client,
    log: Logger,
}

impl Client {
    /// Create a client for the agent at `baseurl`, e.g.
    /// `http://sdw1:6416`.
    pub fn new(baseurl: &str, log: Logger) -> Self {
        // No overall request timeout: pg_upgrade on a large segment runs for
        // a long time.
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self::new_with_client(baseurl, client, log)
    }

    pub fn new_with_client(
        baseurl: &str,
        client: reqwest::Client,
        log: Logger,
    ) -> Self {
        Self {
            baseurl: baseurl.trim_end_matches('/').to_string(),
            client,
            log,
        }
    }

    pub fn baseurl(&self) -> &str {
        &self.baseurl
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response, ClientError> {
        let url = format!("{}{}", self.baseurl, path);
        debug!(self.log, "client request"; "method" => %method, "url" => &url);

        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|err| {
            ClientError::Communication { url: url.clone(), err }
        })?;

        let status = response.status();
        debug!(self.log, "client response"; "url" => &url, "status" => %status);
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let (error_code, message) =
            match serde_json::from_str::<HttpErrorResponseBody>(&text) {
                Ok(body) => (body.error_code, body.message),
                Err(_) => (None, text),
            };
        Err(ClientError::ErrorResponse { url, status, error_code, message })
    }

    async fn get_json<R: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<R, ClientError> {
        let response = self.send::<()>(Method::GET, path, None).await?;
        let url = response.url().to_string();
        response
            .json()
            .await
            .map_err(|err| ClientError::InvalidResponse { url, err })
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, ClientError>
    where
        B: Serialize,
        R: DeserializeOwned,
    {
        let response = self.send(Method::POST, path, Some(body)).await?;
        let url = response.url().to_string();
        response
            .json()
            .await
            .map_err(|err| ClientError::InvalidResponse { url, err })
    }

    async fn post<B>(&self, path: &str, body: &B) -> Result<(), ClientError>
    where
        B: Serialize,
    {
        self.send(Method::POST, path, Some(body)).await.map(|_| ())
    }

    async fn post_empty(&self, path: &str) -> Result<(), ClientError> {
        self.send::<()>(Method::POST, path, None).await.map(|_| ())
    }

    pub async fn status(&self) -> Result<AgentStatus, ClientError> {
        self.get_json("/status").await
    }

    pub async fn check_disk_space(
        &self,
        body: &DiskSpaceRequest,
    ) -> Result<DiskSpaceResponse, ClientError> {
        self.post_json("/disk-space/check", body).await
    }

    pub async fn upgrade_primaries(
        &self,
        body: &UpgradePrimariesRequest,
    ) -> Result<(), ClientError> {
        self.post("/primaries/upgrade", body).await
    }

    pub async fn rename_directories(
        &self,
        body: &RenameDirectoriesRequest,
    ) -> Result<(), ClientError> {
        self.post("/directories/rename", body).await
    }

    pub async fn delete_data_directories(
        &self,
        body: &DeleteDirectoriesRequest,
    ) -> Result<(), ClientError> {
        self.post("/directories/delete", body).await
    }

    pub async fn delete_state_directory(&self) -> Result<(), ClientError> {
        self.post_empty("/state-directory/delete").await
    }

    pub async fn delete_target_tablespaces(
        &self,
        body: &TablespaceDirectoriesRequest,
    ) -> Result<(), ClientError> {
        self.post("/tablespaces/delete-target", body).await
    }

    pub async fn delete_source_tablespaces(
        &self,
        body: &TablespaceDirectoriesRequest,
    ) -> Result<(), ClientError> {
        self.post("/tablespaces/delete-source", body).await
    }

    pub async fn verify_source_tablespaces(
        &self,
        body: &TablespaceDirectoriesRequest,
    ) -> Result<(), ClientError> {
        self.post("/tablespaces/verify-source", body).await
    }

    pub async fn archive_log_directory(
        &self,
        body: &ArchiveLogDirectoryRequest,
    ) -> Result<ArchiveLogDirectoryResponse, ClientError> {
        self.post_json("/log-directory/archive", body).await
    }

    pub async fn rsync(&self, body: &RsyncRequest) -> Result<(), ClientError> {
        self.post("/rsync", body).await
    }

    pub async fn restore_control_files(
        &self,
        body: &RestoreControlFilesRequest,
    ) -> Result<(), ClientError> {
        self.post("/control-files/restore", body).await
    }

    pub async fn stop(&self) -> Result<(), ClientError> {
        self.post_empty("/stop").await
    }
}

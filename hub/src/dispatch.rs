// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fanning work out to the agent on every host

use futures::future::join_all;
use slog::{debug, warn, Logger};
use std::collections::BTreeMap;
use std::future::Future;
use upgrade_agent_client::{Client, ClientError};
use upgrade_common::ErrorList;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no agent is known for host {0}")]
    UnknownHost(String),

    #[error(transparent)]
    Agent(#[from] ClientError),
}

/// Per-host failures of one dispatched call, labeled with the hostname.
pub type DispatchErrors = ErrorList<DispatchError>;

/// Groups `items` by host, e.g. the segments each agent must act on.
///
/// Hosts with no items do not appear, so they are never contacted.
pub fn group_by_host<'a, T, I>(items: I) -> BTreeMap<String, Vec<T>>
where
    I: IntoIterator<Item = (&'a str, T)>,
{
    let mut groups: BTreeMap<String, Vec<T>> = BTreeMap::new();
    for (host, item) in items {
        groups.entry(host.to_string()).or_default().push(item);
    }
    groups
}

/// Runs `op` against the connection of every host in `work` concurrently,
/// waiting for all of them before returning.
///
/// Returns each host's output, or every failure labeled with its host.
pub async fn fan_out<'c, C, W, T, F, Fut>(
    log: &Logger,
    connections: &'c BTreeMap<String, C>,
    work: BTreeMap<String, W>,
    op: F,
) -> Result<BTreeMap<String, T>, DispatchErrors>
where
    F: Fn(&'c C, W) -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let calls = work.into_iter().map(|(host, work)| {
        let connection = connections.get(&host);
        let call = connection.map(|c| op(c, work));
        async move {
            let result = match call {
                Some(call) => call.await.map_err(DispatchError::from),
                None => Err(DispatchError::UnknownHost(host.clone())),
            };
            (host, result)
        }
    });

    let mut outputs = BTreeMap::new();
    let mut errors = ErrorList::new();
    for (host, result) in join_all(calls).await {
        match result {
            Ok(output) => {
                debug!(log, "agent call succeeded"; "host" => &host);
                outputs.insert(host, output);
            }
            Err(err) => {
                warn!(
                    log,
                    "agent call failed";
                    "host" => &host,
                    "error" => %err,
                );
                errors.push(host, err);
            }
        }
    }
    errors.into_result().map(|()| outputs)
}

/// Clients for the agents of every host in the cluster.
pub struct Agents {
    log: Logger,
    clients: BTreeMap<String, Client>,
}

impl Agents {
    /// Connects to an agent on `port` of every host in `hosts`.
    pub fn new<'a, I>(log: &Logger, hosts: I, port: u16) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        Self::with_urls(
            log,
            hosts
                .into_iter()
                .map(|host| (host.to_string(), format!("http://{host}:{port}"))),
        )
    }

    /// Connects to the agent of each host at the given base URL.
    pub fn with_urls<I>(log: &Logger, urls: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let log = log.new(slog::o!("component" => "Agents"));
        let clients = urls
            .into_iter()
            .map(|(host, url)| {
                let client = Client::new(
                    &url,
                    log.new(slog::o!("host" => host.clone())),
                );
                (host, client)
            })
            .collect();
        Agents { log, clients }
    }

    /// Runs `op` on the agent of every host in `work`.
    pub async fn dispatch<'c, W, T, F, Fut>(
        &'c self,
        work: BTreeMap<String, W>,
        op: F,
    ) -> Result<BTreeMap<String, T>, DispatchErrors>
    where
        F: Fn(&'c Client, W) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        fan_out(&self.log, &self.clients, work, op).await
    }

    /// Runs `op` on the agent of every host.
    pub async fn dispatch_all<'c, T, F, Fut>(
        &'c self,
        op: F,
    ) -> Result<BTreeMap<String, T>, DispatchErrors>
    where
        F: Fn(&'c Client) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let work = self.clients.keys().map(|h| (h.clone(), ())).collect();
        self.dispatch(work, |client, ()| op(client)).await
    }
}

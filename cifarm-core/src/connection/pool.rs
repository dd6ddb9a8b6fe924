//! One session per farm host for the lifetime of a run.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use tracing::{info, instrument, warn};

use super::{RemoteHost, SshConnection};
use crate::config::HostMachineInfo;
use crate::error::{FarmError, Result};

/// Owns every [`RemoteHost`] session, keyed by machine id.
pub struct ConnectionPool {
    connections: BTreeMap<String, Box<dyn RemoteHost>>,
}

impl ConnectionPool {
    /// Open a session to every host before anything else runs.
    ///
    /// Fails on the first unreachable host after closing the sessions that
    /// were already open.
    #[instrument(skip_all, fields(hosts = hosts.len()))]
    pub async fn open(hosts: &[HostMachineInfo], connect_timeout: Duration) -> Result<Self> {
        Self::open_with(hosts, |host| async move {
            let connection = SshConnection::open(host, connect_timeout).await?;
            Ok(Box::new(connection) as Box<dyn RemoteHost>)
        })
        .await
    }

    /// [`ConnectionPool::open`] with sessions created by `connect`.
    ///
    /// The connect error is returned even when closing the already opened
    /// sessions fails too.
    pub async fn open_with<F, Fut>(hosts: &[HostMachineInfo], mut connect: F) -> Result<Self>
    where
        F: FnMut(HostMachineInfo) -> Fut,
        Fut: Future<Output = Result<Box<dyn RemoteHost>>>,
    {
        let mut pool = Self { connections: BTreeMap::new() };
        for host in hosts {
            info!("Connecting to {} ({})", host.machine_id, host.ssh_destination());
            match connect(host.clone()).await {
                Ok(connection) => {
                    pool.connections.insert(host.machine_id.clone(), connection);
                }
                Err(e) => {
                    if let Err(close_error) = pool.close().await {
                        warn!(
                            "Cleanup after failed connect to {}: {}",
                            host.machine_id, close_error
                        );
                    }
                    return Err(e);
                }
            }
        }
        Ok(pool)
    }

    /// Build a pool from already opened sessions.
    pub fn from_hosts(hosts: Vec<Box<dyn RemoteHost>>) -> Self {
        let connections =
            hosts.into_iter().map(|h| (h.machine_id().to_string(), h)).collect();
        Self { connections }
    }

    pub fn get(&self, machine_id: &str) -> Result<&dyn RemoteHost> {
        self.connections
            .get(machine_id)
            .map(|c| c.as_ref())
            .ok_or_else(|| FarmError::UnknownHost { machine_id: machine_id.to_string() })
    }

    pub fn machine_ids(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close every session. All sessions are closed even if one fails; the
    /// first failure is returned.
    pub async fn close(self) -> Result<()> {
        let mut first_error = None;
        for (machine_id, connection) in self.connections {
            if let Err(e) = connection.close().await {
                warn!("Failed to close session to {}: {}", machine_id, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

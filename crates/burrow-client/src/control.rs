//! Control-plane client

use std::time::Duration;

use burrow_proto::{Command, CommandRequest, Protocol, ServerInfo};
use burrow_transport::ClientTrust;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::connection::{expect_success, read_response, ProxyConnector};
use crate::ClientError;

/// Sends control commands to a proxy, one connection per command
pub struct ControlClient {
    connector: ProxyConnector,
    password: String,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(
        proxy_addr: impl Into<String>,
        password: impl Into<String>,
        tls: Option<ClientTrust>,
    ) -> Result<Self, ClientError> {
        let timeout = Duration::from_secs(10);
        Ok(Self {
            connector: ProxyConnector::new(proxy_addr, tls, timeout)?,
            password: password.into(),
            timeout,
        })
    }

    /// Send `command` and wait for the proxy's verdict
    pub async fn send(&self, command: &Command) -> Result<(), ClientError> {
        let request = CommandRequest::new(command.to_json()?, self.password.as_bytes()).encode()?;

        let mut stream = self.connector.connect().await?;
        stream.write_all(&request).await?;
        stream.flush().await?;

        let response = read_response(&mut stream, Protocol::Command, self.timeout).await?;
        debug!(action = command.action(), response = ?response, "Control command answered");
        expect_success(response)
    }

    pub async fn add(&self, info: ServerInfo) -> Result<(), ClientError> {
        self.send(&Command::Add(info)).await
    }

    pub async fn remove(&self, info: ServerInfo) -> Result<(), ClientError> {
        self.send(&Command::Remove(info)).await
    }

    /// Ask the proxy to stop; `grace` bounds its drain
    pub async fn shutdown(&self, grace: Option<Duration>) -> Result<(), ClientError> {
        self.send(&Command::Shutdown { grace }).await
    }
}

//! Connecting to a proxy and reading handshake responses

use std::time::Duration;

use burrow_proto::{Decoded, Protocol, Response};
use burrow_transport::{client_connector, BackendDialer, BoxedStream, ClientTrust};
use tokio::io::AsyncReadExt;

use crate::ClientError;

/// Dials a proxy, optionally over TLS
#[derive(Clone)]
pub struct ProxyConnector {
    addr: String,
    secure: bool,
    dialer: BackendDialer,
}

impl ProxyConnector {
    /// `tls` is `None` for a plain TCP proxy
    pub fn new(
        addr: impl Into<String>,
        tls: Option<ClientTrust>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let secure = tls.is_some();
        let connector = client_connector(&tls.unwrap_or(ClientTrust::WebPki))?;
        Ok(Self {
            addr: addr.into(),
            secure,
            dialer: BackendDialer::new(connector, timeout),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn connect(&self) -> Result<BoxedStream, ClientError> {
        Ok(self.dialer.dial(&self.addr, self.secure).await?)
    }
}

/// Read one handshake response frame
pub async fn read_response(
    stream: &mut BoxedStream,
    protocol: Protocol,
    timeout: Duration,
) -> Result<Response, ClientError> {
    tokio::time::timeout(timeout, read_frame(stream, protocol))
        .await
        .map_err(|_| ClientError::Timeout("waiting for handshake response".to_string()))?
}

async fn read_frame(stream: &mut BoxedStream, protocol: Protocol) -> Result<Response, ClientError> {
    let mut buf = Vec::with_capacity(Response::HEADER_SIZE);
    loop {
        match Response::decode(protocol, &buf)? {
            Decoded::Complete(response) => return Ok(response),
            Decoded::Incomplete { needed } => {
                let mut chunk = vec![0u8; needed];
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(ClientError::Closed);
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

/// Map a handshake response to a result
pub fn expect_success(response: Response) -> Result<(), ClientError> {
    match response {
        Response::Success => Ok(()),
        Response::InvalidPassword => Err(ClientError::InvalidPassword),
        Response::Error(message) => Err(ClientError::Rejected(message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn test_read_response_in_pieces() {
        let (mut proxy, client) = duplex(64);
        let mut client: BoxedStream = Box::new(client);

        let encoded = Response::error("server name already exists").encode(Protocol::Tunnel);
        let writer = tokio::spawn(async move {
            for chunk in encoded.chunks(3) {
                proxy.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            proxy
        });

        let response = read_response(&mut client, Protocol::Tunnel, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response, Response::error("server name already exists"));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_response_closed() {
        let (proxy, client) = duplex(64);
        let mut client: BoxedStream = Box::new(client);
        drop(proxy);

        let result = read_response(&mut client, Protocol::Command, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ClientError::Closed)));
    }

    #[test]
    fn test_expect_success() {
        assert!(expect_success(Response::Success).is_ok());
        assert!(matches!(
            expect_success(Response::InvalidPassword),
            Err(ClientError::InvalidPassword)
        ));
        assert!(matches!(
            expect_success(Response::error("nope")),
            Err(ClientError::Rejected(message)) if message == "nope"
        ));
    }
}

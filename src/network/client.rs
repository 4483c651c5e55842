//! Network Client
//!
//! TCP client for request/response exchanges with other members. Each
//! request uses its own connection, so a slow lock grant never blocks an
//! unrelated release.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{read_message, write_message, GroupMessage};
use crate::error::{Error, Result};

/// Network client for connecting to peer members
#[derive(Debug, Clone)]
pub struct NetworkClient {
    /// Connection timeout
    connect_timeout: Duration,
    /// Default request timeout
    request_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a message to a peer and wait for response
    pub async fn send(&self, address: &str, message: GroupMessage) -> Result<GroupMessage> {
        self.send_with_timeout(address, message, self.request_timeout)
            .await
    }

    /// Send a message, bounding the whole exchange by `limit`
    pub async fn send_with_timeout(
        &self,
        address: &str,
        message: GroupMessage,
        limit: Duration,
    ) -> Result<GroupMessage> {
        match timeout(limit, self.send_inner(address, message)).await {
            Ok(inner_result) => inner_result,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    async fn send_inner(&self, address: &str, message: GroupMessage) -> Result<GroupMessage> {
        let mut stream = self.connect(address).await?;
        let (mut reader, mut writer) = stream.split();

        write_message(&mut writer, &message).await?;
        read_message(&mut reader).await
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_failure() {
        let client = NetworkClient::new(Duration::from_millis(100), Duration::from_millis(500));

        // Nothing listens on a port we just released
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = client
            .send(
                &address,
                GroupMessage::Heartbeat {
                    member: "node-1".to_string(),
                },
            )
            .await;
        assert!(matches!(
            result,
            Err(Error::ConnectionFailed { .. }) | Err(Error::ConnectionTimeout(_))
        ));
    }
}

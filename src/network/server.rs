//! Network Server
//!
//! TCP server accepting connections from other members. Every connection
//! gets its own task, and requests on one connection are answered in order.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};

use super::{read_message, write_message, GroupMessage};
use crate::error::{Error, Result};

/// Answers incoming messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, peer: &str, message: GroupMessage) -> GroupMessage;
}

/// Network server for group communication
pub struct NetworkServer {
    /// Bound listener, taken by `run`
    listener: Mutex<Option<TcpListener>>,
    /// Address actually bound
    local_addr: SocketAddr,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl NetworkServer {
    /// Bind the listening socket
    pub async fn bind(bind_address: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            shutdown: shutdown_tx,
        })
    }

    /// Address the server listens on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until stopped
    pub async fn run(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("network server already running".into()))?;
        tracing::info!("Group server listening on {}", self.local_addr);

        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let handler = handler.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, peer_addr.clone(), handler).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Group server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Handle a single connection
async fn handle_connection(
    socket: TcpStream,
    peer_addr: String,
    handler: Arc<dyn MessageHandler>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        match read_message(&mut reader).await {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);
                let response = handler.handle(&peer_addr, message).await;
                write_message(&mut writer, &response).await?;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message: {}", e);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkClient;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, _peer: &str, message: GroupMessage) -> GroupMessage {
            match message {
                GroupMessage::Heartbeat { member } => GroupMessage::HeartbeatAck { member },
                _ => GroupMessage::Error {
                    message: "unsupported".to_string(),
                },
            }
        }
    }

    #[tokio::test]
    async fn test_request_response() {
        let server = Arc::new(NetworkServer::bind("127.0.0.1:0").await.unwrap());
        let address = server.local_addr().to_string();
        let running = {
            let server = server.clone();
            tokio::spawn(async move { server.run(Arc::new(Echo)).await })
        };

        let client = NetworkClient::new(Duration::from_secs(1), Duration::from_secs(1));
        let reply = client
            .send(
                &address,
                GroupMessage::Heartbeat {
                    member: "a".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            reply,
            GroupMessage::HeartbeatAck {
                member: "a".to_string()
            }
        );

        server.stop();
        running.await.unwrap().unwrap();
    }
}

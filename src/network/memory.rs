//! In-process transport
//!
//! Every channel is a `tokio::io::duplex` pipe whose far end is served by a
//! [`Responder`] task, so the whole exchange runs without sockets.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use super::{stream_channel, ChannelReceiver, ChannelResult, ChannelSender, Connection, Connector};
use crate::core::{Error, Result, Target, DEFAULT_IDLE_TIMEOUT};
use crate::protocol::MAX_MESSAGE_SIZE;
use crate::server::{serve_connection, Responder};

/// Connects to responders registered by host name
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    servers: HashMap<String, Responder>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `responder` as the server for `host`, on any port
    pub fn with_server(mut self, host: impl Into<String>, responder: Responder) -> Self {
        self.servers.insert(host.into(), responder);
        self
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, target: &Target) -> Result<Box<dyn Connection>> {
        let responder = self
            .servers
            .get(&target.host)
            .cloned()
            .ok_or_else(|| Error::network(format!("no in-memory server for {}", target)))?;
        Ok(Box::new(MemoryConnection {
            responder,
            peer: target.to_string(),
        }))
    }
}

struct MemoryConnection {
    responder: Responder,
    peer: String,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_channel(
        &self,
    ) -> ChannelResult<(Box<dyn ChannelSender>, Box<dyn ChannelReceiver>)> {
        let (client, server) = tokio::io::duplex(MAX_MESSAGE_SIZE);
        let responder = self.responder.clone();
        let peer = self.peer.clone();

        tokio::spawn(async move {
            if let Err(e) = serve_connection(&responder, server, "memory", DEFAULT_IDLE_TIMEOUT).await {
                debug!(%peer, error = %e, "in-memory channel failed");
            }
        });

        let (sender, receiver) = stream_channel(client);
        Ok((Box::new(sender), Box::new(receiver)))
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, Response};
    use std::time::Duration;

    #[tokio::test]
    async fn test_memory_exchange() {
        let connector = MemoryConnector::new().with_server("local", Responder::new());
        let connection = connector.open(&Target::new("local", 443)).await.unwrap();
        assert_eq!(connection.peer(), "local:443");

        let (mut tx, mut rx) = connection.open_channel().await.unwrap();
        let request = Request::new();
        tx.send(&request.encode().unwrap()).await.unwrap();
        let bytes = rx.receive(Duration::from_secs(1)).await.unwrap();
        let response = Response::parse(&bytes).unwrap();
        assert_eq!(&response.nonce_echo[..], &request.nonce);
    }

    #[tokio::test]
    async fn test_unknown_host() {
        let connector = MemoryConnector::new();
        assert!(matches!(
            connector.open(&Target::new("nowhere", 443)).await,
            Err(Error::Network(_))
        ));
    }
}

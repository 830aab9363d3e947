use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use super::Responder;
use crate::core::{Error, Result, ServerConfig};
use crate::network::tls;
use crate::protocol::{tlv, MAX_MESSAGE_SIZE};

/// What happened on one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionSummary {
    /// Requests received, answered or not
    pub queries: u64,
    /// Requests answered
    pub answered: u64,
    /// Time from accept to close
    pub duration: Duration,
    /// Closed because the peer went quiet for longer than the idle timeout
    pub timed_out: bool,
}

/// Serves time requests on one stream until the peer closes it or stays
/// silent for `idle_timeout`.
///
/// Requests are framed by TLV record boundaries: a read that ends exactly on
/// a record boundary completes the request. A client must therefore hand each
/// request to the transport in one write, which TLS does by carrying it in a
/// single record. Padding that arrives in a later read is answered late, as a
/// separate request that fails to parse. t2 is taken as soon as the first
/// bytes of a request arrive.
pub async fn serve_connection<S>(
    responder: &Responder,
    mut stream: S,
    peer: &str,
    idle_timeout: Duration,
) -> Result<ConnectionSummary>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    let mut summary = ConnectionSummary::default();
    let mut buf = BytesMut::with_capacity(MAX_MESSAGE_SIZE);

    loop {
        let mut received_at = None;
        loop {
            let n = match timeout(idle_timeout, stream.read_buf(&mut buf)).await {
                Ok(read) => read?,
                Err(_) => {
                    debug!(peer, buffered = buf.len(), "idle timeout, closing connection");
                    summary.timed_out = true;
                    buf.clear();
                    break;
                }
            };
            if received_at.is_none() {
                received_at = Some(responder.now());
            }
            if n == 0 || !tlv::is_incomplete(&buf) || buf.len() >= MAX_MESSAGE_SIZE {
                break;
            }
        }

        let received_at = match received_at {
            Some(t2) if !buf.is_empty() => t2,
            _ => break,
        };
        summary.queries += 1;

        let request = buf.split();
        if let Some(response) = responder.handle(&request, received_at, peer) {
            stream.write_all(&response).await?;
            stream.flush().await?;
            summary.answered += 1;
        }
    }

    summary.duration = started.elapsed();
    Ok(summary)
}

/// TLS front end for a [`Responder`]
pub struct Server {
    acceptor: TlsAcceptor,
    responder: Responder,
    listen_addr: String,
    idle_timeout: Duration,
}

impl Server {
    /// Loads the certificate and key named in `config`
    pub fn new(config: &ServerConfig, responder: Responder) -> Result<Self> {
        let tls_config = tls::server_config(&config.cert_path, &config.key_path)?;
        Ok(Server {
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
            responder,
            listen_addr: config.listen_addr.clone(),
            idle_timeout: config.idle_timeout,
        })
    }

    /// Binds the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|e| Error::network(format!("failed to bind {}: {}", self.listen_addr, e)))
    }

    /// Binds and serves forever
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener`, one task per connection
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "TSQ server listening");

        loop {
            let (tcp, peer_addr) = listener.accept().await?;
            let acceptor = self.acceptor.clone();
            let responder = self.responder.clone();
            let idle_timeout = self.idle_timeout;

            tokio::spawn(async move {
                if let Err(e) = tcp.set_nodelay(true) {
                    debug!(peer = %peer_addr, error = %e, "failed to disable Nagle");
                }
                match timeout(idle_timeout, acceptor.accept(tcp)).await {
                    Ok(Ok(stream)) => handle_client(&responder, stream, peer_addr, idle_timeout).await,
                    Ok(Err(e)) => debug!(peer = %peer_addr, error = %e, "TLS handshake failed"),
                    Err(_) => debug!(peer = %peer_addr, "TLS handshake timed out"),
                }
            });
        }
    }
}

async fn handle_client<S>(responder: &Responder, stream: S, peer_addr: SocketAddr, idle_timeout: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let peer = peer_addr.to_string();
    debug!(peer = %peer, "connection established");
    match serve_connection(responder, stream, &peer, idle_timeout).await {
        Ok(summary) => info!(
            peer = %peer,
            queries = summary.queries,
            answered = summary.answered,
            duration_ms = summary.duration.as_secs_f64() * 1000.0,
            timed_out = summary.timed_out,
            "connection closed"
        ),
        Err(e) => debug!(peer = %peer, error = %e, "connection failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, Response};

    const IDLE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_serve_connection_answers_until_close() {
        let (mut client, server) = tokio::io::duplex(4096);
        let responder = Responder::new();
        let task = tokio::spawn(async move { serve_connection(&responder, server, "test", IDLE).await });

        for _ in 0..3 {
            let request = Request::new();
            client.write_all(&request.encode().unwrap()).await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = client.read(&mut buf).await.unwrap();
            let response = Response::parse(&buf[..n]).unwrap();
            assert_eq!(&response.nonce_echo[..], &request.nonce);
        }
        drop(client);

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.queries, 3);
        assert_eq!(summary.answered, 3);
    }

    #[tokio::test]
    async fn test_invalid_request_gets_no_reply() {
        let (mut client, server) = tokio::io::duplex(4096);
        let responder = Responder::new();
        let task = tokio::spawn(async move { serve_connection(&responder, server, "test", IDLE).await });

        client.write_all(&[tlv::TLV_PADDING, 0]).await.unwrap();
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.queries, 1);
        assert_eq!(summary.answered, 0);
    }

    #[tokio::test]
    async fn test_silent_client_is_disconnected() {
        let (mut client, server) = tokio::io::duplex(4096);
        let responder = Responder::new();
        let task = tokio::spawn(async move {
            serve_connection(&responder, server, "test", Duration::from_millis(100)).await
        });

        let summary = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("idle connection was held open")
            .unwrap()
            .unwrap();
        assert!(summary.timed_out);
        assert_eq!(summary.queries, 0);

        // The server side is gone; the client sees EOF
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_idle_timer_restarts_per_request() {
        let (mut client, server) = tokio::io::duplex(4096);
        let responder = Responder::new();
        let task = tokio::spawn(async move {
            serve_connection(&responder, server, "test", Duration::from_millis(300)).await
        });

        for _ in 0..2 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            client.write_all(&Request::new().encode().unwrap()).await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = client.read(&mut buf).await.unwrap();
            assert!(Response::parse(&buf[..n]).is_ok());
        }

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.answered, 2);
        assert!(summary.timed_out);
    }

    #[test]
    fn test_server_requires_certificate() {
        let config = ServerConfig {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
            ..Default::default()
        };
        assert!(Server::new(&config, Responder::new()).is_err());
    }
}

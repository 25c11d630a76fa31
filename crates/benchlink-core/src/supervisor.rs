//! Generic TCP/TLS connection supervision.
//!
//! [`ConnectionSupervisor`] owns the accept loop and a registry of live
//! per-connection handler tasks. Concrete servers supply a
//! [`ConnectionHandler`] and get the lifecycle guarantees for free: every
//! accepted connection is keepalive-tuned and tracked from the moment it is
//! accepted until its handler has fully exited, and
//! [`stop`](ConnectionSupervisor::stop) pauses accepting, cancels and drains
//! every tracked handler, and only then releases the bound port — a restart
//! on the same port can never race a lingering handler.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::keepalive;
use crate::tls::{self, TlsSettings};

/// One accepted connection, plaintext or TLS.
pub enum ServerStream {
    Plain(TcpStream),
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ServerStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ServerStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ServerStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ServerStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// One outgoing connection, plaintext or TLS. Used by the asynchronous
/// client and the broadcast receiver.
pub enum ClientStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Open an outgoing connection, keepalive-tuned and optionally TLS-wrapped.
pub(crate) async fn connect_stream(
    host: &str,
    port: u16,
    tls_settings: Option<&TlsSettings>,
) -> Result<ClientStream> {
    let stream = TcpStream::connect((host, port)).await?;
    keepalive::set_keepalive(&stream)?;
    match tls_settings {
        None => Ok(ClientStream::Plain(stream)),
        Some(settings) => {
            let config = tls::client_config(settings)?;
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|e| Error::Config {
                    message: format!("invalid TLS server name '{host}': {e}"),
                })?;
            let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
            let stream = connector.connect(server_name, stream).await?;
            Ok(ClientStream::Tls(Box::new(stream)))
        }
    }
}

/// Per-connection logic supplied by a concrete server.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Serve one connection to completion. An error return is logged by the
    /// supervisor and never affects other connections.
    async fn handle_connection(&self, stream: ServerStream, peer: SocketAddr) -> Result<()>;
}

type ClientTasks = Arc<Mutex<HashMap<u64, JoinHandle<()>>>>;

struct AcceptLoop {
    task: JoinHandle<TcpListener>,
    shutdown: oneshot::Sender<()>,
}

/// Accepts connections and supervises one handler task per connection.
pub struct ConnectionSupervisor {
    handler: Arc<dyn ConnectionHandler>,
    clients: ClientTasks,
    accept: Option<AcceptLoop>,
    local_addr: Option<SocketAddr>,
}

impl ConnectionSupervisor {
    pub fn new(handler: Arc<dyn ConnectionHandler>) -> Self {
        Self {
            handler,
            clients: Arc::new(Mutex::new(HashMap::new())),
            accept: None,
            local_addr: None,
        }
    }

    /// Bind and start accepting. Passing port 0 picks a free port; the bound
    /// address is returned and also available from
    /// [`local_addr`](Self::local_addr). The caller must call
    /// [`stop`](Self::stop) to release resources.
    pub async fn start(
        &mut self,
        host: &str,
        port: u16,
        tls_settings: Option<&TlsSettings>,
    ) -> Result<SocketAddr> {
        if self.accept.is_some() {
            return Err(Error::Config {
                message: "supervisor is already started".to_string(),
            });
        }
        let acceptor = match tls_settings {
            Some(settings) => Some(TlsAcceptor::from(Arc::new(tls::server_config(settings)?))),
            None => None,
        };
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, tls = acceptor.is_some(), "listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            self.handler.clone(),
            self.clients.clone(),
            shutdown_rx,
        ));
        self.accept = Some(AcceptLoop {
            task,
            shutdown: shutdown_tx,
        });
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop the server: pause accepting, cancel and drain every tracked
    /// handler task, then close the listening socket. No handler is
    /// mid-flight when the port is released.
    pub async fn stop(&mut self) {
        let Some(accept) = self.accept.take() else {
            return;
        };
        // Stop accepting but keep the port bound; the accept loop hands the
        // listener back so it is released only after the drain below.
        let _ = accept.shutdown.send(());
        let listener = match accept.task.await {
            Ok(listener) => Some(listener),
            Err(e) => {
                error!(error = %e, "accept loop panicked");
                None
            }
        };

        let tasks: Vec<(u64, JoinHandle<()>)> = {
            let mut clients = self.clients.lock().unwrap();
            clients.drain().collect()
        };
        debug!(count = tasks.len(), "cancelling connection handlers");
        for (_, task) in tasks {
            task.abort();
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(error = %e, "connection handler panicked during shutdown"),
            }
        }

        drop(listener);
        self.local_addr = None;
        info!("server stopped");
    }

    /// Number of currently tracked handler tasks.
    pub fn connection_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    handler: Arc<dyn ConnectionHandler>,
    clients: ClientTasks,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> TcpListener {
    let mut next_id: u64 = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("accept loop stopping");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = keepalive::set_keepalive(&stream) {
                            warn!(%peer, error = %e, "keepalive tuning failed");
                        }
                        next_id += 1;
                        spawn_client(
                            next_id,
                            stream,
                            peer,
                            acceptor.clone(),
                            handler.clone(),
                            &clients,
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
    listener
}

fn spawn_client(
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    handler: Arc<dyn ConnectionHandler>,
    clients: &ClientTasks,
) {
    debug!(%peer, "connection accepted");
    // The task waits for `tracked_tx` so it cannot try to remove itself from
    // the registry before it has been inserted: membership spans from accept
    // to full handler exit.
    let (tracked_tx, tracked_rx) = oneshot::channel::<()>();
    let registry = clients.clone();
    let task = tokio::spawn(async move {
        let _ = tracked_rx.await;
        let result = match acceptor {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls) => handler.handle_connection(ServerStream::Tls(tls), peer).await,
                Err(e) => {
                    warn!(%peer, error = %e, "TLS handshake failed");
                    Ok(())
                }
            },
            None => handler.handle_connection(ServerStream::Plain(stream), peer).await,
        };
        if let Err(e) = result {
            error!(%peer, error = %e, "connection closed with error");
        } else {
            debug!(%peer, "connection closed");
        }
        registry.lock().unwrap().remove(&id);
    });
    clients.lock().unwrap().insert(id, task);
    let _ = tracked_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Echoes bytes until the peer closes.
    struct EchoHandler;

    #[async_trait]
    impl ConnectionHandler for EchoHandler {
        async fn handle_connection(&self, mut stream: ServerStream, _peer: SocketAddr) -> Result<()> {
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                stream.write_all(&buf[..n]).await?;
            }
        }
    }

    /// Never returns on its own; only cancellation ends it.
    struct HangHandler;

    #[async_trait]
    impl ConnectionHandler for HangHandler {
        async fn handle_connection(&self, _stream: ServerStream, _peer: SocketAddr) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let mut sup = ConnectionSupervisor::new(Arc::new(EchoHandler));
        let addr = sup.start("127.0.0.1", 0, None).await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        sup.stop().await;
    }

    #[tokio::test]
    async fn test_stop_without_connections() {
        let mut sup = ConnectionSupervisor::new(Arc::new(EchoHandler));
        sup.start("127.0.0.1", 0, None).await.unwrap();
        sup.stop().await;
        // stop() is idempotent.
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drains_hanging_handlers_and_releases_port() {
        let mut sup = ConnectionSupervisor::new(Arc::new(HangHandler));
        let addr = sup.start("127.0.0.1", 0, None).await.unwrap();

        let mut conns = Vec::new();
        for _ in 0..5 {
            conns.push(TcpStream::connect(addr).await.unwrap());
        }
        // Wait for all handlers to be tracked.
        for _ in 0..100 {
            if sup.connection_count() == 5 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(sup.connection_count(), 5);

        sup.stop().await;
        assert_eq!(sup.connection_count(), 0);

        // The exact port is free again: a fresh supervisor can bind it.
        let mut again = ConnectionSupervisor::new(Arc::new(EchoHandler));
        again
            .start("127.0.0.1", addr.port(), None)
            .await
            .unwrap();
        again.stop().await;
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_server() {
        struct FailHandler;

        #[async_trait]
        impl ConnectionHandler for FailHandler {
            async fn handle_connection(&self, _stream: ServerStream, _peer: SocketAddr) -> Result<()> {
                Err(Error::Config {
                    message: "handler bug".to_string(),
                })
            }
        }

        let mut sup = ConnectionSupervisor::new(Arc::new(FailHandler));
        let addr = sup.start("127.0.0.1", 0, None).await.unwrap();

        // Both connections are accepted even though handlers fail.
        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        sup.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_an_error() {
        let mut sup = ConnectionSupervisor::new(Arc::new(EchoHandler));
        sup.start("127.0.0.1", 0, None).await.unwrap();
        let err = sup.start("127.0.0.1", 0, None).await.unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        sup.stop().await;
    }
}

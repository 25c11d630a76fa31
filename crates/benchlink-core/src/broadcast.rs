//! One-to-many broadcast fan-out.
//!
//! A much simpler sibling of the RPC server built on the same connection
//! supervisor: subscribers connect, send one line naming their channel, and
//! from then on receive every value published to that channel as one
//! encoded line. There is no backchannel and no handshake beyond the
//! channel name.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::codec::{self, Value};
use crate::error::{Error, Result};
use crate::rpc::protocol;
use crate::supervisor::{connect_stream, ConnectionHandler, ConnectionSupervisor, ServerStream};
use crate::task::SupervisedTask;
use crate::tls::TlsSettings;

type Subscribers = HashMap<String, HashMap<u64, tokio::sync::mpsc::UnboundedSender<Arc<str>>>>;

struct BroadcastInner {
    subscribers: Mutex<Subscribers>,
    next_subscriber: Mutex<u64>,
}

impl BroadcastInner {
    fn subscribe(
        &self,
        channel: &str,
        tx: tokio::sync::mpsc::UnboundedSender<Arc<str>>,
    ) -> u64 {
        let id = {
            let mut next = self.next_subscriber.lock().unwrap();
            *next += 1;
            *next
        };
        self.subscribers
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .insert(id, tx);
        id
    }

    fn unsubscribe(&self, channel: &str, id: u64) {
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(members) = subscribers.get_mut(channel) {
            members.remove(&id);
            if members.is_empty() {
                subscribers.remove(channel);
            }
        }
    }
}

#[async_trait]
impl ConnectionHandler for BroadcastInner {
    async fn handle_connection(&self, stream: ServerStream, peer: SocketAddr) -> Result<()> {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let channel = line.trim_end_matches('\n');
        if channel.is_empty() {
            return Ok(());
        }
        debug!(%peer, channel, "subscriber joined");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let id = self.subscribe(channel, tx);
        let result = async {
            let mut probe = [0u8; 32];
            loop {
                tokio::select! {
                    message = rx.recv() => {
                        match message {
                            Some(message) => {
                                writer.write_all(message.as_bytes()).await?;
                                writer.flush().await?;
                            }
                            None => return Ok(()),
                        }
                    }
                    // Subscribers never speak again; data or EOF here means
                    // the connection is done.
                    read = tokio::io::AsyncReadExt::read(reader.get_mut(), &mut probe) => {
                        let _ = read?;
                        return Ok(());
                    }
                }
            }
        }
        .await;
        self.unsubscribe(channel, id);
        debug!(%peer, channel, "subscriber left");
        result
    }
}

/// Publishes values to all subscribers of a channel.
pub struct Broadcaster {
    inner: Arc<BroadcastInner>,
    supervisor: ConnectionSupervisor,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let inner = Arc::new(BroadcastInner {
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: Mutex::new(0),
        });
        let supervisor = ConnectionSupervisor::new(inner.clone());
        Self { inner, supervisor }
    }

    pub async fn start(
        &mut self,
        host: &str,
        port: u16,
        tls_settings: Option<&TlsSettings>,
    ) -> Result<SocketAddr> {
        self.supervisor.start(host, port, tls_settings).await
    }

    pub async fn stop(&mut self) {
        self.supervisor.stop().await;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.supervisor.local_addr()
    }

    /// Send a value to every subscriber of `channel`. Subscribers whose
    /// connection has gone away are dropped from the channel.
    pub fn broadcast(&self, channel: &str, value: &Value) -> Result<()> {
        let line: Arc<str> = protocol::encode_line(value)?.into();
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        if let Some(members) = subscribers.get_mut(channel) {
            members.retain(|_, tx| tx.send(line.clone()).is_ok());
            if members.is_empty() {
                subscribers.remove(channel);
            }
        }
        Ok(())
    }
}

/// Subscribes to one channel and invokes a callback per received value.
pub struct Receiver {
    task: Option<SupervisedTask>,
}

impl Receiver {
    pub async fn connect<F>(
        host: &str,
        port: u16,
        channel: &str,
        mut notify: F,
        tls_settings: Option<&TlsSettings>,
    ) -> Result<Self>
    where
        F: FnMut(Value) + Send + 'static,
    {
        if channel.contains('\n') {
            return Err(Error::Config {
                message: "channel names cannot contain newlines".to_string(),
            });
        }
        let stream = connect_stream(host, port, tls_settings).await?;
        let (read_half, mut write_half) = tokio::io::split(stream);
        write_half
            .write_all(format!("{channel}\n").as_bytes())
            .await?;
        write_half.flush().await?;

        let mut reader = BufReader::new(read_half);
        let task = SupervisedTask::spawn("broadcast-receiver", async move {
            // Keep the write half alive for the lifetime of the
            // subscription; dropping it would half-close the socket.
            let _write_half = write_half;
            loop {
                let mut line = String::new();
                let n = reader.read_line(&mut line).await?;
                if n == 0 {
                    return Ok(());
                }
                let value = codec::decode(line.trim_end_matches('\n'))?;
                notify(value);
            }
        });
        Ok(Self { task: Some(task) })
    }

    pub async fn close(mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task.stop().await,
            None => Ok(()),
        }
    }
}

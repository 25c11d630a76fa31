//! Asynchronous RPC client.
//!
//! Same wire contract as the blocking client, but calls suspend only their
//! own coroutine: any number of calls may be outstanding concurrently on
//! one connection, correlated by explicit per-call identities. One reader
//! task resolves responses against a pending-call table; one writer task
//! owns the write half so an envelope is always written as a unit even when
//! the calling future is cancelled mid-send.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::codec::Value;
use crate::error::{Error, Result};
use crate::rpc::protocol;
use crate::rpc::Bind;
use crate::supervisor::{connect_stream, ClientStream};
use crate::task::SupervisedTask;
use crate::tls::TlsSettings;

#[derive(Debug)]
struct PendingCall {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

/// Pending-call table, or the reason the connection died. Mutated only from
/// short critical sections; at most one entry per identity, and identities
/// are never reused while pending.
#[derive(Debug)]
enum State {
    Alive(HashMap<u64, PendingCall>),
    Dead(String),
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
}

#[derive(Debug)]
struct MethodCatalog {
    names: HashSet<String>,
    listing: Value,
}

/// Single-connection asynchronous RPC client.
#[derive(Debug)]
pub struct AsyncClient {
    shared: Arc<Shared>,
    writer_tx: mpsc::UnboundedSender<String>,
    reader_task: Option<SupervisedTask>,
    writer_task: Option<SupervisedTask>,
    next_id: AtomicU64,
    methods: tokio::sync::Mutex<Option<MethodCatalog>>,
}

impl AsyncClient {
    /// Connect, verify the protocol banner, and bind a target. The
    /// asynchronous client must bind at connect time; [`Bind::Deferred`] is
    /// rejected.
    pub async fn connect(
        host: &str,
        port: u16,
        bind: Bind<'_>,
        tls_settings: Option<&TlsSettings>,
    ) -> Result<Self> {
        let bind_request = match bind {
            Bind::Target(name) => protocol::bind_request(name),
            Bind::Auto => protocol::bind_auto_request(),
            Bind::Deferred => {
                return Err(Error::Config {
                    message: "the asynchronous client must bind a target at connect time"
                        .to_string(),
                });
            }
        };
        let stream = connect_stream(host, port, tls_settings).await?;
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let mut banner = String::new();
        reader.read_line(&mut banner).await?;
        if banner != protocol::BANNER {
            return Err(Error::Handshake {
                message: format!("unexpected protocol banner {banner:?}"),
            });
        }
        protocol::write_envelope(&mut write_half, &bind_request).await?;
        let reply = protocol::read_envelope(&mut reader)
            .await?
            .ok_or(Error::ConnectionClosed)?;
        protocol::expect_handshake_ok(&reply)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(State::Alive(HashMap::new())),
        });
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let reader_task = SupervisedTask::spawn("rpc-client-reader", {
            let shared = shared.clone();
            read_loop(reader, shared)
        });
        let writer_task = SupervisedTask::spawn("rpc-client-writer", {
            let shared = shared.clone();
            write_loop(write_half, writer_rx, shared)
        });

        Ok(Self {
            shared,
            writer_tx,
            reader_task: Some(reader_task),
            writer_task: Some(writer_task),
            next_id: AtomicU64::new(1),
            methods: tokio::sync::Mutex::new(None),
        })
    }

    /// Invoke a remote method; suspends only until this call's own response
    /// arrives. Unknown method names fail locally against the cached
    /// catalog.
    pub async fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value> {
        self.ensure_methods().await?;
        let known = {
            let guard = self.methods.lock().await;
            guard
                .as_ref()
                .map(|catalog| catalog.names.contains(name))
                .unwrap_or(false)
        };
        if !known {
            return Err(Error::UnknownMethod {
                method: name.to_string(),
            });
        }
        self.request(name, |id| protocol::call_request(id, name, args, kwargs))
            .await
    }

    /// The target's introspection catalog (cached after the first fetch).
    pub async fn method_list(&self) -> Result<Value> {
        self.ensure_methods().await?;
        let guard = self.methods.lock().await;
        guard
            .as_ref()
            .map(|catalog| catalog.listing.clone())
            .ok_or_else(|| Error::Config {
                message: "method catalog unavailable".to_string(),
            })
    }

    /// Issue the in-band terminate action.
    pub async fn terminate(&self) -> Result<()> {
        self.request("terminate", protocol::terminate_request)
            .await
            .map(|_| ())
    }

    /// Stop the reader and writer tasks and release the connection. Always
    /// safe, also after a remote error.
    pub async fn close_rpc(mut self) {
        fail_all(&self.shared, &Error::Dead {
            message: "client closed".to_string(),
        });
        if let Some(writer) = self.writer_task.take() {
            let _ = writer.stop().await;
        }
        if let Some(reader) = self.reader_task.take() {
            let _ = reader.stop().await;
        }
    }

    async fn ensure_methods(&self) -> Result<()> {
        let mut guard = self.methods.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let listing = self
            .request("get_rpc_method_list", protocol::method_list_request)
            .await?;
        let names = listing
            .as_dict()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|(k, _)| k.as_str().map(str::to_string))
                    .collect::<HashSet<_>>()
            })
            .ok_or_else(|| Error::Decode {
                offset: 0,
                message: "malformed method catalog".to_string(),
            })?;
        *guard = Some(MethodCatalog { names, listing });
        Ok(())
    }

    /// Register a pending slot, enqueue the envelope, and await the slot.
    async fn request(&self, method: &str, build: impl FnOnce(u64) -> Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = protocol::encode_line(&build(id))?;
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.state.lock().unwrap();
            match &mut *state {
                State::Alive(pending) => {
                    pending.insert(
                        id,
                        PendingCall {
                            method: method.to_string(),
                            tx,
                        },
                    );
                }
                State::Dead(reason) => {
                    return Err(Error::Dead {
                        message: reason.clone(),
                    });
                }
            }
        }
        debug!(method, id, "call issued");
        if self.writer_tx.send(line).is_err() {
            if let State::Alive(pending) = &mut *self.shared.state.lock().unwrap() {
                pending.remove(&id);
            }
            return Err(Error::Dead {
                message: "client is closed".to_string(),
            });
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Dead {
                message: "connection failed while the call was pending".to_string(),
            }),
        }
    }
}

async fn read_loop(
    mut reader: BufReader<ReadHalf<ClientStream>>,
    shared: Arc<Shared>,
) -> Result<()> {
    loop {
        match protocol::read_envelope(&mut reader).await {
            Ok(Some(envelope)) => match protocol::parse_response(envelope) {
                Ok(response) => resolve(&shared, response),
                Err(e) => {
                    fail_all(&shared, &e);
                    return Ok(());
                }
            },
            Ok(None) => {
                // The server went away between envelopes; calls still in
                // flight got no well-formed response.
                fail_all(
                    &shared,
                    &Error::Decode {
                        offset: 0,
                        message: "connection closed before a response was received".to_string(),
                    },
                );
                return Ok(());
            }
            Err(e) => {
                fail_all(&shared, &e);
                return Ok(());
            }
        }
    }
}

async fn write_loop(
    mut writer: WriteHalf<ClientStream>,
    mut rx: mpsc::UnboundedReceiver<String>,
    shared: Arc<Shared>,
) -> Result<()> {
    while let Some(line) = rx.recv().await {
        let outcome = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = outcome {
            let err = Error::from(e);
            fail_all(&shared, &err);
            return Err(err);
        }
    }
    Ok(())
}

fn resolve(shared: &Arc<Shared>, response: protocol::Response) {
    let entry = {
        let mut state = shared.state.lock().unwrap();
        match &mut *state {
            State::Alive(pending) => pending.remove(&response.id),
            State::Dead(_) => None,
        }
    };
    let Some(entry) = entry else {
        warn!(id = response.id, "response with unknown call identity");
        return;
    };
    let result = response
        .outcome
        .map_err(|exception| exception.into_error(&entry.method));
    let _ = entry.tx.send(result);
}

/// Reject every pending call with (a copy of) `err` and mark the connection
/// dead so later calls fail fast instead of hanging.
fn fail_all(shared: &Arc<Shared>, err: &Error) {
    let pending = {
        let mut state = shared.state.lock().unwrap();
        match &mut *state {
            State::Alive(pending) => {
                let drained = std::mem::take(pending);
                *state = State::Dead(err.to_string());
                drained
            }
            State::Dead(_) => return,
        }
    };
    for (_, entry) in pending {
        let _ = entry.tx.send(Err(replicate(err)));
    }
}

// Errors are not clonable; rebuild the data-carrying variants and collapse
// the rest into a connection-dead report.
fn replicate(err: &Error) -> Error {
    match err {
        Error::Decode { offset, message } => Error::Decode {
            offset: *offset,
            message: message.clone(),
        },
        Error::EnvelopeTooLarge { limit } => Error::EnvelopeTooLarge { limit: *limit },
        Error::ConnectionClosed => Error::ConnectionClosed,
        other => Error::Dead {
            message: other.to_string(),
        },
    }
}

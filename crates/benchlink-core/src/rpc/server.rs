//! RPC server: session handshake, target binding, and call dispatch.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::codec::Value;
use crate::error::Result;
use crate::rpc::protocol::{self, ExceptionKind, RemoteException};
use crate::rpc::target::{CallArgs, InvokeOutcome, Target};
use crate::supervisor::{ConnectionHandler, ConnectionSupervisor, ServerStream};
use crate::tls::TlsSettings;

/// The immutable registry of exposed objects, built before the server
/// starts.
pub type TargetMap = BTreeMap<String, Arc<Target>>;

/// Serves method calls on registered targets.
///
/// Each connection runs a handshake (protocol banner, then target binding or
/// listing) and a strictly sequential request/response loop. Connection
/// failures never affect other sessions.
pub struct RpcServer {
    inner: Arc<ServerInner>,
    supervisor: ConnectionSupervisor,
}

struct ServerInner {
    targets: TargetMap,
    builtin_terminate: bool,
    terminate: Notify,
}

impl RpcServer {
    /// `builtin_terminate` enables the in-band `terminate` action, a
    /// privileged shortcut trusted because it arrives over the same
    /// authenticated connection as ordinary calls.
    pub fn new(targets: TargetMap, builtin_terminate: bool) -> Self {
        let inner = Arc::new(ServerInner {
            targets,
            builtin_terminate,
            terminate: Notify::new(),
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

    /// Resolves once a client has issued the in-band `terminate` action.
    pub async fn wait_terminate(&self) {
        self.inner.terminate.notified().await;
    }
}

enum HandshakeReply {
    Bind(Arc<Target>),
    Listing(Value),
}

impl ServerInner {
    fn resolve_handshake(
        &self,
        handshake: &Value,
    ) -> std::result::Result<HandshakeReply, RemoteException> {
        let malformed = || {
            RemoteException::new(
                ExceptionKind::CallFailed,
                "ProtocolError",
                "malformed handshake envelope",
                String::new(),
            )
        };
        let op = handshake
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(malformed)?;
        match op {
            "bind" => {
                let name = handshake
                    .get("target")
                    .and_then(Value::as_str)
                    .ok_or_else(malformed)?;
                match self.targets.get(name) {
                    Some(target) => Ok(HandshakeReply::Bind(target.clone())),
                    None => Err(RemoteException::new(
                        ExceptionKind::CallFailed,
                        "UnknownTargetError",
                        format!("no target named '{name}' is registered"),
                        String::new(),
                    )),
                }
            }
            "bind_auto" => {
                if self.targets.len() == 1 {
                    let target = self.targets.values().next().cloned();
                    match target {
                        Some(target) => Ok(HandshakeReply::Bind(target)),
                        None => Err(malformed()),
                    }
                } else {
                    Err(RemoteException::new(
                        ExceptionKind::CallFailed,
                        "AutoTargetError",
                        format!(
                            "automatic target selection requires exactly one registered target, found {}",
                            self.targets.len()
                        ),
                        String::new(),
                    ))
                }
            }
            "list_targets" => Ok(HandshakeReply::Listing(protocol::target_listing(
                self.targets
                    .iter()
                    .map(|(name, target)| (name.as_str(), target.description())),
            ))),
            other => Err(RemoteException::new(
                ExceptionKind::CallFailed,
                "ProtocolError",
                format!("unknown handshake operation '{other}'"),
                String::new(),
            )),
        }
    }

    /// Process one request and return the fully framed response line.
    ///
    /// Encoding happens here, before anything touches the socket: a return
    /// value the codec refuses becomes an error envelope and the connection
    /// stays usable.
    async fn respond(&self, target: &Arc<Target>, request: Value) -> String {
        let id = request.get("id").and_then(Value::as_int).unwrap_or(0) as u64;
        let envelope = self.process_request(target, id, request).await;
        match protocol::encode_line(&envelope) {
            Ok(line) => line,
            Err(e) => {
                let exception = RemoteException::new(
                    ExceptionKind::Unserializable,
                    "TypeError",
                    e.to_string(),
                    "return value could not be serialized for transport".to_string(),
                );
                match protocol::encode_line(&protocol::error_response(id, &exception)) {
                    Ok(line) => line,
                    Err(e) => {
                        // Cannot happen: the error envelope is made of plain
                        // strings. Answer something well-formed regardless.
                        error!(error = %e, "error envelope failed to encode");
                        format!(
                            "{{\"status\": \"error\", \"id\": {id}, \"exception\": \
                             {{\"kind\": \"call_failed\", \"class\": \"InternalError\", \
                             \"message\": \"response encoding failed\", \"traceback\": \"\"}}}}\n"
                        )
                    }
                }
            }
        }
    }

    async fn process_request(&self, target: &Arc<Target>, id: u64, request: Value) -> Value {
        let malformed = |what: &str| {
            protocol::error_response(
                id,
                &RemoteException::new(
                    ExceptionKind::CallFailed,
                    "ProtocolError",
                    format!("malformed request: {what}"),
                    String::new(),
                ),
            )
        };
        let Some(action) = request.get("action").and_then(Value::as_str) else {
            return malformed("missing 'action'");
        };
        match action {
            "call" => {
                let Some(name) = request.get("name").and_then(Value::as_str) else {
                    return malformed("missing method name");
                };
                let Some(args) = request.get("args").and_then(Value::as_seq) else {
                    return malformed("missing positional arguments");
                };
                let mut kwargs = Vec::new();
                if let Some(entries) = request.get("kwargs").and_then(Value::as_dict) {
                    for (key, value) in entries {
                        match key.as_str() {
                            Some(key) => kwargs.push((key.to_string(), value.clone())),
                            None => return malformed("keyword argument names must be strings"),
                        }
                    }
                }
                debug!(method = name, "dispatching call");
                let call = CallArgs {
                    args: args.to_vec(),
                    kwargs,
                };
                match target.invoke(name, call).await {
                    InvokeOutcome::Ok(ret) => protocol::ok_response(id, ret),
                    InvokeOutcome::UnknownMethod => protocol::error_response(
                        id,
                        &RemoteException::new(
                            ExceptionKind::UnknownMethod,
                            "AttributeError",
                            format!("target has no method '{name}'"),
                            String::new(),
                        ),
                    ),
                    InvokeOutcome::Fault(fault) => {
                        warn!(method = name, fault = %fault, "call raised");
                        protocol::error_response(
                            id,
                            &RemoteException::new(
                                ExceptionKind::CallFailed,
                                fault.class.clone(),
                                fault.message.clone(),
                                format!("method '{name}' raised {fault}"),
                            ),
                        )
                    }
                }
            }
            "get_rpc_method_list" => protocol::ok_response(id, target.method_list()),
            "terminate" => {
                if self.builtin_terminate {
                    info!("terminate requested over RPC");
                    self.terminate.notify_one();
                    protocol::ok_response(id, Value::None)
                } else {
                    protocol::error_response(
                        id,
                        &RemoteException::new(
                            ExceptionKind::CallFailed,
                            "TerminateError",
                            "this server does not accept the terminate action",
                            String::new(),
                        ),
                    )
                }
            }
            other => malformed(&format!("unknown action '{other}'")),
        }
    }
}

#[async_trait]
impl ConnectionHandler for ServerInner {
    async fn handle_connection(&self, stream: ServerStream, peer: SocketAddr) -> Result<()> {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        writer.write_all(protocol::BANNER.as_bytes()).await?;
        writer.flush().await?;

        let Some(handshake) = protocol::read_envelope(&mut reader).await? else {
            debug!(%peer, "peer left before the handshake");
            return Ok(());
        };
        let target = match self.resolve_handshake(&handshake) {
            Ok(HandshakeReply::Bind(target)) => {
                protocol::write_envelope(&mut writer, &protocol::handshake_ok()).await?;
                target
            }
            Ok(HandshakeReply::Listing(listing)) => {
                protocol::write_envelope(&mut writer, &listing).await?;
                return Ok(());
            }
            Err(exception) => {
                debug!(%peer, reason = %exception.message, "handshake rejected");
                protocol::write_envelope(&mut writer, &protocol::handshake_error(&exception))
                    .await?;
                return Ok(());
            }
        };
        debug!(%peer, "session bound");

        // Strictly sequential: the response for one request is fully written
        // before the next request is read.
        loop {
            let Some(request) = protocol::read_envelope(&mut reader).await? else {
                return Ok(());
            };
            let line = self.respond(&target, request).await;
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
    }
}

/// Run an RPC server until a termination signal or an in-band `terminate`
/// arrives, then perform the full shutdown sequence.
#[cfg(unix)]
pub async fn serve_forever(
    targets: TargetMap,
    host: &str,
    port: u16,
    tls_settings: Option<&TlsSettings>,
) -> Result<()> {
    use crate::signal::SignalBridge;

    let mut bridge = SignalBridge::new()?;
    let mut server = RpcServer::new(targets, true);
    server.start(host, port, tls_settings).await?;
    tokio::select! {
        _ = bridge.wait_terminate() => {}
        _ = server.wait_terminate() => {
            info!("terminate requested by client");
        }
    }
    server.stop().await;
    Ok(())
}

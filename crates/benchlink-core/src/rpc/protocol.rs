//! Wire protocol shared by the RPC server and both clients.
//!
//! Every exchange is one self-describing envelope: a codec-encoded value on
//! a single `\n`-terminated line. The server speaks first with
//! [`BANNER`], so a client on the wrong protocol fails during the handshake
//! instead of deep inside a call.

use std::io::{BufRead, Write};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{self, Value};
use crate::error::{Error, Result};

/// Protocol identification sent by the server on connect.
pub const BANNER: &str = "benchlink-rpc 1\n";

/// Hard cap on one envelope; larger lines are connection-fatal.
pub const MAX_ENVELOPE_BYTES: usize = 4 * 1024 * 1024;

/// Read one envelope. `Ok(None)` means the peer closed cleanly between
/// envelopes; EOF in the middle of a line is a decode error so a peer dying
/// mid-reply is reported, never silently retried.
pub async fn read_envelope<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Value>> {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    decode_line(line)
}

/// Write one envelope and flush it.
pub async fn write_envelope<W: AsyncWrite + Unpin>(writer: &mut W, value: &Value) -> Result<()> {
    let line = encode_line(value)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Blocking variant of [`read_envelope`] for the synchronous client.
pub fn read_envelope_blocking<R: BufRead>(reader: &mut R) -> Result<Option<Value>> {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line)?;
    if n == 0 {
        return Ok(None);
    }
    decode_line(line)
}

/// Blocking variant of [`write_envelope`].
pub fn write_envelope_blocking<W: Write>(writer: &mut W, value: &Value) -> Result<()> {
    let line = encode_line(value)?;
    writer.write_all(line.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Encode an envelope into its framed line form.
pub fn encode_line(value: &Value) -> Result<String> {
    let mut line = codec::encode(value)?;
    line.push('\n');
    Ok(line)
}

fn decode_line(mut line: Vec<u8>) -> Result<Option<Value>> {
    if line.len() > MAX_ENVELOPE_BYTES {
        return Err(Error::EnvelopeTooLarge {
            limit: MAX_ENVELOPE_BYTES,
        });
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    } else {
        return Err(Error::Decode {
            offset: line.len(),
            message: "connection closed in the middle of an envelope".to_string(),
        });
    }
    let text = std::str::from_utf8(&line).map_err(|e| Error::Decode {
        offset: e.valid_up_to(),
        message: "envelope is not valid UTF-8".to_string(),
    })?;
    codec::decode(text).map(Some)
}

/// How a remote failure should be re-raised on the client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    /// The target has no method of the requested name.
    UnknownMethod,
    /// The method returned a value the codec refused to encode.
    Unserializable,
    /// The method (or the handshake) raised.
    CallFailed,
}

impl ExceptionKind {
    fn as_str(self) -> &'static str {
        match self {
            ExceptionKind::UnknownMethod => "unknown_method",
            ExceptionKind::Unserializable => "unserializable",
            ExceptionKind::CallFailed => "call_failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "unknown_method" => ExceptionKind::UnknownMethod,
            "unserializable" => ExceptionKind::Unserializable,
            _ => ExceptionKind::CallFailed,
        }
    }
}

/// Structured description of a remote failure.
///
/// The original exception type is never reconstructed locally; callers
/// pattern-match on the kind and read class/message/traceback as data.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteException {
    pub kind: ExceptionKind,
    pub class: String,
    pub message: String,
    pub traceback: String,
}

impl RemoteException {
    pub fn new(
        kind: ExceptionKind,
        class: impl Into<String>,
        message: impl Into<String>,
        traceback: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            class: class.into(),
            message: message.into(),
            traceback: traceback.into(),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Dict(vec![
            (Value::from("kind"), Value::from(self.kind.as_str())),
            (Value::from("class"), Value::from(self.class.as_str())),
            (Value::from("message"), Value::from(self.message.as_str())),
            (
                Value::from("traceback"),
                Value::from(self.traceback.as_str()),
            ),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let field = |name: &str| -> Result<String> {
            value
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::Decode {
                    offset: 0,
                    message: format!("exception description is missing '{name}'"),
                })
        };
        Ok(Self {
            kind: ExceptionKind::parse(&field("kind")?),
            class: field("class")?,
            message: field("message")?,
            traceback: field("traceback")?,
        })
    }

    /// Re-raise as the local error for a call to `method`.
    pub fn into_error(self, method: &str) -> Error {
        match self.kind {
            ExceptionKind::UnknownMethod => Error::UnknownMethod {
                method: method.to_string(),
            },
            ExceptionKind::Unserializable => Error::Unserializable {
                message: self.message,
            },
            ExceptionKind::CallFailed => Error::RemoteFault {
                class: self.class,
                message: self.message,
                traceback: self.traceback,
            },
        }
    }
}

// Handshake envelopes.

pub fn bind_request(target: &str) -> Value {
    Value::Dict(vec![
        (Value::from("op"), Value::from("bind")),
        (Value::from("target"), Value::from(target)),
    ])
}

pub fn bind_auto_request() -> Value {
    Value::Dict(vec![(Value::from("op"), Value::from("bind_auto"))])
}

pub fn list_targets_request() -> Value {
    Value::Dict(vec![(Value::from("op"), Value::from("list_targets"))])
}

pub fn handshake_ok() -> Value {
    Value::Dict(vec![(Value::from("status"), Value::from("ok"))])
}

pub fn handshake_error(exception: &RemoteException) -> Value {
    Value::Dict(vec![
        (Value::from("status"), Value::from("error")),
        (Value::from("exception"), exception.to_value()),
    ])
}

pub fn target_listing<'a>(entries: impl Iterator<Item = (&'a str, &'a str)>) -> Value {
    let targets = entries
        .map(|(name, description)| (Value::from(name), Value::from(description)))
        .collect();
    Value::Dict(vec![
        (Value::from("status"), Value::from("ok")),
        (Value::from("targets"), Value::Dict(targets)),
    ])
}

/// Check a handshake reply, turning any reported failure into
/// [`Error::Handshake`].
pub fn expect_handshake_ok(reply: &Value) -> Result<()> {
    match reply.get("status").and_then(Value::as_str) {
        Some("ok") => Ok(()),
        Some("error") => {
            let message = reply
                .get("exception")
                .and_then(|e| RemoteException::from_value(e).ok())
                .map(|e| format!("{}: {}", e.class, e.message))
                .unwrap_or_else(|| "unspecified handshake failure".to_string());
            Err(Error::Handshake { message })
        }
        _ => Err(Error::Handshake {
            message: "malformed handshake reply".to_string(),
        }),
    }
}

/// Extract `(name, description)` pairs from a target-listing reply.
pub fn parse_target_listing(reply: &Value) -> Result<Vec<(String, String)>> {
    expect_handshake_ok(reply)?;
    let entries = reply
        .get("targets")
        .and_then(Value::as_dict)
        .ok_or_else(|| Error::Decode {
            offset: 0,
            message: "target listing is missing 'targets'".to_string(),
        })?;
    entries
        .iter()
        .map(|(name, description)| match (name.as_str(), description.as_str()) {
            (Some(n), Some(d)) => Ok((n.to_string(), d.to_string())),
            _ => Err(Error::Decode {
                offset: 0,
                message: "malformed target listing entry".to_string(),
            }),
        })
        .collect()
}

// Request envelopes.

pub fn call_request(id: u64, name: &str, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Value {
    Value::Dict(vec![
        (Value::from("action"), Value::from("call")),
        (Value::from("id"), Value::Int(id as i64)),
        (Value::from("name"), Value::from(name)),
        (Value::from("args"), Value::Tuple(args)),
        (
            Value::from("kwargs"),
            Value::Dict(
                kwargs
                    .into_iter()
                    .map(|(k, v)| (Value::Str(k), v))
                    .collect(),
            ),
        ),
    ])
}

pub fn method_list_request(id: u64) -> Value {
    Value::Dict(vec![
        (Value::from("action"), Value::from("get_rpc_method_list")),
        (Value::from("id"), Value::Int(id as i64)),
    ])
}

pub fn terminate_request(id: u64) -> Value {
    Value::Dict(vec![
        (Value::from("action"), Value::from("terminate")),
        (Value::from("id"), Value::Int(id as i64)),
    ])
}

// Response envelopes.

pub fn ok_response(id: u64, ret: Value) -> Value {
    Value::Dict(vec![
        (Value::from("status"), Value::from("ok")),
        (Value::from("id"), Value::Int(id as i64)),
        (Value::from("ret"), ret),
    ])
}

pub fn error_response(id: u64, exception: &RemoteException) -> Value {
    Value::Dict(vec![
        (Value::from("status"), Value::from("error")),
        (Value::from("id"), Value::Int(id as i64)),
        (Value::from("exception"), exception.to_value()),
    ])
}

/// A parsed response envelope: the call id it answers plus the outcome.
pub struct Response {
    pub id: u64,
    pub outcome: std::result::Result<Value, RemoteException>,
}

pub fn parse_response(envelope: Value) -> Result<Response> {
    let id = envelope
        .get("id")
        .and_then(Value::as_int)
        .ok_or_else(|| Error::Decode {
            offset: 0,
            message: "response envelope is missing 'id'".to_string(),
        })? as u64;
    match envelope.get("status").and_then(Value::as_str) {
        Some("ok") => {
            let ret = envelope.get("ret").cloned().ok_or_else(|| Error::Decode {
                offset: 0,
                message: "ok response is missing 'ret'".to_string(),
            })?;
            Ok(Response {
                id,
                outcome: Ok(ret),
            })
        }
        Some("error") => {
            let exception = envelope
                .get("exception")
                .ok_or_else(|| Error::Decode {
                    offset: 0,
                    message: "error response is missing 'exception'".to_string(),
                })
                .and_then(RemoteException::from_value)?;
            Ok(Response {
                id,
                outcome: Err(exception),
            })
        }
        _ => Err(Error::Decode {
            offset: 0,
            message: "response envelope has no valid 'status'".to_string(),
        }),
    }
}

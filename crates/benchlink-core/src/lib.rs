//! benchlink — RPC and process-lifecycle primitives for distributed control
//! processes.
//!
//! Lab-instrument controllers and similar long-running processes use this
//! crate to expose objects to other processes over TCP, with optional
//! mutual-TLS authentication and graceful shutdown under process signals.
//!
//! The pieces compose bottom-up: [`tls`] builds mutual-authentication
//! configs, [`signal`] bridges SIGINT/SIGTERM into the event loop,
//! [`supervisor`] runs the accept loop with tracked, cancellation-safe
//! per-connection tasks, and [`rpc`] puts the call-dispatch engine and both
//! clients on top. [`broadcast`] reuses the same substrate for one-to-many
//! fan-out, and [`codec`] is the textual object serialization everything
//! speaks on the wire.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use benchlink::rpc::{Param, RpcServer, Target, TargetMap};
//! use benchlink::Value;
//!
//! #[tokio::main]
//! async fn main() -> benchlink::Result<()> {
//!     let echo = Target::new("demo target").method(
//!         "echo",
//!         vec![Param::required("x")],
//!         "Return the argument unchanged.",
//!         |call| async move { Ok(call.args.into_iter().next().unwrap_or(Value::None)) },
//!     );
//!     let targets = TargetMap::from([("demo".to_string(), Arc::new(echo))]);
//!     benchlink::rpc::serve_forever(targets, "127.0.0.1", 3251, None).await
//! }
//! ```

pub mod broadcast;
pub mod codec;
pub mod error;
pub mod keepalive;
pub mod rpc;
#[cfg(unix)]
pub mod signal;
pub mod supervisor;
pub mod task;
pub mod tls;

// Re-export commonly used types
pub use codec::Value;
pub use error::{Error, Result};
pub use rpc::{AsyncClient, Bind, Client, RpcServer, Target, TargetMap};
pub use supervisor::{ConnectionHandler, ConnectionSupervisor, ServerStream};
pub use task::SupervisedTask;
pub use tls::TlsSettings;

#[cfg(unix)]
pub use signal::{SignalBridge, Termination};

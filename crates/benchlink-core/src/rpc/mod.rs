//! Remote procedure calls over TCP/TLS.
//!
//! The server exposes named [`Target`]s; clients bind one target per
//! connection during the handshake and then exchange call envelopes. Two
//! clients share the wire contract: [`Client`] blocks the calling thread
//! per call, [`AsyncClient`] keeps any number of calls in flight on one
//! connection.

pub mod protocol;
pub mod target;

mod async_client;
mod server;
mod sync_client;

pub use async_client::AsyncClient;
pub use server::{RpcServer, TargetMap};
pub use sync_client::Client;
pub use target::{CallArgs, Fault, InvokeOutcome, Param, Target};

#[cfg(unix)]
pub use server::serve_forever;

/// How a client selects its target during the handshake.
#[derive(Debug, Clone, Copy)]
pub enum Bind<'a> {
    /// Bind the named target.
    Target(&'a str),
    /// Bind "the" target; valid only when the server registers exactly one.
    Auto,
    /// Connect without binding; the blocking client can select a target
    /// later with [`Client::select_target`].
    Deferred,
}

//! Blocking RPC client.
//!
//! One TCP/TLS connection with synchronous call semantics: every call
//! blocks the calling thread until its response has been read in full. The
//! client performs no multiplexing and is the one component in the crate
//! that uses ordinary blocking I/O.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use tracing::debug;

use crate::codec::Value;
use crate::error::{Error, Result};
use crate::keepalive;
use crate::rpc::protocol;
use crate::rpc::Bind;
use crate::tls::{self, TlsSettings};

enum Transport {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
        }
    }
}

struct MethodCatalog {
    names: HashSet<String>,
    listing: Value,
}

/// Synchronous RPC client.
pub struct Client {
    reader: BufReader<Transport>,
    bound: bool,
    methods: Option<MethodCatalog>,
    next_id: u64,
}

impl Client {
    /// Connect, verify the protocol banner, and bind the requested target.
    /// With [`Bind::Deferred`] the target is chosen later via
    /// [`select_target`](Self::select_target).
    pub fn connect(
        host: &str,
        port: u16,
        bind: Bind<'_>,
        tls_settings: Option<&TlsSettings>,
    ) -> Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        keepalive::set_keepalive(&stream)?;
        let transport = match tls_settings {
            None => Transport::Plain(stream),
            Some(settings) => {
                let config = tls::client_config(settings)?;
                let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                    .map_err(|e| Error::Config {
                        message: format!("invalid TLS server name '{host}': {e}"),
                    })?;
                let conn = rustls::ClientConnection::new(Arc::new(config), server_name)?;
                Transport::Tls(Box::new(rustls::StreamOwned::new(conn, stream)))
            }
        };
        let mut client = Self {
            reader: BufReader::new(transport),
            bound: false,
            methods: None,
            next_id: 1,
        };
        client.check_banner()?;
        match bind {
            Bind::Target(name) => client.bind(protocol::bind_request(name))?,
            Bind::Auto => client.bind(protocol::bind_auto_request())?,
            Bind::Deferred => {}
        }
        Ok(client)
    }

    /// Retrieve the names and descriptions of the targets a server exposes.
    /// Uses its own short-lived connection.
    pub fn scan_targets(
        host: &str,
        port: u16,
        tls_settings: Option<&TlsSettings>,
    ) -> Result<Vec<(String, String)>> {
        let mut client = Self::connect(host, port, Bind::Deferred, tls_settings)?;
        client.write(&protocol::list_targets_request())?;
        let reply = client.read_reply()?;
        protocol::parse_target_listing(&reply)
    }

    /// Bind a deferred connection to a named target.
    pub fn select_target(&mut self, name: &str) -> Result<()> {
        if self.bound {
            return Err(Error::Config {
                message: "a target is already selected on this connection".to_string(),
            });
        }
        self.bind(protocol::bind_request(name))
    }

    /// Invoke a remote method and block until the result arrives.
    ///
    /// Unknown method names fail locally against the cached catalog without
    /// a round trip; remote failures are re-raised with the original class,
    /// message, and traceback text.
    pub fn call(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value> {
        self.ensure_methods()?;
        let known = self
            .methods
            .as_ref()
            .map(|catalog| catalog.names.contains(name))
            .unwrap_or(false);
        if !known {
            return Err(Error::UnknownMethod {
                method: name.to_string(),
            });
        }
        let id = self.take_id();
        debug!(method = name, id, "calling");
        self.write(&protocol::call_request(id, name, args, kwargs))?;
        self.read_outcome(id, name)
    }

    /// The target's introspection catalog (cached after the first fetch).
    pub fn method_list(&mut self) -> Result<Value> {
        self.ensure_methods()?;
        self.methods
            .as_ref()
            .map(|catalog| catalog.listing.clone())
            .ok_or_else(|| Error::Config {
                message: "method catalog unavailable".to_string(),
            })
    }

    /// Issue the in-band terminate action.
    pub fn terminate(&mut self) -> Result<()> {
        self.require_bound()?;
        let id = self.take_id();
        self.write(&protocol::terminate_request(id))?;
        self.read_outcome(id, "terminate").map(|_| ())
    }

    /// Release the connection. Always safe, also after a remote error.
    pub fn close_rpc(self) {
        // Dropping the transport closes the socket.
    }

    fn check_banner(&mut self) -> Result<()> {
        let mut banner = String::new();
        self.reader.read_line(&mut banner)?;
        if banner != protocol::BANNER {
            return Err(Error::Handshake {
                message: format!("unexpected protocol banner {banner:?}"),
            });
        }
        Ok(())
    }

    fn bind(&mut self, request: Value) -> Result<()> {
        self.write(&request)?;
        let reply = self.read_reply()?;
        protocol::expect_handshake_ok(&reply)?;
        self.bound = true;
        Ok(())
    }

    fn require_bound(&self) -> Result<()> {
        if self.bound {
            Ok(())
        } else {
            Err(Error::Config {
                message: "no target selected on this connection".to_string(),
            })
        }
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn ensure_methods(&mut self) -> Result<()> {
        self.require_bound()?;
        if self.methods.is_some() {
            return Ok(());
        }
        let id = self.take_id();
        self.write(&protocol::method_list_request(id))?;
        let listing = self.read_outcome(id, "get_rpc_method_list")?;
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
        self.methods = Some(MethodCatalog { names, listing });
        Ok(())
    }

    fn write(&mut self, envelope: &Value) -> Result<()> {
        protocol::write_envelope_blocking(self.reader.get_mut(), envelope)
    }

    fn read_reply(&mut self) -> Result<Value> {
        protocol::read_envelope_blocking(&mut self.reader)?.ok_or_else(|| Error::Decode {
            offset: 0,
            message: "connection closed before a response was received".to_string(),
        })
    }

    fn read_outcome(&mut self, id: u64, method: &str) -> Result<Value> {
        let reply = self.read_reply()?;
        let response = protocol::parse_response(reply)?;
        if response.id != id {
            return Err(Error::Decode {
                offset: 0,
                message: format!(
                    "response for call {} arrived while waiting for call {id}",
                    response.id
                ),
            });
        }
        response
            .outcome
            .map_err(|exception| exception.into_error(method))
    }
}

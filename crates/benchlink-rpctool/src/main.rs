//! Command-line client for benchlink RPC servers.
//!
//! Connects to a running server to discover its targets, inspect a target's
//! methods, or invoke a method with positional arguments given as encoded
//! literals.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use benchlink::codec::{self, Value};
use benchlink::rpc::{AsyncClient, Bind, Client};
use benchlink::tls::TlsSettings;

#[derive(Parser, Debug)]
#[command(name = "benchlink-rpctool")]
#[command(about = "Inspect and call benchlink RPC servers")]
struct Args {
    /// Server host
    host: String,

    /// Server TCP port
    port: u16,

    #[command(subcommand)]
    command: Command,

    /// Local certificate for mutual TLS (enables TLS)
    #[arg(long, global = true)]
    local_cert: Option<PathBuf>,

    /// Local private key (required with --local-cert)
    #[arg(long, global = true)]
    local_key: Option<PathBuf>,

    /// Trusted server certificate (required with --local-cert)
    #[arg(long, global = true)]
    peer_cert: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the targets the server exposes
    ListTargets,
    /// List a target's callable methods with signatures and doc text
    ListMethods {
        /// Target name (omit to auto-select a sole target)
        target: Option<String>,
    },
    /// Invoke a method and print the decoded result
    Call {
        /// Target name (use "-" to auto-select a sole target)
        target: String,
        /// Method name
        method: String,
        /// Positional arguments as encoded literals, e.g. '5' '[1, 2]' '"text"'
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::WARN };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let tls_settings =
        TlsSettings::from_options(args.local_cert, args.local_key, args.peer_cert)
            .context("invalid TLS options")?;

    match args.command {
        Command::ListTargets => list_targets(args.host, args.port, tls_settings).await,
        Command::ListMethods { target } => {
            list_methods(&args.host, args.port, target.as_deref(), tls_settings.as_ref()).await
        }
        Command::Call {
            target,
            method,
            args: call_args,
        } => {
            call(
                &args.host,
                args.port,
                &target,
                &method,
                &call_args,
                tls_settings.as_ref(),
            )
            .await
        }
    }
}

async fn list_targets(host: String, port: u16, tls_settings: Option<TlsSettings>) -> Result<()> {
    // The discovery client is the blocking one; keep it off the runtime.
    let scan_host = host.clone();
    let targets = tokio::task::spawn_blocking(move || {
        Client::scan_targets(&scan_host, port, tls_settings.as_ref())
    })
    .await?
    .with_context(|| format!("cannot list targets on {host}:{port}"))?;
    if targets.is_empty() {
        println!("no targets registered");
        return Ok(());
    }
    for (name, description) in targets {
        if description.is_empty() {
            println!("{name}");
        } else {
            println!("{name}\t{description}");
        }
    }
    Ok(())
}

fn bind_for(target: Option<&str>) -> Bind<'_> {
    match target {
        Some("-") | None => Bind::Auto,
        Some(name) => Bind::Target(name),
    }
}

async fn list_methods(
    host: &str,
    port: u16,
    target: Option<&str>,
    tls_settings: Option<&TlsSettings>,
) -> Result<()> {
    let client = AsyncClient::connect(host, port, bind_for(target), tls_settings)
        .await
        .with_context(|| format!("cannot connect to {host}:{port}"))?;
    let listing = client.method_list().await?;
    let Some(entries) = listing.as_dict() else {
        bail!("server returned a malformed method catalog");
    };
    for (name, spec) in entries {
        let Some(name) = name.as_str() else { continue };
        let params: Vec<String> = spec
            .get("args")
            .and_then(Value::as_seq)
            .map(|args| {
                args.iter()
                    .filter_map(Value::as_str)
                    .map(|param| {
                        match spec.get("defaults").and_then(|d| d.get(param)) {
                            Some(default) => format!(
                                "{param}={}",
                                codec::encode(default).unwrap_or_else(|_| "?".to_string())
                            ),
                            None => param.to_string(),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        println!("{name}({})", params.join(", "));
        if let Some(doc) = spec.get("doc").and_then(Value::as_str) {
            for line in doc.lines() {
                println!("    {line}");
            }
        }
    }
    client.close_rpc().await;
    Ok(())
}

async fn call(
    host: &str,
    port: u16,
    target: &str,
    method: &str,
    raw_args: &[String],
    tls_settings: Option<&TlsSettings>,
) -> Result<()> {
    let mut args = Vec::with_capacity(raw_args.len());
    for (i, raw) in raw_args.iter().enumerate() {
        let value = codec::decode(raw)
            .with_context(|| format!("argument {} is not a valid literal: {raw:?}", i + 1))?;
        args.push(value);
    }

    let client = AsyncClient::connect(host, port, bind_for(Some(target)), tls_settings)
        .await
        .with_context(|| format!("cannot connect to {host}:{port}"))?;
    let result = client.call(method, args, vec![]).await;
    client.close_rpc().await;

    match result {
        Ok(value) => {
            println!("{}", codec::encode(&value)?);
            Ok(())
        }
        Err(benchlink::Error::RemoteFault {
            class,
            message,
            traceback,
        }) => {
            eprintln!("remote call raised {class}: {message}");
            if !traceback.is_empty() {
                eprintln!("{traceback}");
            }
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

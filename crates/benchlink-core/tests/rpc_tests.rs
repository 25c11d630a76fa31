//! End-to-end tests for the RPC server and both clients over real sockets.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use benchlink::codec::Value;
use benchlink::rpc::{AsyncClient, Bind, Client, Fault, Param, RpcServer, Target, TargetMap};
use benchlink::tls::TlsSettings;
use benchlink::Error;

/// The representative nested object from the call-correctness property:
/// null, booleans, a float, a mapping with a non-string key, tuples of both
/// arities, and a string with embedded quote/newline characters.
fn test_object() -> Value {
    Value::List(vec![
        Value::Int(5),
        Value::Float(2.1),
        Value::None,
        Value::Bool(true),
        Value::Bool(false),
        Value::Dict(vec![
            (Value::from("a"), Value::Int(5)),
            (Value::Int(2), Value::List(vec![Value::Float(0.0)])),
        ]),
        Value::Tuple(vec![Value::Int(4), Value::Int(5)]),
        Value::Tuple(vec![Value::Int(10)]),
        Value::from("ab\nx\"'"),
    ])
}

fn echo_targets() -> TargetMap {
    let echo = Target::new("echo test target")
        .method(
            "echo",
            vec![Param::required("x")],
            "Return the argument unchanged.",
            |call| async move { Ok(call.args.into_iter().next().unwrap_or(Value::None)) },
        )
        .method(
            "async_echo",
            vec![Param::required("x")],
            "Return the argument unchanged, after suspending once.",
            |call| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(call.args.into_iter().next().unwrap_or(Value::None))
            },
        )
        .method("return_unserializable", vec![], "", |_| async move {
            Ok(Value::Opaque("Echo instance".to_string()))
        })
        .method("fail", vec![], "", |_| async move {
            Err(Fault::new("ValueError", "deliberate failure"))
        })
        .method("block_forever", vec![], "", |_| async move {
            std::future::pending::<()>().await;
            Ok(Value::None)
        });
    TargetMap::from([("test".to_string(), Arc::new(echo))])
}

async fn start_echo_server(builtin_terminate: bool) -> (RpcServer, u16) {
    let mut server = RpcServer::new(echo_targets(), builtin_terminate);
    let addr = server.start("127.0.0.1", 0, None).await.unwrap();
    (server, addr.port())
}

#[tokio::test]
async fn test_blocking_echo() {
    let (mut server, port) = start_echo_server(false).await;

    let result = tokio::task::spawn_blocking(move || {
        let mut client = Client::connect("127.0.0.1", port, Bind::Target("test"), None).unwrap();
        let back = client
            .call("echo", vec![test_object()], vec![])
            .unwrap();
        assert_eq!(back, test_object());
        let back = client
            .call("async_echo", vec![test_object()], vec![])
            .unwrap();
        assert_eq!(back, test_object());

        let err = client.call("non_existing_method", vec![], vec![]).unwrap_err();
        assert!(matches!(err, Error::UnknownMethod { .. }));

        // The connection is still usable after the local error.
        let back = client.call("echo", vec![Value::Int(1)], vec![]).unwrap();
        assert_eq!(back, Value::Int(1));
        client.close_rpc();
    })
    .await;
    result.unwrap();

    server.stop().await;
}

#[tokio::test]
async fn test_blocking_auto_target_and_deferred_bind() {
    let (mut server, port) = start_echo_server(false).await;

    tokio::task::spawn_blocking(move || {
        let mut client = Client::connect("127.0.0.1", port, Bind::Auto, None).unwrap();
        let back = client.call("echo", vec![Value::Int(7)], vec![]).unwrap();
        assert_eq!(back, Value::Int(7));
        client.close_rpc();

        let mut client = Client::connect("127.0.0.1", port, Bind::Deferred, None).unwrap();
        let err = client.call("echo", vec![Value::Int(1)], vec![]).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        client.select_target("test").unwrap();
        let back = client.call("echo", vec![Value::Int(8)], vec![]).unwrap();
        assert_eq!(back, Value::Int(8));
        client.close_rpc();
    })
    .await
    .unwrap();

    server.stop().await;
}

#[tokio::test]
async fn test_blocking_remote_fault_carries_class_and_message() {
    let (mut server, port) = start_echo_server(false).await;

    tokio::task::spawn_blocking(move || {
        let mut client = Client::connect("127.0.0.1", port, Bind::Target("test"), None).unwrap();
        match client.call("fail", vec![], vec![]).unwrap_err() {
            Error::RemoteFault {
                class,
                message,
                traceback,
            } => {
                assert_eq!(class, "ValueError");
                assert_eq!(message, "deliberate failure");
                assert!(traceback.contains("fail"));
            }
            other => panic!("expected RemoteFault, got {other:?}"),
        }
        // A remote fault does not poison the connection.
        let back = client.call("echo", vec![Value::Int(2)], vec![]).unwrap();
        assert_eq!(back, Value::Int(2));
        client.close_rpc();
    })
    .await
    .unwrap();

    server.stop().await;
}

#[tokio::test]
async fn test_asyncio_echo() {
    let (mut server, port) = start_echo_server(false).await;

    let client = AsyncClient::connect("127.0.0.1", port, Bind::Target("test"), None)
        .await
        .unwrap();
    let back = client.call("echo", vec![test_object()], vec![]).await.unwrap();
    assert_eq!(back, test_object());
    let back = client
        .call("async_echo", vec![test_object()], vec![])
        .await
        .unwrap();
    assert_eq!(back, test_object());

    let err = client
        .call("return_unserializable", vec![], vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unserializable { .. }));

    // The connection survives the unserializable return.
    let back = client.call("echo", vec![Value::Int(3)], vec![]).await.unwrap();
    assert_eq!(back, Value::Int(3));

    let err = client
        .call("non_existing_method", vec![], vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownMethod { .. }));

    client.close_rpc().await;
    server.stop().await;
}

#[tokio::test]
async fn test_asyncio_auto_target() {
    let (mut server, port) = start_echo_server(false).await;
    let client = AsyncClient::connect("127.0.0.1", port, Bind::Auto, None)
        .await
        .unwrap();
    let back = client.call("echo", vec![Value::Int(9)], vec![]).await.unwrap();
    assert_eq!(back, Value::Int(9));
    client.close_rpc().await;
    server.stop().await;

    // With two targets registered, auto binding is a handshake error.
    let mut targets = echo_targets();
    targets.insert("other".to_string(), Arc::new(Target::new("second target")));
    let mut server = RpcServer::new(targets, false);
    let addr = server.start("127.0.0.1", 0, None).await.unwrap();
    let err = AsyncClient::connect("127.0.0.1", addr.port(), Bind::Auto, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Handshake { .. }));
    server.stop().await;
}

#[tokio::test]
async fn test_terminate_action() {
    let (mut server, port) = start_echo_server(true).await;
    let client = AsyncClient::connect("127.0.0.1", port, Bind::Target("test"), None)
        .await
        .unwrap();
    client.terminate().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), server.wait_terminate())
        .await
        .expect("terminate should be observed");
    client.close_rpc().await;
    server.stop().await;
}

#[tokio::test]
async fn test_scan_targets() {
    let (mut server, port) = start_echo_server(false).await;
    let targets = tokio::task::spawn_blocking(move || {
        Client::scan_targets("127.0.0.1", port, None).unwrap()
    })
    .await
    .unwrap();
    assert_eq!(
        targets,
        vec![("test".to_string(), "echo test target".to_string())]
    );
    server.stop().await;
}

#[tokio::test]
async fn test_stop_drains_in_flight_calls_and_releases_port() {
    let (mut server, port) = start_echo_server(false).await;

    // Several calls parked inside a method that never returns.
    let mut clients = Vec::new();
    let mut calls = Vec::new();
    for _ in 0..4 {
        let client = Arc::new(
            AsyncClient::connect("127.0.0.1", port, Bind::Target("test"), None)
                .await
                .unwrap(),
        );
        let call_client = client.clone();
        calls.push(tokio::spawn(async move {
            call_client.call("block_forever", vec![], vec![]).await
        }));
        clients.push(client);
    }
    // Let the calls reach the server.
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.stop().await;

    // Every in-flight call fails rather than hangs.
    for call in calls {
        let result = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .expect("call must resolve after stop")
            .unwrap();
        assert!(result.is_err());
    }

    // The exact port is immediately bindable again.
    let mut again = RpcServer::new(echo_targets(), false);
    again.start("127.0.0.1", port, None).await.unwrap();
    again.stop().await;
}

#[tokio::test]
async fn test_concurrent_calls_resolve_out_of_order() {
    // A hand-rolled server that answers two calls in reverse issue order;
    // correlation must hold by call identity, not arrival order.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        use benchlink::rpc::protocol;

        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        writer.write_all(protocol::BANNER.as_bytes()).await.unwrap();
        let _bind = protocol::read_envelope(&mut reader).await.unwrap().unwrap();
        protocol::write_envelope(&mut writer, &protocol::handshake_ok())
            .await
            .unwrap();

        // Method catalog fetch comes first.
        let catalog_req = protocol::read_envelope(&mut reader).await.unwrap().unwrap();
        let catalog_id = catalog_req.get("id").and_then(Value::as_int).unwrap() as u64;
        let catalog = Value::Dict(vec![(
            Value::from("describe"),
            Value::Dict(vec![
                (Value::from("args"), Value::List(vec![Value::from("x")])),
                (Value::from("defaults"), Value::Dict(vec![])),
                (Value::from("doc"), Value::None),
            ]),
        )]);
        protocol::write_envelope(&mut writer, &protocol::ok_response(catalog_id, catalog))
            .await
            .unwrap();

        // Read both calls, then answer them newest-first.
        let first = protocol::read_envelope(&mut reader).await.unwrap().unwrap();
        let second = protocol::read_envelope(&mut reader).await.unwrap().unwrap();
        for request in [second, first] {
            let id = request.get("id").and_then(Value::as_int).unwrap() as u64;
            let arg = request
                .get("args")
                .and_then(Value::as_seq)
                .and_then(|args| args.first())
                .cloned()
                .unwrap();
            protocol::write_envelope(&mut writer, &protocol::ok_response(id, arg))
                .await
                .unwrap();
        }
        // Hold the connection open until the client is done.
        let mut sink = String::new();
        let _ = reader.read_line(&mut sink).await;
    });

    let client = Arc::new(
        AsyncClient::connect("127.0.0.1", port, Bind::Target("whatever"), None)
            .await
            .unwrap(),
    );
    let a = {
        let client = client.clone();
        tokio::spawn(async move { client.call("describe", vec![Value::from("first")], vec![]).await })
    };
    let b = {
        let client = client.clone();
        tokio::spawn(async move { client.call("describe", vec![Value::from("second")], vec![]).await })
    };
    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();
    assert_eq!(a, Value::from("first"));
    assert_eq!(b, Value::from("second"));

    server.abort();
    let _ = server.await;
}

#[tokio::test]
async fn test_server_dying_mid_reply_is_a_decode_error() {
    // The "server" reads one call and drops the connection after writing
    // half an envelope.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        use benchlink::rpc::protocol;

        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        writer.write_all(protocol::BANNER.as_bytes()).await.unwrap();
        let _bind = protocol::read_envelope(&mut reader).await.unwrap();
        protocol::write_envelope(&mut writer, &protocol::handshake_ok())
            .await
            .unwrap();
        let _request = protocol::read_envelope(&mut reader).await.unwrap();
        writer.write_all(b"{\"status\": \"ok\"").await.unwrap();
        writer.flush().await.unwrap();
        // Dropping both halves closes the socket mid-envelope.
    });

    let client = AsyncClient::connect("127.0.0.1", port, Bind::Target("test"), None)
        .await
        .unwrap();
    let err = client
        .call("anything", vec![], vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Decode { .. }), "got {err:?}");

    // Later calls fail fast on the dead connection.
    let err = client.call("anything", vec![], vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Dead { .. } | Error::Decode { .. }));
    client.close_rpc().await;
}

#[tokio::test]
async fn test_blocking_client_eof_before_response() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        use benchlink::rpc::protocol;

        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        writer.write_all(protocol::BANNER.as_bytes()).await.unwrap();
        let _bind = protocol::read_envelope(&mut reader).await.unwrap();
        protocol::write_envelope(&mut writer, &protocol::handshake_ok())
            .await
            .unwrap();
        // Read the catalog request, then vanish without answering.
        let _request = protocol::read_envelope(&mut reader).await.unwrap();
    });

    tokio::task::spawn_blocking(move || {
        let mut client = Client::connect("127.0.0.1", port, Bind::Target("test"), None).unwrap();
        let err = client.call("echo", vec![Value::Int(1)], vec![]).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }), "got {err:?}");
        client.close_rpc();
    })
    .await
    .unwrap();
}

// TLS support.

struct CertFiles {
    cert: PathBuf,
    key: PathBuf,
}

/// Self-signed certificate usable both as an end-entity certificate and as
/// the sole trust anchor of the other side, the way the deployment docs
/// describe generating them with openssl.
fn make_cert(dir: &std::path::Path, stem: &str) -> CertFiles {
    let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    params.is_ca = rcgen::IsCa::NoCa;
    params.extended_key_usages = vec![
        rcgen::ExtendedKeyUsagePurpose::ServerAuth,
        rcgen::ExtendedKeyUsagePurpose::ClientAuth,
    ];
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();

    let cert_path = dir.join(format!("{stem}.pem"));
    let key_path = dir.join(format!("{stem}.key"));
    std::fs::File::create(&cert_path)
        .unwrap()
        .write_all(cert.pem().as_bytes())
        .unwrap();
    std::fs::File::create(&key_path)
        .unwrap()
        .write_all(key.serialize_pem().as_bytes())
        .unwrap();
    CertFiles {
        cert: cert_path,
        key: key_path,
    }
}

struct TlsFixture {
    _dir: tempfile::TempDir,
    server: TlsSettings,
    client: TlsSettings,
    wrong_client: TlsSettings,
    wrong_trust: TlsSettings,
}

fn tls_fixture() -> TlsFixture {
    let dir = tempfile::tempdir().unwrap();
    let server = make_cert(dir.path(), "server");
    let client = make_cert(dir.path(), "client");
    let stranger = make_cert(dir.path(), "stranger");

    TlsFixture {
        _dir: dir,
        server: TlsSettings::new(&server.cert, &server.key, &client.cert),
        client: TlsSettings::new(&client.cert, &client.key, &server.cert),
        // Presents a certificate the server does not trust.
        wrong_client: TlsSettings::new(&stranger.cert, &stranger.key, &server.cert),
        // Trusts a certificate the server does not present.
        wrong_trust: TlsSettings::new(&client.cert, &client.key, &stranger.cert),
    }
}

#[tokio::test]
async fn test_tls_echo_matches_plaintext_behavior() {
    let fixture = tls_fixture();
    let mut server = RpcServer::new(echo_targets(), false);
    let addr = server
        .start("localhost", 0, Some(&fixture.server))
        .await
        .unwrap();
    let port = addr.port();

    let client = AsyncClient::connect("localhost", port, Bind::Target("test"), Some(&fixture.client))
        .await
        .unwrap();
    let back = client.call("echo", vec![test_object()], vec![]).await.unwrap();
    assert_eq!(back, test_object());
    let err = client
        .call("non_existing_method", vec![], vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownMethod { .. }));
    client.close_rpc().await;

    // The blocking client speaks the same TLS configuration.
    let blocking_settings = fixture.client.clone();
    tokio::task::spawn_blocking(move || {
        let mut client =
            Client::connect("localhost", port, Bind::Target("test"), Some(&blocking_settings))
                .unwrap();
        let back = client.call("echo", vec![Value::Int(11)], vec![]).unwrap();
        assert_eq!(back, Value::Int(11));
        client.close_rpc();
    })
    .await
    .unwrap();

    server.stop().await;
}

#[tokio::test]
async fn test_tls_verification_failures() {
    let fixture = tls_fixture();
    let mut server = RpcServer::new(echo_targets(), false);
    let addr = server
        .start("localhost", 0, Some(&fixture.server))
        .await
        .unwrap();
    let port = addr.port();

    // Client trusts the wrong server certificate: verification fails on the
    // client side.
    let result =
        AsyncClient::connect("localhost", port, Bind::Target("test"), Some(&fixture.wrong_trust))
            .await;
    assert!(result.is_err());

    // Client presents a certificate the server does not trust: the server
    // rejects the handshake and the session never reaches binding.
    let result =
        AsyncClient::connect("localhost", port, Bind::Target("test"), Some(&fixture.wrong_client))
            .await;
    assert!(result.is_err());

    // A failed handshake leaves the server serving properly configured
    // clients.
    let client = AsyncClient::connect("localhost", port, Bind::Target("test"), Some(&fixture.client))
        .await
        .unwrap();
    let back = client.call("echo", vec![Value::Int(12)], vec![]).await.unwrap();
    assert_eq!(back, Value::Int(12));
    client.close_rpc().await;

    server.stop().await;
}

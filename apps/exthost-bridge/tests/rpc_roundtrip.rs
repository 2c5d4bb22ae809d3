use std::sync::Arc;
use std::time::Duration;

use exthost_bridge::rpc::{reply, HandlerError, MethodTable, RpcConfig, RpcError, RpcProtocol};
use exthost_bridge::transform::{
    AuthorityRemap, IdentityTransformer, Namespace, ParamType, Uri, UriTransformer,
};
use exthost_bridge::transport::{
    connect, PersistentProtocol, ProtocolConfig, SocketTransport, TransportConfig,
};
use exthost_protocol::RemoteErrorKind;
use serde_json::{json, Value};

const WAIT: Duration = Duration::from_secs(5);
const FILES: &str = "MainThreadFiles";

struct Pair {
    _transport: SocketTransport,
    host: RpcProtocol,
    worker: RpcProtocol,
}

/// Host and worker RPC layers joined over a real loopback socket.
async fn pair(host_transformer: Arc<dyn UriTransformer>) -> Pair {
    let config = TransportConfig {
        socket_dir: std::env::temp_dir(),
        force_tcp: true,
    };
    let mut transport = SocketTransport::start(&config, "rpc-roundtrip").unwrap();
    let address = transport.address().clone();
    let (accepted, dialed) = tokio::join!(transport.accept(WAIT), connect(&address));

    let (host_protocol, host_frames) = PersistentProtocol::new(ProtocolConfig::default());
    host_protocol.attach(accepted.unwrap()).unwrap();
    let (worker_protocol, worker_frames) = PersistentProtocol::new(ProtocolConfig::default());
    worker_protocol.attach(dialed.unwrap()).unwrap();

    Pair {
        _transport: transport,
        host: RpcProtocol::new(host_protocol, host_frames, host_transformer, RpcConfig::default()),
        worker: RpcProtocol::new(
            worker_protocol,
            worker_frames,
            Arc::new(IdentityTransformer),
            RpcConfig::default(),
        ),
    }
}

fn files_table() -> MethodTable {
    MethodTable::new()
        .method("resolve", &[ParamType::Uri], |inv| async move {
            let uri = inv.args.uri(0)?;
            if uri.scheme != "file" {
                return Err(HandlerError::failed(format!("not a local uri: {uri}")));
            }
            reply(Uri::new("file", "", format!("{}.resolved", uri.path)))
        })
        .method(
            "describe",
            &[ParamType::Int, ParamType::Bool, ParamType::String],
            |inv| async move {
                reply(json!({
                    "line": inv.args.i32(0)?,
                    "dirty": inv.args.bool(1)?,
                    "label": inv.args.string(2)?,
                }))
            },
        )
}

#[test_timeout::tokio_timeout_test(secs = 10)]
async fn remote_uris_are_mapped_at_the_host_boundary() {
    let remap: Arc<dyn UriTransformer> = Arc::new(AuthorityRemap {
        local: Namespace::new("file", ""),
        remote: Namespace::new("vscode-remote", "ssh-remote+box"),
    });
    let pair = pair(remap).await;
    pair.host.register_methods(FILES, files_table());

    let remote = Uri::parse("vscode-remote://ssh-remote+box/home/me/a.rs").unwrap();
    let mut argument = remote.to_value();
    argument["fsPath"] = json!("/home/me/a.rs");
    let resolved: Uri = pair
        .worker
        .proxy(FILES)
        .call("resolve", vec![argument])
        .into_typed()
        .await
        .unwrap();
    assert_eq!(resolved.scheme, "vscode-remote");
    assert_eq!(resolved.authority, "ssh-remote+box");
    assert_eq!(resolved.path, "/home/me/a.rs.resolved");
}

#[test_timeout::tokio_timeout_test(secs = 10)]
async fn numeric_arguments_are_coerced_to_declared_types() {
    let pair = pair(Arc::new(IdentityTransformer)).await;
    pair.host.register_methods(FILES, files_table());

    let described = pair
        .worker
        .proxy(FILES)
        .call("describe", vec![json!(3.0), json!(0.0)])
        .await
        .unwrap();
    assert_eq!(described, json!({"line": 3, "dirty": false, "label": ""}));

    let described = pair
        .worker
        .proxy(FILES)
        .call("describe", vec![json!(7), json!(2.5), json!("x")])
        .await
        .unwrap();
    assert_eq!(described, json!({"line": 7, "dirty": true, "label": "x"}));

    let err = pair
        .worker
        .proxy(FILES)
        .call("describe", vec![json!(1.5)])
        .await
        .unwrap_err();
    assert_eq!(err.remote_kind(), Some(RemoteErrorKind::InvalidArguments));
}

#[test_timeout::tokio_timeout_test(secs = 10)]
async fn failures_do_not_poison_the_connection() {
    let pair = pair(Arc::new(IdentityTransformer)).await;
    pair.host.register_methods(FILES, files_table());

    let err = pair
        .worker
        .proxy(FILES)
        .call("resolve", vec![Uri::new("untitled", "", "Untitled-1").to_value()])
        .await
        .unwrap_err();
    assert_eq!(err.remote_kind(), Some(RemoteErrorKind::HandlerFailed));
    assert_ne!(err, RpcError::Disconnected);

    let missing = pair
        .worker
        .proxy("MainThreadNobody")
        .call("anything", Vec::new())
        .await
        .unwrap_err();
    assert_eq!(missing.remote_kind(), Some(RemoteErrorKind::UnknownIdentifier));

    let resolved = pair
        .worker
        .proxy(FILES)
        .call("resolve", vec![Uri::file("/tmp/b.rs").to_value()])
        .await
        .unwrap();
    assert_eq!(resolved["path"], Value::from("/tmp/b.rs.resolved"));
    assert_eq!(pair.worker.pending_len(), 0);
}

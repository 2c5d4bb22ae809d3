#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use exthost_bridge::config::BridgeConfig;
use exthost_bridge::process::{OutputStream, WorkerExit};
use exthost_bridge::rpc::registry::{
    ConsoleService, PingService, Pong, EXT_HOST_PING, MAIN_THREAD_CONSOLE, PING,
};
use exthost_bridge::rpc::{HandlerError, RpcConfig, RpcProtocol};
use exthost_bridge::session::{ExtensionHostSession, SessionError};
use exthost_bridge::transform::IdentityTransformer;
use exthost_bridge::transport::{PersistentProtocol, ProtocolConfig, TransportError};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Default)]
struct RecordingConsole {
    lines: Mutex<Vec<(i32, String)>>,
}

#[async_trait]
impl ConsoleService for RecordingConsole {
    async fn log(&self, level: i32, message: String) -> Result<(), HandlerError> {
        self.lines.lock().push((level, message));
        Ok(())
    }
}

fn stub_config(socket_dir: &Path, args: &[&str]) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.worker.program = PathBuf::from(env!("CARGO_BIN_EXE_exthost-stub"));
    config.worker.args = args.iter().map(|arg| arg.to_string()).collect();
    config.worker.stop_grace = Duration::from_secs(2);
    config.transport.socket_dir = socket_dir.to_path_buf();
    config.context_hint = "end-to-end".into();
    config
}

async fn wait_for_exit(mut exit: watch::Receiver<Option<WorkerExit>>) -> WorkerExit {
    tokio::time::timeout(Duration::from_secs(10), exit.wait_for(Option::is_some))
        .await
        .expect("runtime exits")
        .expect("exit published")
        .clone()
        .expect("exit present")
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[test_timeout::tokio_timeout_test(secs = 20)]
async fn stub_pings_host_and_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let console = Arc::new(RecordingConsole::default());
    let console_service: Arc<dyn ConsoleService> = console.clone();
    // The runtime exits non-zero unless its Ping resolves within a second.
    let config = stub_config(dir.path(), &["--ping-timeout-ms", "1000"]);
    let mut session = ExtensionHostSession::start(config, move |rpc| {
        let ping: Arc<dyn PingService> = Arc::new(Pong);
        rpc.set(&PING, ping);
        rpc.set(&MAIN_THREAD_CONSOLE, console_service);
    })
    .await
    .expect("session starts");

    let exit = wait_for_exit(session.worker_exit().expect("spawned worker")).await;
    assert_eq!(exit.code, Some(0));
    assert!(!exit.expected);
    assert!(session
        .recent_worker_output()
        .iter()
        .any(|output| output.stream == OutputStream::Stdout && output.line == "pong"));
    assert!(eventually(|| !console.lines.lock().is_empty()).await);
    assert_eq!(console.lines.lock()[0].0, 2);

    // The runtime leaving on its own is fatal for the session.
    let rpc = session.rpc().clone();
    assert!(eventually(|| rpc.is_disposed()).await);
    session.stop().await;
}

#[test_timeout::tokio_timeout_test(secs = 20)]
async fn stub_reports_mismatched_ping_result() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = ExtensionHostSession::start(
        stub_config(dir.path(), &["--expect", "something-else"]),
        |rpc| {
            let ping: Arc<dyn PingService> = Arc::new(Pong);
            rpc.set(&PING, ping);
        },
    )
    .await
    .expect("session starts");

    let exit = wait_for_exit(session.worker_exit().expect("spawned worker")).await;
    assert_eq!(exit.code, Some(1));
    session.stop().await;
}

#[test_timeout::tokio_timeout_test(secs = 20)]
async fn host_calls_into_serving_runtime_and_stops_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = ExtensionHostSession::start(stub_config(dir.path(), &["--serve"]), |rpc| {
        let ping: Arc<dyn PingService> = Arc::new(Pong);
        rpc.set(&PING, ping);
    })
    .await
    .expect("session starts");

    // Its own ping completing means the runtime has registered its services.
    assert!(
        eventually(|| session
            .recent_worker_output()
            .iter()
            .any(|output| output.line == "pong"))
        .await
    );
    let answer = tokio::time::timeout(
        Duration::from_secs(5),
        session.rpc().get_proxy(&EXT_HOST_PING).ping(),
    )
    .await
    .expect("reply in time")
    .expect("ping succeeds");
    assert_eq!(answer, "pong");

    let exit = session.worker_exit().expect("spawned worker");
    session.stop().await;
    assert!(session.rpc().is_disposed());
    let exit = exit.borrow().clone().expect("stop waits for exit");
    assert!(exit.expected);

    // Stopping twice is harmless.
    session.stop().await;
}

#[test_timeout::tokio_timeout_test(secs = 10)]
async fn runtime_exiting_before_connect_fails_start() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = BridgeConfig::default();
    config.worker.program = PathBuf::from("sh");
    // The address lands in `$0`.
    config.worker.args = vec!["-c".into(), "exit 3".into()];
    config.transport.socket_dir = dir.path().to_path_buf();

    let result = ExtensionHostSession::start(config, |_| {}).await;
    match result {
        Err(SessionError::WorkerExitedEarly(exit)) => assert_eq!(exit.code, Some(3)),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("session should not start"),
    }
}

#[test_timeout::tokio_timeout_test(secs = 10)]
async fn silent_runtime_hits_connect_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = BridgeConfig::default();
    config.worker.program = PathBuf::from("sh");
    config.worker.args = vec!["-c".into(), "sleep 30".into()];
    config.worker.stop_grace = Duration::from_millis(500);
    config.transport.socket_dir = dir.path().to_path_buf();
    config.connect_timeout = Duration::from_millis(200);

    let result = ExtensionHostSession::start(config, |_| {}).await;
    assert!(matches!(
        result,
        Err(SessionError::Transport(TransportError::AcceptTimeout(_)))
    ));
}

#[test_timeout::tokio_timeout_test(secs = 10)]
async fn missing_runtime_is_a_process_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = BridgeConfig::default();
    config.worker.program = PathBuf::from("exthost-runtime-that-does-not-exist");
    config.transport.socket_dir = dir.path().to_path_buf();

    let result = ExtensionHostSession::start(config, |_| {}).await;
    assert!(matches!(result, Err(SessionError::Process(_))));
}

#[test_timeout::tokio_timeout_test(secs = 10)]
async fn debug_connect_attaches_to_external_runtime() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let runtime = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (protocol, frames) = PersistentProtocol::new(ProtocolConfig::default());
        protocol.attach(Box::new(stream)).unwrap();
        let rpc = RpcProtocol::new(
            protocol,
            frames,
            Arc::new(IdentityTransformer),
            RpcConfig::default(),
        );
        let answer = rpc.get_proxy(&PING).ping().await;
        rpc.dispose();
        answer
    });

    let mut config = BridgeConfig::default();
    config.debug_connect = Some(addr);
    let mut session = ExtensionHostSession::start(config, |rpc| {
        let ping: Arc<dyn PingService> = Arc::new(Pong);
        rpc.set(&PING, ping);
    })
    .await
    .expect("session connects");
    assert!(session.worker_exit().is_none());

    assert_eq!(runtime.await.unwrap().unwrap(), "pong");
    session.stop().await;
}

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use exthost_bridge::transport::{
    connect, BoxedStream, FrameReceiver, PersistentProtocol, ProtocolConfig, ProtocolError,
    ProtocolEvent, ProtocolState, ReconnectSink, SocketTransport, TransportConfig,
};
use tokio::io::{duplex, AsyncReadExt, DuplexStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Puts a relay between the protocol and the socket so the test can drop
/// the link without telling either side.
fn severable(stream: BoxedStream) -> (DuplexStream, JoinHandle<()>) {
    let (local, mut relay_end) = duplex(64 * 1024);
    let relay = tokio::spawn(async move {
        let mut stream = stream;
        let _ = tokio::io::copy_bidirectional(&mut relay_end, &mut stream).await;
    });
    (local, relay)
}

async fn wait_for(
    events: &mut broadcast::Receiver<ProtocolEvent>,
    matches: impl Fn(&ProtocolEvent) -> bool,
) -> ProtocolEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event in time")
}

async fn recv_n(frames: &mut FrameReceiver, n: usize) -> Vec<Bytes> {
    let mut received = Vec::with_capacity(n);
    while received.len() < n {
        let frame = timeout(WAIT, frames.recv())
            .await
            .expect("frame in time")
            .expect("receiver open");
        received.push(frame);
    }
    received
}

struct Link {
    transport: SocketTransport,
    host: PersistentProtocol,
    host_frames: FrameReceiver,
    client: PersistentProtocol,
    client_frames: FrameReceiver,
    relay: JoinHandle<()>,
}

async fn link(dir: &std::path::Path, host_config: ProtocolConfig) -> Link {
    let config = TransportConfig {
        socket_dir: dir.to_path_buf(),
        force_tcp: false,
    };
    let mut transport = SocketTransport::start(&config, "resume").unwrap();
    let address = transport.address().clone();
    let (accepted, dialed) = tokio::join!(transport.accept(WAIT), connect(&address));

    let (host, host_frames) = PersistentProtocol::new(host_config);
    host.attach(accepted.unwrap()).unwrap();
    let sink: Arc<dyn ReconnectSink> = Arc::new(host.clone());
    transport.serve_reconnects(sink).unwrap();

    let (client, client_frames) = PersistentProtocol::new(ProtocolConfig::default());
    let (local, relay) = severable(dialed.unwrap());
    client.attach(Box::new(local)).unwrap();
    Link {
        transport,
        host,
        host_frames,
        client,
        client_frames,
        relay,
    }
}

#[test_timeout::tokio_timeout_test(secs = 20)]
async fn frames_written_during_gap_arrive_once_after_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let mut link = link(dir.path(), ProtocolConfig::default()).await;
    let mut host_events = link.host.subscribe();

    link.host.write(Bytes::from_static(b"one")).unwrap();
    link.host.write(Bytes::from_static(b"two")).unwrap();
    assert_eq!(
        recv_n(&mut link.client_frames, 2).await,
        vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
    );

    link.relay.abort();
    wait_for(&mut host_events, |event| {
        matches!(event, ProtocolEvent::Disconnected { .. })
    })
    .await;
    assert_eq!(link.host.state(), ProtocolState::AwaitingReconnect);

    link.host.write(Bytes::from_static(b"three")).unwrap();
    link.host.write(Bytes::from_static(b"four")).unwrap();
    assert!(link.host.unacknowledged_len() >= 2);

    let address = link.transport.address().clone();
    let (local, _relay) = severable(connect(&address).await.unwrap());
    link.client.attach(Box::new(local)).unwrap();

    let resumed = wait_for(&mut host_events, |event| {
        matches!(event, ProtocolEvent::Connected { .. })
    })
    .await;
    assert!(matches!(resumed, ProtocolEvent::Connected { resumed: true, .. }));
    assert_eq!(
        recv_n(&mut link.client_frames, 2).await,
        vec![Bytes::from_static(b"three"), Bytes::from_static(b"four")]
    );
    assert!(timeout(Duration::from_millis(200), link.client_frames.recv())
        .await
        .is_err());

    link.client.write(Bytes::from_static(b"back")).unwrap();
    assert_eq!(
        recv_n(&mut link.host_frames, 1).await,
        vec![Bytes::from_static(b"back")]
    );

    link.client.disconnect();
    wait_for(&mut host_events, |event| matches!(event, ProtocolEvent::PeerClosed)).await;
    link.transport.stop();
}

#[test_timeout::tokio_timeout_test(secs = 10)]
async fn extra_connection_is_dropped_while_connected() {
    let dir = tempfile::tempdir().unwrap();
    let link = link(dir.path(), ProtocolConfig::default()).await;

    let mut intruder = connect(link.transport.address()).await.unwrap();
    let mut buf = [0u8; 16];
    let read = timeout(WAIT, intruder.read(&mut buf)).await.expect("closed in time");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(link.host.state(), ProtocolState::Connected);
}

#[test_timeout::tokio_timeout_test(secs = 10)]
async fn missed_grace_period_fails_the_host() {
    let dir = tempfile::tempdir().unwrap();
    let config = ProtocolConfig {
        reconnection_grace: Duration::from_millis(200),
        ..ProtocolConfig::default()
    };
    let mut link = link(dir.path(), config).await;
    let mut host_events = link.host.subscribe();

    link.relay.abort();
    wait_for(&mut host_events, |event| matches!(event, ProtocolEvent::Failed { .. })).await;
    assert_eq!(link.host.state(), ProtocolState::Failed);
    assert!(matches!(
        link.host.write(Bytes::from_static(b"late")),
        Err(ProtocolError::Failed(_))
    ));
    let drained = timeout(WAIT, link.host_frames.recv()).await.expect("receiver closes");
    assert!(drained.is_none());
}
